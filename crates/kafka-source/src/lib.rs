//! Pull-based, checkpointable Kafka source.
//!
//! This crate provides:
//! - [`KafkaSource`], exposing `read`, `ack`, `pending` and `close` over one
//!   topic consumed as a member of a consumer group
//! - Declarative configuration ([`Config`]) and the resolution of its TLS and
//!   SASL settings from mounted secrets ([`TransportConfig`])
//! - The consumer-group and cluster-admin seams ([`ConsumerGroup`],
//!   [`ClusterAdmin`]) with librdkafka implementations
//!
//! # Delivery
//!
//! Records are delivered at least once. `ack` marks offsets on the current
//! consumer-group session; a rebalance commits what was marked before the
//! session ends, and unmarked records are delivered again to whichever
//! member owns the partition next.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use kafka_source_core::{Config, KafkaSource, SourceOptions};
//!
//! # async fn run(config: Config) -> kafka_source_core::Result<()> {
//! let source = KafkaSource::new(&config, SourceOptions::default()).await?;
//! let batch = source.read_batch(100, Duration::from_secs(1)).await;
//! let offsets: Vec<_> = batch.iter().map(|m| m.offset.clone()).collect();
//! source.ack(&offsets).await?;
//! println!("pending: {}", source.pending().await);
//! source.close().await
//! # }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod handler;
pub mod secrets;
pub mod session;
pub mod source;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use admin::{AdminFactory, ClusterAdmin, RdKafkaAdmin};
pub use config::{Config, ConfigParser, SecretKeySelector, YamlConfigParser};
pub use error::{Error, Result};
pub use group::RdKafkaConsumerGroup;
pub use secrets::{SecretVolumeReader, VolumeReader, SECRET_VOLUME_PATH};
pub use session::{ConsumerGroup, ConsumerGroupHandler, GroupSession, PartitionClaim};
pub use source::{KafkaSource, SourceOptions, PENDING_UNAVAILABLE};
pub use state::SourceState;
pub use transport::TransportConfig;

// Re-export from kafka-types for convenience
pub use kafka_types::{KafkaOffset, Message, SourceOffset};
