//! Shared types for the Kafka source adapter.
//!
//! This crate provides:
//! - The progress token codec that maps `(topic, partition, sequence)` to the
//!   opaque `(value, partition id)` pair handed to the host runtime
//! - Owned record types produced by the consumer and consumed by `Read`
//!
//! # Progress token format
//!
//! ```text
//! value        = "<topic>*<sequence>"   (UTF-8)
//! partition_id = "<partition>"          (UTF-8, base 10)
//! ```
//!
//! `*` is never a legal character in a Kafka topic name, so the value needs no
//! escaping.
//!
//! # Examples
//!
//! ```
//! use kafka_types::{KafkaOffset, SourceOffset};
//!
//! let offset = KafkaOffset::new("orders", 3, 42);
//! let token: SourceOffset = offset.to_source_offset();
//! assert_eq!(token.value(), b"orders*42");
//! assert_eq!(token.partition_id(), "3");
//!
//! let decoded = KafkaOffset::try_from(&token).unwrap();
//! assert_eq!(decoded, offset);
//! ```

pub mod error;
pub mod message;
pub mod offset;

// Re-export main types for convenient access
pub use error::{OffsetError, Result};
pub use message::{ConsumerMessage, Message};
pub use offset::{decode, encode, KafkaOffset, SourceOffset, OFFSET_SEPARATOR};
