//! Kafka record types.
//!
//! [`ConsumerMessage`] is the owned copy of a fetched record that travels
//! through the claim queue. [`Message`] is what `Read` hands to the host
//! runtime: payload, progress token and ingestion time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::offset::{KafkaOffset, SourceOffset};

/// A record fetched from a partition claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    /// Kafka topic name
    pub topic: String,
    /// Kafka partition number
    pub partition: i32,
    /// Kafka offset within the partition
    pub offset: i64,
    /// Message key (if any)
    pub key: Option<Vec<u8>>,
    /// Message value (if any)
    pub payload: Option<Vec<u8>>,
    /// Message timestamp in milliseconds since epoch (if available)
    pub timestamp: Option<i64>,
    /// Record headers in wire order
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ConsumerMessage {
    pub fn kafka_offset(&self) -> KafkaOffset {
        KafkaOffset::new(self.topic.clone(), self.partition, self.offset)
    }

    /// Convert into the runtime-facing message, stamping it with `ingested_at`.
    pub fn into_message(self, ingested_at: DateTime<Utc>) -> Message {
        let offset = self.kafka_offset().to_source_offset();
        let keys = self
            .key
            .map(|key| vec![String::from_utf8_lossy(&key).into_owned()])
            .unwrap_or_default();
        let headers = self
            .headers
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect();

        Message {
            payload: self.payload.unwrap_or_default(),
            offset,
            event_time: ingested_at,
            keys,
            headers,
        }
    }
}

/// A message produced by `Read`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub offset: SourceOffset,
    /// Time the adapter handed the record to the runtime.
    pub event_time: DateTime<Utc>,
    pub keys: Vec<String>,
    pub headers: HashMap<String, String>,
}
