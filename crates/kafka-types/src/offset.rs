//! Progress token codec.
//!
//! The host runtime represents a progress marker as an opaque value plus a
//! partition key. A Kafka position needs three things to be acknowledged later
//! (topic, partition, sequence), so the topic and sequence travel in the value
//! and the partition travels as the partition key.

use std::fmt;

use crate::error::{OffsetError, Result};

/// Separator between the topic and the sequence in a token value.
///
/// Kafka topic names may only contain `a-z`, `A-Z`, `0-9`, `.`, `_` and `-`.
pub const OFFSET_SEPARATOR: char = '*';

/// A decoded Kafka position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    topic: String,
    partition: i32,
    sequence: i64,
}

impl KafkaOffset {
    pub fn new(topic: impl Into<String>, partition: i32, sequence: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            sequence,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of the record within its partition.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Encode into the token handed to the host runtime.
    pub fn to_source_offset(&self) -> SourceOffset {
        let (value, partition_id) = encode(&self.topic, self.partition, self.sequence);
        SourceOffset {
            value,
            partition_id,
        }
    }
}

impl fmt::Display for KafkaOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.sequence)
    }
}

impl TryFrom<&SourceOffset> for KafkaOffset {
    type Error = OffsetError;

    fn try_from(offset: &SourceOffset) -> Result<Self> {
        let (topic, partition, sequence) = decode(&offset.value, &offset.partition_id)?;
        Ok(Self {
            topic,
            partition,
            sequence,
        })
    }
}

/// The opaque progress token as the host runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceOffset {
    value: Vec<u8>,
    partition_id: String,
}

impl SourceOffset {
    pub fn new(value: impl Into<Vec<u8>>, partition_id: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            partition_id: partition_id.into(),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }
}

/// Encode a position as `("<topic>*<sequence>", "<partition>")`.
pub fn encode(topic: &str, partition: i32, sequence: i64) -> (Vec<u8>, String) {
    let value = format!("{topic}{OFFSET_SEPARATOR}{sequence}").into_bytes();
    (value, partition.to_string())
}

/// Decode a token produced by [`encode`].
pub fn decode(value: &[u8], partition_id: &str) -> Result<(String, i32, i64)> {
    let value = std::str::from_utf8(value)
        .map_err(|_| OffsetError::InvalidOffsetFormat(String::from_utf8_lossy(value).into()))?;

    let parts: Vec<&str> = value.split(OFFSET_SEPARATOR).collect();
    if parts.len() != 2 {
        return Err(OffsetError::InvalidOffsetFormat(value.to_string()));
    }

    let sequence: i64 = parts[1]
        .parse()
        .map_err(|_| OffsetError::InvalidSequence(parts[1].to_string()))?;
    let partition: i32 = partition_id
        .parse()
        .map_err(|_| OffsetError::InvalidPartitionId(partition_id.to_string()))?;

    Ok((parts[0].to_string(), partition, sequence))
}
