//! Cluster metadata and committed-offset lookups used by `Pending`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Builds a fresh [`ClusterAdmin`]. Used to replace an admin client whose
/// connection went bad.
pub type AdminFactory = Arc<dyn Fn() -> Result<Arc<dyn ClusterAdmin>> + Send + Sync>;

#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Partition ids of `topic`.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Committed offsets of the consumer group. `None` means the group has
    /// never committed for that partition.
    async fn committed_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
    ) -> Result<HashMap<i32, Option<i64>>>;

    /// Offset the next record produced to the partition will get.
    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64>;

    fn close(&self);
}

/// [`ClusterAdmin`] over a non-subscribed librdkafka consumer sharing the
/// source's group id.
pub struct RdKafkaAdmin {
    consumer: Mutex<Option<Arc<BaseConsumer>>>,
    timeout: Duration,
}

impl RdKafkaAdmin {
    pub fn new(client: &ClientConfig, timeout: Duration) -> Result<Self> {
        let consumer: BaseConsumer = client
            .create()
            .map_err(|e| Error::Connect(format!("Failed to create admin client: {e}")))?;
        Ok(Self {
            consumer: Mutex::new(Some(Arc::new(consumer))),
            timeout,
        })
    }

    /// An [`AdminFactory`] creating admins from `client`.
    pub fn factory(client: ClientConfig, timeout: Duration) -> AdminFactory {
        Arc::new(move || {
            let admin: Arc<dyn ClusterAdmin> = Arc::new(RdKafkaAdmin::new(&client, timeout)?);
            Ok(admin)
        })
    }

    fn consumer(&self) -> Result<Arc<BaseConsumer>> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }

    /// librdkafka lookups block, keep them off the runtime threads.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> Result<T> + Send + 'static,
    {
        let consumer = self.consumer()?;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || f(consumer.as_ref(), timeout))
            .await
            .map_err(|e| Error::Admin(format!("admin task failed: {e}")))?
    }
}

#[async_trait]
impl ClusterAdmin for RdKafkaAdmin {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topic = topic.to_string();
        self.blocking(move |consumer, timeout| {
            let metadata = consumer.fetch_metadata(Some(topic.as_str()), timeout)?;
            let entry = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| Error::Admin(format!("topic {topic} not found in metadata")))?;
            if let Some(err) = entry.error() {
                return Err(Error::Admin(format!(
                    "metadata for topic {topic} failed: {err:?}"
                )));
            }
            let partitions: Vec<i32> = entry.partitions().iter().map(|p| p.id()).collect();
            debug!(topic = %topic, ?partitions, "Fetched topic partitions");
            Ok(partitions)
        })
        .await
    }

    async fn committed_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
    ) -> Result<HashMap<i32, Option<i64>>> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(topic, *partition);
        }
        self.blocking(move |consumer, timeout| {
            let committed = consumer.committed_offsets(tpl, timeout)?;
            Ok(committed
                .elements()
                .iter()
                .map(|elem| {
                    let offset = match elem.offset() {
                        Offset::Offset(offset) => Some(offset),
                        _ => None,
                    };
                    (elem.partition(), offset)
                })
                .collect())
        })
        .await
    }

    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64> {
        let topic = topic.to_string();
        self.blocking(move |consumer, timeout| {
            let (_low, high) = consumer.fetch_watermarks(&topic, partition, timeout)?;
            Ok(high)
        })
        .await
    }

    fn close(&self) {
        if self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Closed Kafka admin client");
        }
    }
}
