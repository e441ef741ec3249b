//! Kafka producer library for testing the Kafka source
//!
//! This library publishes records with explicit partitions, keys and headers,
//! so tests can predict exactly which `(topic, partition, offset)` triples the
//! source will read back.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kafka_source_producer::{KafkaTestProducer, TestRecord};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let producer = KafkaTestProducer::new("localhost:9092").await?;
//!
//!     // Create topic
//!     producer.create_topic_if_not_exists("orders", 2).await?;
//!
//!     // Publish a record to partition 1
//!     let record = TestRecord::new(b"{\"id\":1}".to_vec())
//!         .with_partition(1)
//!         .with_key("order-1");
//!     let (partition, offset) = producer.publish("orders", &record).await?;
//!     println!("written to {partition}@{offset}");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::time::Duration;

// Test data helpers module
pub mod testdata;

pub use testdata::{publish_test_orders, sample_orders};

/// A record to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestRecord {
    /// Target partition, or `None` to let the partitioner pick one
    pub partition: Option<i32>,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl TestRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Kafka producer wrapper for testing
pub struct KafkaTestProducer {
    producer: FutureProducer,
    broker: String,
}

impl KafkaTestProducer {
    /// Create a new Kafka test producer
    pub async fn new(broker: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        Ok(Self {
            producer,
            broker: broker.to_string(),
        })
    }

    /// Create Kafka topic if it doesn't exist
    pub async fn create_topic_if_not_exists(&self, topic: &str, partitions: i32) -> Result<()> {
        let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.broker)
            .create()
            .context("Failed to create admin client")?;

        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(1));
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(5)));

        let results = admin_client
            .create_topics(&[new_topic], &opts)
            .await
            .context("Failed to create topics")?;
        for result in results {
            match result {
                Ok(topic_name) => tracing::info!("Topic '{topic_name}' created successfully"),
                Err((topic_name, err)) => {
                    if err.to_string().contains("already exists") {
                        tracing::info!("Topic '{topic_name}' already exists");
                    } else {
                        return Err(anyhow::anyhow!("Failed to create topic: {err}"));
                    }
                }
            }
        }

        Ok(())
    }

    /// Publish one record, returning the partition and offset it was written to.
    pub async fn publish(&self, topic: &str, record: &TestRecord) -> Result<(i32, i64)> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut future_record = FutureRecord::to(topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        let (partition, offset) = self
            .producer
            .send(future_record, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| err)
            .with_context(|| format!("Failed to publish to topic {topic}"))?;

        tracing::debug!("Published record to {topic}/{partition}@{offset}");
        Ok((partition, offset))
    }

    /// Publish `records` in order.
    pub async fn publish_all(
        &self,
        topic: &str,
        records: &[TestRecord],
    ) -> Result<Vec<(i32, i64)>> {
        let mut written = Vec::with_capacity(records.len());
        for record in records {
            written.push(self.publish(topic, record).await?);
        }
        Ok(written)
    }
}
