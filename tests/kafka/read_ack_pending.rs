//! Kafka read/ack/pending E2E test
//!
//! Test flow:
//! 1. Create a two-partition topic and publish three records to known partitions
//! 2. Read them through a source in a fresh consumer group
//! 3. Acknowledge them and close the source, committing the offsets
//! 4. Join the same group again and verify nothing is pending or redelivered

use std::time::Duration;

use kafka_source_core::{Config, KafkaOffset, KafkaSource, SourceOptions, PENDING_UNAVAILABLE};
use kafka_source_producer::{KafkaTestProducer, TestRecord};
use tokio::time::sleep;

/// Kafka broker address for testing
const KAFKA_BROKER: &str = "kafka:9092";

fn test_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        std::process::id()
    )
}

fn source_config(topic: &str, group: &str) -> Config {
    Config {
        brokers: vec![KAFKA_BROKER.to_string()],
        topic: topic.to_string(),
        consumer_group: group.to_string(),
        raw_client_config: "session.timeout.ms: 10000\n".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires a Kafka broker at kafka:9092"]
async fn test_kafka_read_ack_pending() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_source=debug,kafka_source_core=debug")
        .try_init()
        .ok();

    let test_id = test_id();
    let topic = format!("test-orders-{test_id}");
    let group = format!("test-orders-group-{test_id}");
    tracing::info!("Using topic={topic} group={group}");

    let producer = KafkaTestProducer::new(KAFKA_BROKER).await?;
    producer.create_topic_if_not_exists(&topic, 2).await?;

    // Give Kafka a moment to propagate topic metadata
    sleep(Duration::from_millis(500)).await;

    let written = producer
        .publish_all(
            &topic,
            &[
                TestRecord::new(b"{\"id\":1}".to_vec())
                    .with_partition(0)
                    .with_key("order-1"),
                TestRecord::new(b"{\"id\":2}".to_vec())
                    .with_partition(0)
                    .with_key("order-2"),
                TestRecord::new(b"{\"id\":3}".to_vec())
                    .with_partition(1)
                    .with_key("order-3")
                    .with_header("content-type", "application/json"),
            ],
        )
        .await?;
    assert_eq!(written, vec![(0, 0), (0, 1), (1, 0)]);

    let config = source_config(&topic, &group);
    let source = KafkaSource::new(&config, SourceOptions::default()).await?;

    let mut messages = Vec::new();
    for _ in 0..10 {
        messages.extend(source.read_batch(3 - messages.len(), Duration::from_secs(3)).await);
        if messages.len() == 3 {
            break;
        }
    }
    assert_eq!(messages.len(), 3, "expected all published records");

    let mut offsets = messages
        .iter()
        .map(|m| KafkaOffset::try_from(&m.offset))
        .collect::<Result<Vec<_>, _>>()?;
    offsets.sort_by_key(|o| (o.partition(), o.sequence()));
    assert_eq!(
        offsets,
        vec![
            KafkaOffset::new(&topic, 0, 0),
            KafkaOffset::new(&topic, 0, 1),
            KafkaOffset::new(&topic, 1, 0),
        ]
    );

    let keyed = messages
        .iter()
        .find(|m| m.keys == vec!["order-3".to_string()])
        .ok_or("record with key order-3 not read")?;
    assert_eq!(keyed.payload, b"{\"id\":3}".to_vec());
    assert_eq!(
        keyed.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );

    let tokens: Vec<_> = messages.iter().map(|m| m.offset.clone()).collect();
    source.ack(&tokens).await?;
    source.close().await?;
    assert_eq!(source.pending().await, PENDING_UNAVAILABLE);

    // The same group resumes after the committed offsets
    let source = KafkaSource::new(&config, SourceOptions::default()).await?;
    let mut pending = source.pending().await;
    for _ in 0..10 {
        if pending == 0 {
            break;
        }
        sleep(Duration::from_millis(500)).await;
        pending = source.pending().await;
    }
    assert_eq!(pending, 0);

    let redelivered = source.read_batch(10, Duration::from_secs(2)).await;
    assert!(
        redelivered.is_empty(),
        "acknowledged records were redelivered: {redelivered:?}"
    );
    source.close().await?;

    Ok(())
}
