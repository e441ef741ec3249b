//! Test data publishing helpers for Kafka integration tests
//!
//! Orders are spread round-robin over the topic's partitions and carry a
//! `content-type` header, so tests can check keys, headers and per-partition
//! ordering of what the source reads back.

use crate::{KafkaTestProducer, TestRecord};
use chrono::Utc;

/// Build `count` order records over `partitions` partitions.
pub fn sample_orders(count: usize, partitions: i32) -> Vec<TestRecord> {
    let now = Utc::now().timestamp_millis();
    (0..count)
        .map(|i| {
            let partition = i as i32 % partitions.max(1);
            let payload = format!(
                r#"{{"order_id":"order_{i:03}","amount_cents":{},"created_at":{}}}"#,
                (i + 1) * 250,
                now + i as i64
            );
            TestRecord::new(payload)
                .with_partition(partition)
                .with_key(format!("order_{i:03}"))
                .with_header("content-type", "application/json")
        })
        .collect()
}

/// Publish `count` sample orders, returning where each was written.
pub async fn publish_test_orders(
    producer: &KafkaTestProducer,
    topic: &str,
    count: usize,
    partitions: i32,
) -> anyhow::Result<Vec<(i32, i64)>> {
    let records = sample_orders(count, partitions);
    let written = producer.publish_all(topic, &records).await?;
    tracing::debug!("Published {} orders to {topic}", written.len());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_orders_round_robin_partitions() {
        let orders = sample_orders(5, 2);
        let partitions: Vec<Option<i32>> = orders.iter().map(|o| o.partition).collect();
        assert_eq!(partitions, vec![Some(0), Some(1), Some(0), Some(1), Some(0)]);
        assert_eq!(orders[3].key.as_deref(), Some("order_003"));
        assert_eq!(
            orders[0].headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
        assert!(String::from_utf8_lossy(&orders[1].payload).contains(r#""amount_cents":500"#));
    }
}
