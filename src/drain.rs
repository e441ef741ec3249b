//! Read/ack loop that drains a source until shutdown.
//!
//! Every batch is acknowledged right after it is logged, so the loop commits
//! exactly what it has seen. Records read but not acknowledged when the loop
//! stops are redelivered to the next member of the consumer group.

use std::time::Duration;

use async_trait::async_trait;
use kafka_source_core::{KafkaSource, Message, SourceOffset, PENDING_UNAVAILABLE};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// The parts of a source the drain loop needs.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn read_batch(&self, count: usize, timeout: Duration) -> Vec<Message>;
    async fn ack(&self, offsets: &[SourceOffset]) -> kafka_source_core::Result<()>;
    async fn pending(&self) -> i64;
    /// Resolves with the reason once the source failed for good.
    async fn faulted(&self) -> Option<String>;
}

#[async_trait]
impl BatchSource for KafkaSource {
    async fn read_batch(&self, count: usize, timeout: Duration) -> Vec<Message> {
        KafkaSource::read_batch(self, count, timeout).await
    }

    async fn ack(&self, offsets: &[SourceOffset]) -> kafka_source_core::Result<()> {
        KafkaSource::ack(self, offsets).await
    }

    async fn pending(&self) -> i64 {
        KafkaSource::pending(self).await
    }

    async fn faulted(&self) -> Option<String> {
        KafkaSource::faulted(self).await
    }
}

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub batch_size: usize,
    pub read_timeout: Duration,
    /// How often the backlog is logged.
    pub pending_interval: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            read_timeout: Duration::from_secs(1),
            pending_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: u64,
    pub messages: u64,
}

/// Read and acknowledge batches until `shutdown` fires or the source faults.
pub async fn drain(
    source: &dyn BatchSource,
    options: &DrainOptions,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<DrainStats> {
    let mut stats = DrainStats::default();
    let mut next_pending_log = Instant::now();

    loop {
        let batch = tokio::select! {
            biased;
            Some(reason) = source.faulted() => {
                anyhow::bail!("Kafka source faulted: {reason}");
            }
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            batch = source.read_batch(options.batch_size, options.read_timeout) => batch,
        };

        if !batch.is_empty() {
            for message in &batch {
                debug!(
                    partition = message.offset.partition_id(),
                    keys = ?message.keys,
                    bytes = message.payload.len(),
                    "Read message"
                );
            }
            let offsets: Vec<SourceOffset> = batch.iter().map(|m| m.offset.clone()).collect();
            source.ack(&offsets).await?;

            stats.batches += 1;
            stats.messages += batch.len() as u64;
            if stats.batches % 100 == 0 {
                info!("Processed {} messages total", stats.messages);
            }
        }

        if Instant::now() >= next_pending_log {
            let now = Instant::now();
            next_pending_log = now
                .checked_add(options.pending_interval)
                .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30));
            match source.pending().await {
                PENDING_UNAVAILABLE => debug!("Pending count unavailable"),
                pending => info!(pending, "Pending messages"),
            }
        }
    }

    Ok(stats)
}

/// Fire the returned receiver on Ctrl+C.
pub fn shutdown_on_ctrl_c() -> broadcast::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            return;
        }
        info!("Received interrupt signal (Ctrl+C)");
        let _ = shutdown_tx.send(());
    });

    shutdown_rx
}
