//! Consumer-group seams.
//!
//! A [`ConsumerGroup`] runs one membership epoch per call to
//! [`ConsumerGroup::consume`]: it establishes a [`GroupSession`], hands the
//! session to the [`ConsumerGroupHandler`], starts one claim per assigned
//! partition, and tears the session down when the group rebalances or the
//! caller cancels. Callers are expected to call `consume` in a loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kafka_types::ConsumerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One consumer-group membership epoch.
#[async_trait]
pub trait GroupSession: Send + Sync {
    /// Generation of the group this session belongs to.
    fn generation_id(&self) -> i32;

    /// Partitions owned by this session, per topic.
    fn claims(&self) -> BTreeMap<String, Vec<i32>>;

    /// Record `sequence` as consumed. Marks never move a partition backwards.
    fn mark_offset(&self, topic: &str, partition: i32, sequence: i64) -> Result<()>;

    /// Commit every marked offset.
    async fn commit(&self) -> Result<()>;

    /// Cancelled when the session ends, either by rebalance or shutdown.
    fn cancellation(&self) -> CancellationToken;
}

/// The records of one partition for the lifetime of one session.
#[derive(Debug)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<ConsumerMessage>,
}

/// Session lifecycle callbacks invoked by a [`ConsumerGroup`].
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    /// Runs at the start of a session, before any claim is consumed.
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()>;

    /// Runs at the end of a session, once every claim has returned.
    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<()>;

    /// Consume one claim until its channel closes or the session is cancelled.
    /// Runs concurrently for every claim of the session.
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> Result<()>;
}

/// A consumer-group client.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and run a single session against `handler`.
    ///
    /// Returns `Ok(())` when the session ended because of a rebalance or because
    /// `cancel` fired. An `Err` means the client cannot continue.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<()>;

    /// Take the stream of asynchronous client errors. Only the first call
    /// returns `Some`.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>>;

    /// Release the client.
    fn close(&self) -> Result<()>;
}
