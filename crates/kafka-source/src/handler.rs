//! Bridge between per-partition claim delivery and pull-based reads.
//!
//! Every claim of every session pushes into one bounded queue that `Read`
//! drains. A full queue blocks the claim, which in turn stops the consumer
//! from fetching further records for that partition.
//!
//! Teardown of a session waits on the in-flight-ack gate, so a commit never
//! runs ahead of an `Ack` that is still marking offsets. The gate starts with
//! no acks in flight, so teardown before the first `Ack` does not wait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kafka_types::ConsumerMessage;
use tokio::sync::{mpsc, watch, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::{ConsumerGroupHandler, GroupSession, PartitionClaim};
use crate::state::{SourceState, StateCell};

/// Held by an `Ack` call for as long as it marks offsets.
pub(crate) type InflightAck<'a> = RwLockReadGuard<'a, ()>;

pub struct ConsumerHandler {
    messages_tx: mpsc::Sender<ConsumerMessage>,
    messages_rx: Arc<Mutex<mpsc::Receiver<ConsumerMessage>>>,
    ready: watch::Sender<bool>,
    session: RwLock<Option<Arc<dyn GroupSession>>>,
    inflight_acks: RwLock<()>,
    state: StateCell,
}

impl ConsumerHandler {
    pub(crate) fn new(buffer_size: usize, state: StateCell) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(buffer_size.max(1));
        let (ready, _) = watch::channel(false);
        Self {
            messages_tx,
            messages_rx: Arc::new(Mutex::new(messages_rx)),
            ready,
            session: RwLock::new(None),
            inflight_acks: RwLock::new(()),
            state,
        }
    }

    /// Whether the first session has been established.
    #[cfg(test)]
    pub(crate) fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the first session has been established.
    pub(crate) async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Receiving end of the claim queue.
    pub(crate) fn messages(&self) -> Arc<Mutex<mpsc::Receiver<ConsumerMessage>>> {
        Arc::clone(&self.messages_rx)
    }

    pub(crate) async fn current_session(&self) -> Option<Arc<dyn GroupSession>> {
        self.session.read().await.clone()
    }

    pub(crate) async fn claims(&self) -> BTreeMap<String, Vec<i32>> {
        match self.current_session().await {
            Some(session) => session.claims(),
            None => BTreeMap::new(),
        }
    }

    /// Open the in-flight-ack gate. Teardown waits until every guard is dropped.
    pub(crate) async fn begin_ack(&self) -> InflightAck<'_> {
        self.inflight_acks.read().await
    }
}

#[async_trait]
impl ConsumerGroupHandler for ConsumerHandler {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        info!(
            generation_id = session.generation_id(),
            claims = ?session.claims(),
            "Kafka consumer session established"
        );
        *self.session.write().await = Some(session);
        let first = self
            .ready
            .send_if_modified(|ready| !std::mem::replace(ready, true));
        if first {
            self.state.transition(SourceState::Ready);
        } else {
            self.state.transition(SourceState::Consuming);
        }
        Ok(())
    }

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        self.state.transition(SourceState::Rebalancing);

        // wait for inflight acks to be completed.
        let _closed = self.inflight_acks.write().await;
        if let Err(e) = session.commit().await {
            warn!(
                generation_id = session.generation_id(),
                error = %e,
                "Failed to commit marked offsets on session teardown"
            );
        }
        *self.session.write().await = None;

        info!(
            generation_id = session.generation_id(),
            "Kafka consumer session ended"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: PartitionClaim,
    ) -> Result<()> {
        let cancelled = session.cancellation();
        debug!(
            topic = %claim.topic,
            partition = claim.partition,
            "Starting consumer claim"
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                message = claim.messages.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                sent = self.messages_tx.send(message) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        info!(
            topic = %claim.topic,
            partition = claim.partition,
            "Session cancelled, stopping consumer claim"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, FakeSession};
    use std::time::Duration;
    use tokio::time::timeout;

    fn handler(buffer: usize) -> Arc<ConsumerHandler> {
        Arc::new(ConsumerHandler::new(buffer, StateCell::new()))
    }

    #[tokio::test]
    async fn test_ready_latch_fires_once() {
        let handler = handler(4);
        assert!(!handler.is_ready());

        let first = FakeSession::new(1);
        handler.setup(first.clone()).await.unwrap();
        assert!(handler.is_ready());
        timeout(Duration::from_millis(100), handler.wait_ready())
            .await
            .unwrap();

        handler.cleanup(first).await.unwrap();
        let second = FakeSession::new(2);
        handler.setup(second.clone()).await.unwrap();
        assert!(handler.is_ready());
        assert_eq!(
            handler.current_session().await.unwrap().generation_id(),
            2
        );
    }

    #[tokio::test]
    async fn test_teardown_without_any_ack_does_not_block() {
        let handler = handler(4);
        let session = FakeSession::new(1);
        handler.setup(session.clone()).await.unwrap();

        timeout(Duration::from_millis(100), handler.cleanup(session.clone()))
            .await
            .expect("teardown must not wait when no ack ever ran")
            .unwrap();
        assert_eq!(session.commit_count(), 1);
        assert!(handler.current_session().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_waits_for_inflight_ack() {
        let handler = handler(4);
        let session = FakeSession::new(1);
        handler.setup(session.clone()).await.unwrap();

        let ack = handler.begin_ack().await;
        let teardown = {
            let handler = Arc::clone(&handler);
            let session = session.clone();
            tokio::spawn(async move { handler.cleanup(session).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.commit_count(), 0, "commit raced ahead of ack");

        session.mark_offset("topic", 0, 7).unwrap();
        drop(ack);

        teardown.await.unwrap().unwrap();
        assert_eq!(session.commit_count(), 1);
        assert_eq!(session.committed().get(&("topic".to_string(), 0)), Some(&7));
    }

    #[tokio::test]
    async fn test_claim_pushes_into_queue_in_order() {
        let handler = handler(8);
        let session = FakeSession::new(1);
        let (tx, rx) = mpsc::channel(8);
        let claim = PartitionClaim {
            topic: "topic".to_string(),
            partition: 0,
            messages: rx,
        };

        for offset in 0..3 {
            tx.send(record("topic", 0, offset)).await.unwrap();
        }
        drop(tx);
        handler.consume_claim(session, claim).await.unwrap();

        let messages = handler.messages();
        let mut queue = messages.lock().await;
        for offset in 0..3 {
            assert_eq!(queue.recv().await.unwrap().offset, offset);
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_claim_until_cancelled() {
        let handler = handler(1);
        let session = FakeSession::new(1);
        let (tx, rx) = mpsc::channel(8);
        let claim = PartitionClaim {
            topic: "topic".to_string(),
            partition: 0,
            messages: rx,
        };
        tx.send(record("topic", 0, 0)).await.unwrap();
        tx.send(record("topic", 0, 1)).await.unwrap();

        let consuming = {
            let handler = Arc::clone(&handler);
            let session = session.clone();
            tokio::spawn(async move { handler.consume_claim(session, claim).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consuming.is_finished(), "claim should block on a full queue");

        session.cancellation().cancel();
        timeout(Duration::from_millis(100), consuming)
            .await
            .expect("claim must unwind on cancellation")
            .unwrap()
            .unwrap();

        // Only the first record made it; the blocked one was abandoned.
        let messages = handler.messages();
        let mut queue = messages.lock().await;
        assert_eq!(queue.recv().await.unwrap().offset, 0);
        assert!(queue.try_recv().is_err());
    }
}
