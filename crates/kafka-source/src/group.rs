//! [`ConsumerGroup`] over a librdkafka `StreamConsumer`.
//!
//! librdkafka rebalances inside its poll loop and reports the outcome through
//! [`ConsumerContext`] callbacks. [`GroupContext`] turns those callbacks into
//! [`RebalanceEvent`]s, and [`RdKafkaConsumerGroup::consume`] ends the current
//! session whenever one arrives. Each session owns the partitions assigned when
//! it started; records are routed from the single stream to one bounded
//! channel per partition claim.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use kafka_types::ConsumerMessage;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::session::{ConsumerGroup, ConsumerGroupHandler, GroupSession, PartitionClaim};

/// Partition ownership change reported by librdkafka.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(BTreeMap<String, Vec<i32>>),
    Revoked(BTreeMap<String, Vec<i32>>),
}

/// Consumer context forwarding rebalances, client errors and librdkafka logs.
pub struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    errors: mpsc::UnboundedSender<Error>,
}

impl ClientContext for GroupContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(target: "librdkafka", facility = fac, "{log_message}")
            }
            RDKafkaLogLevel::Warning => {
                warn!(target: "librdkafka", facility = fac, "{log_message}")
            }
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", facility = fac, "{log_message}")
            }
            RDKafkaLogLevel::Debug => {
                debug!(target: "librdkafka", facility = fac, "{log_message}")
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        debug!(error = %error, reason, "Kafka client error");
        let _ = self.errors.send(Error::Kafka(error));
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let claims = claims_of(tpl);
            info!(?claims, "Kafka partitions revoked");
            let _ = self.events.send(RebalanceEvent::Revoked(claims));
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let claims = claims_of(tpl);
                info!(?claims, "Kafka partitions assigned");
                let _ = self.events.send(RebalanceEvent::Assigned(claims));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => {
                let _ = self
                    .errors
                    .send(Error::Connect(format!("group rebalance failed: {err}")));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Committed Kafka offsets"),
            // Nothing was stored since the last commit.
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(error = %e, "Failed to commit Kafka offsets"),
        }
    }
}

/// Consumer-group client backed by librdkafka.
pub struct RdKafkaConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    errors_tx: mpsc::UnboundedSender<Error>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    subscription: Mutex<Vec<String>>,
    generation: AtomicI32,
    /// Records fetched outside of any session, delivered by the next one.
    stash: tokio::sync::Mutex<VecDeque<ConsumerMessage>>,
    claim_buffer: usize,
}

impl RdKafkaConsumerGroup {
    pub fn new(client: &ClientConfig, claim_buffer: usize) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            events: events_tx,
            errors: errors_tx.clone(),
        };
        let consumer: StreamConsumer<GroupContext> = client
            .create_with_context(context)
            .map_err(|e| Error::Connect(format!("Failed to create consumer: {e}")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events: tokio::sync::Mutex::new(events_rx),
            errors_tx,
            errors: Mutex::new(Some(errors_rx)),
            subscription: Mutex::new(Vec::new()),
            generation: AtomicI32::new(0),
            stash: tokio::sync::Mutex::new(VecDeque::new()),
            claim_buffer: claim_buffer.max(1),
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.as_slice() == topics {
            return Ok(());
        }
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| Error::Connect(format!("Failed to subscribe to topics {topics:?}: {e}")))?;
        info!(?topics, "Subscribed to Kafka topics");
        *subscription = topics.to_vec();
        Ok(())
    }

    fn fatal_error(&self) -> Option<Error> {
        self.consumer
            .client()
            .fatal_error()
            .map(|(code, reason)| Error::ConsumeFatal(format!("{code}: {reason}")))
    }

    /// Forward a non-fatal receive error, or turn it into the fatal error
    /// that stops the group.
    fn receive_failed(&self, err: KafkaError) -> Result<()> {
        if let Some(fatal) = self.fatal_error() {
            return Err(fatal);
        }
        debug!(error = %err, "Kafka receive error");
        let _ = self.errors_tx.send(Error::Kafka(err));
        Ok(())
    }

    fn assigned_claims(&self) -> Result<BTreeMap<String, Vec<i32>>> {
        Ok(claims_of(&self.consumer.assignment()?))
    }
}

#[async_trait]
impl ConsumerGroup for RdKafkaConsumerGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<()> {
        if let Some(fatal) = self.fatal_error() {
            return Err(fatal);
        }
        self.subscribe(topics)?;

        let mut events = self.events.lock().await;
        let mut pending = std::mem::take(&mut *self.stash.lock().await);

        let claims = loop {
            while events.try_recv().is_ok() {}
            let claims = self.assigned_claims()?;
            if !claims.is_empty() {
                break claims;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stash.lock().await.extend(pending);
                    return Ok(());
                }
                event = events.recv() => {
                    if event.is_none() {
                        return Err(Error::ConsumeFatal(
                            "rebalance event stream closed".to_string(),
                        ));
                    }
                }
                message = self.consumer.recv() => match message {
                    Ok(message) => pending.push_back(to_consumer_message(&message)),
                    Err(e) => self.receive_failed(e)?,
                },
            }
        };

        let generation_id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(RdKafkaSession {
            generation_id,
            claims: claims.clone(),
            marks: Mutex::new(Marks::default()),
            consumer: Arc::clone(&self.consumer),
            cancelled: cancel.child_token(),
        });
        let token = session.cancelled.clone();
        let session: Arc<dyn GroupSession> = session;

        handler.setup(Arc::clone(&session)).await?;

        let mut senders = HashMap::new();
        let mut claim_tasks = JoinSet::new();
        for (topic, partitions) in &claims {
            for partition in partitions {
                let (tx, rx) = mpsc::channel(self.claim_buffer);
                senders.insert((topic.clone(), *partition), tx);
                let claim = PartitionClaim {
                    topic: topic.clone(),
                    partition: *partition,
                    messages: rx,
                };
                let handler = Arc::clone(&handler);
                let session = Arc::clone(&session);
                claim_tasks.spawn(async move { handler.consume_claim(session, claim).await });
            }
        }

        let result = loop {
            let message = match pending.pop_front() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    _ = token.cancelled() => break Ok(()),
                    event = events.recv() => match event {
                        Some(event) => {
                            debug!(generation_id, ?event, "Ending session on rebalance");
                            break Ok(());
                        }
                        None => break Err(Error::ConsumeFatal(
                            "rebalance event stream closed".to_string(),
                        )),
                    },
                    message = self.consumer.recv() => match message {
                        Ok(message) => to_consumer_message(&message),
                        Err(e) => match self.receive_failed(e) {
                            Ok(()) => continue,
                            Err(fatal) => break Err(fatal),
                        },
                    },
                },
            };

            let Some(sender) = senders.get(&(message.topic.clone(), message.partition)) else {
                debug!(
                    generation_id,
                    topic = %message.topic,
                    partition = message.partition,
                    "Record for a partition outside this session, ending session"
                );
                pending.push_front(message);
                break Ok(());
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                sent = sender.send(message) => {
                    if sent.is_err() {
                        debug!(generation_id, "Claim stopped before its channel closed");
                    }
                }
            }
        };

        token.cancel();
        drop(senders);
        while let Some(joined) = claim_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(generation_id, error = %e, "Consumer claim failed"),
                Err(e) => warn!(generation_id, error = %e, "Consumer claim task panicked"),
            }
        }
        self.stash.lock().await.extend(pending);

        handler.cleanup(session).await?;
        result
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Closed Kafka consumer group");
        Ok(())
    }
}

/// Highest next-offset stored per partition.
#[derive(Debug, Default)]
struct Marks {
    next: HashMap<(String, i32), i64>,
}

impl Marks {
    /// Record `next` for the partition. Returns false when an equal or later
    /// offset is already marked.
    fn advance(&mut self, topic: &str, partition: i32, next: i64) -> bool {
        match self.next.get_mut(&(topic.to_string(), partition)) {
            Some(current) if *current >= next => false,
            Some(current) => {
                *current = next;
                true
            }
            None => {
                self.next.insert((topic.to_string(), partition), next);
                true
            }
        }
    }

    fn to_tpl(&self) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), next) in &self.next {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*next))?;
        }
        Ok(tpl)
    }
}

struct RdKafkaSession {
    generation_id: i32,
    claims: BTreeMap<String, Vec<i32>>,
    marks: Mutex<Marks>,
    consumer: Arc<StreamConsumer<GroupContext>>,
    cancelled: CancellationToken,
}

impl RdKafkaSession {
    fn owns(&self, topic: &str, partition: i32) -> bool {
        self.claims
            .get(topic)
            .is_some_and(|partitions| partitions.contains(&partition))
    }
}

#[async_trait]
impl GroupSession for RdKafkaSession {
    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn claims(&self) -> BTreeMap<String, Vec<i32>> {
        self.claims.clone()
    }

    /// Stores `sequence + 1`, the offset the group resumes from.
    fn mark_offset(&self, topic: &str, partition: i32, sequence: i64) -> Result<()> {
        if !self.owns(topic, partition) {
            return Err(Error::Commit(format!(
                "partition {topic}/{partition} is not claimed by generation {}",
                self.generation_id
            )));
        }

        let next = sequence + 1;
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (topic.to_string(), partition);
        if marks.next.get(&key).is_some_and(|current| *current >= next) {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next))?;
        self.consumer.store_offsets(&tpl)?;
        marks.advance(topic, partition, next);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let tpl = {
            let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
            if marks.next.is_empty() {
                return Ok(());
            }
            marks.to_tpl()?
        };

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Commit(format!("commit task failed: {e}")))?
            .map_err(|e| Error::Commit(e.to_string()))?;

        debug!(generation_id = self.generation_id, "Committed marked offsets");
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancelled.clone()
    }
}

fn claims_of(tpl: &TopicPartitionList) -> BTreeMap<String, Vec<i32>> {
    let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
    for elem in tpl.elements() {
        claims
            .entry(elem.topic().to_string())
            .or_default()
            .push(elem.partition());
    }
    for partitions in claims.values_mut() {
        partitions.sort_unstable();
        partitions.dedup();
    }
    claims
}

fn to_consumer_message<M: KafkaMessage>(message: &M) -> ConsumerMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumerMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message.timestamp().to_millis(),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage, Timestamp};

    #[test]
    fn test_claims_of_groups_partitions_by_topic() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 2);
        tpl.add_partition("orders", 0);
        tpl.add_partition("refunds", 1);

        let claims = claims_of(&tpl);
        assert_eq!(claims.get("orders"), Some(&vec![0, 2]));
        assert_eq!(claims.get("refunds"), Some(&vec![1]));
    }

    #[test]
    fn test_marks_never_move_backwards() {
        let mut marks = Marks::default();
        assert!(marks.advance("orders", 0, 11));
        assert!(!marks.advance("orders", 0, 6));
        assert!(!marks.advance("orders", 0, 11));
        assert!(marks.advance("orders", 0, 12));
        assert!(marks.advance("orders", 1, 3));

        let tpl = marks.to_tpl().unwrap();
        let mut offsets: Vec<(i32, Offset)> = tpl
            .elements()
            .iter()
            .map(|elem| (elem.partition(), elem.offset()))
            .collect();
        offsets.sort_by_key(|(partition, _)| *partition);
        assert_eq!(
            offsets,
            vec![(0, Offset::Offset(12)), (1, Offset::Offset(3))]
        );
    }

    #[test]
    fn test_to_consumer_message_copies_record() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "trace-id",
                value: Some("abc"),
            })
            .insert(Header::<&[u8]> {
                key: "empty",
                value: None,
            });
        let message = OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "orders".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            3,
            42,
            Some(headers),
        );

        let record = to_consumer_message(&message);
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.key.as_deref(), Some(&b"key"[..]));
        assert_eq!(record.payload.as_deref(), Some(&b"payload"[..]));
        assert_eq!(record.timestamp, Some(1_700_000_000_000));
        assert_eq!(
            record.headers,
            vec![
                ("trace-id".to_string(), b"abc".to_vec()),
                ("empty".to_string(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_tombstone_has_no_payload() {
        let message = OwnedMessage::new(
            None,
            None,
            "orders".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );
        let record = to_consumer_message(&message);
        assert!(record.payload.is_none());
        assert!(record.timestamp.is_none());
        assert!(record.headers.is_empty());
    }
}
