//! In-memory consumer group, session and admin used by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kafka_types::ConsumerMessage;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::admin::{AdminFactory, ClusterAdmin};
use crate::error::{Error, Result};
use crate::session::{ConsumerGroup, ConsumerGroupHandler, GroupSession, PartitionClaim};

pub(crate) fn record(topic: &str, partition: i32, offset: i64) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(format!("{topic}-{partition}-{offset}").into_bytes()),
        timestamp: None,
        headers: Vec::new(),
    }
}

pub(crate) struct FakeSession {
    generation_id: i32,
    claims: BTreeMap<String, Vec<i32>>,
    marks: Mutex<HashMap<(String, i32), i64>>,
    committed: Mutex<HashMap<(String, i32), i64>>,
    commits: AtomicUsize,
    reject_marks: AtomicBool,
    cancelled: CancellationToken,
}

impl FakeSession {
    pub(crate) fn new(generation_id: i32) -> Arc<Self> {
        Self::with_claims(generation_id, BTreeMap::new())
    }

    pub(crate) fn with_claims(generation_id: i32, claims: BTreeMap<String, Vec<i32>>) -> Arc<Self> {
        Arc::new(Self {
            generation_id,
            claims,
            marks: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            commits: AtomicUsize::new(0),
            reject_marks: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
        })
    }

    pub(crate) fn reject_marks(&self) {
        self.reject_marks.store(true, Ordering::SeqCst);
    }

    pub(crate) fn marks(&self) -> HashMap<(String, i32), i64> {
        self.marks.lock().unwrap().clone()
    }

    pub(crate) fn committed(&self) -> HashMap<(String, i32), i64> {
        self.committed.lock().unwrap().clone()
    }

    pub(crate) fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupSession for FakeSession {
    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn claims(&self) -> BTreeMap<String, Vec<i32>> {
        self.claims.clone()
    }

    fn mark_offset(&self, topic: &str, partition: i32, sequence: i64) -> Result<()> {
        if self.reject_marks.load(Ordering::SeqCst) {
            return Err(Error::Commit("mark rejected".to_string()));
        }
        let mut marks = self.marks.lock().unwrap();
        let mark = marks.entry((topic.to_string(), partition)).or_insert(sequence);
        *mark = (*mark).max(sequence);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        *self.committed.lock().unwrap() = self.marks();
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancelled.clone()
    }
}

/// What the next call to [`FakeGroup::consume`] does.
pub(crate) enum Step {
    /// Run a session over `records`, claiming every partition they touch.
    Session(Vec<ConsumerMessage>),
    /// Fail the call.
    Fail(String),
}

pub(crate) struct FakeGroup {
    topic: String,
    steps: Mutex<VecDeque<Step>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    rebalance: Notify,
    errors_tx: mpsc::UnboundedSender<Error>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    closed: AtomicBool,
}

impl FakeGroup {
    pub(crate) fn new(topic: &str, steps: Vec<Step>) -> Arc<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            topic: topic.to_string(),
            steps: Mutex::new(steps.into()),
            sessions: Mutex::new(Vec::new()),
            rebalance: Notify::new(),
            errors_tx,
            errors: Mutex::new(Some(errors_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// End the running session as a rebalance would.
    pub(crate) fn trigger_rebalance(&self) {
        self.rebalance.notify_one();
    }

    pub(crate) fn report_error(&self, error: Error) {
        self.errors_tx.send(error).unwrap();
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerGroup for FakeGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<()> {
        assert_eq!(topics, &[self.topic.clone()]);

        let step = self.steps.lock().unwrap().pop_front();
        let records = match step {
            Some(Step::Session(records)) => records,
            Some(Step::Fail(reason)) => return Err(Error::ConsumeFatal(reason)),
            None => {
                cancel.cancelled().await;
                return Ok(());
            }
        };

        let mut by_partition: BTreeMap<i32, Vec<ConsumerMessage>> = BTreeMap::new();
        for record in records {
            by_partition.entry(record.partition).or_default().push(record);
        }
        let claims = BTreeMap::from([(
            self.topic.clone(),
            by_partition.keys().copied().collect::<Vec<_>>(),
        )]);

        let generation_id = self.sessions.lock().unwrap().len() as i32 + 1;
        let fake = FakeSession::with_claims(generation_id, claims);
        self.sessions.lock().unwrap().push(Arc::clone(&fake));
        let token = fake.cancellation();
        let session: Arc<dyn GroupSession> = fake;

        handler.setup(Arc::clone(&session)).await?;

        let mut senders = Vec::new();
        let mut claims = JoinSet::new();
        for (partition, records) in by_partition {
            let (tx, rx) = mpsc::channel(records.len().max(1));
            for record in records {
                tx.try_send(record).unwrap();
            }
            senders.push(tx);
            let claim = PartitionClaim {
                topic: self.topic.clone(),
                partition,
                messages: rx,
            };
            let handler = Arc::clone(&handler);
            let session = Arc::clone(&session);
            claims.spawn(async move { handler.consume_claim(session, claim).await });
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.rebalance.notified() => {}
        }
        token.cancel();
        drop(senders);
        while let Some(joined) = claims.join_next().await {
            joined.unwrap()?;
        }

        handler.cleanup(session).await
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().unwrap().take()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeAdmin {
    partitions: Vec<i32>,
    committed: HashMap<i32, Option<i64>>,
    newest: HashMap<i32, i64>,
    fail_partitions: bool,
    fail_committed: bool,
    closed: AtomicBool,
}

impl FakeAdmin {
    pub(crate) fn new(partitions: &[i32]) -> Self {
        Self {
            partitions: partitions.to_vec(),
            committed: partitions.iter().map(|p| (*p, None)).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn committed(mut self, partition: i32, offset: i64) -> Self {
        self.committed.insert(partition, Some(offset));
        self
    }

    pub(crate) fn newest(mut self, partition: i32, offset: i64) -> Self {
        self.newest.insert(partition, offset);
        self
    }

    pub(crate) fn failing_partitions(mut self) -> Self {
        self.fail_partitions = true;
        self
    }

    pub(crate) fn failing_committed(mut self) -> Self {
        self.fail_committed = true;
        self
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterAdmin for FakeAdmin {
    async fn partitions(&self, _topic: &str) -> Result<Vec<i32>> {
        if self.fail_partitions {
            return Err(Error::Admin("broken pipe".to_string()));
        }
        Ok(self.partitions.clone())
    }

    async fn committed_offsets(
        &self,
        _topic: &str,
        partitions: &[i32],
    ) -> Result<HashMap<i32, Option<i64>>> {
        if self.fail_committed {
            return Err(Error::Admin("coordinator not available".to_string()));
        }
        Ok(partitions
            .iter()
            .map(|p| (*p, self.committed.get(p).copied().flatten()))
            .collect())
    }

    async fn newest_offset(&self, _topic: &str, partition: i32) -> Result<i64> {
        self.newest
            .get(&partition)
            .copied()
            .ok_or_else(|| Error::Admin(format!("no leader for partition {partition}")))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out `admins` in order, then failing.
pub(crate) fn admin_factory(admins: Vec<Arc<FakeAdmin>>) -> (AdminFactory, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = Mutex::new(VecDeque::from(admins));
    let counter = Arc::clone(&calls);
    let factory: AdminFactory = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let admin = queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Connect("no admin left".to_string()))?;
        let admin: Arc<dyn ClusterAdmin> = admin;
        Ok(admin)
    });
    (factory, calls)
}
