//! The read/ack/pending surface handed to the host runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use kafka_types::{KafkaOffset, Message, SourceOffset};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::{AdminFactory, ClusterAdmin, RdKafkaAdmin};
use crate::client::{admin_client_config, consumer_client_config};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::RdKafkaConsumerGroup;
use crate::handler::ConsumerHandler;
use crate::secrets::{SecretVolumeReader, VolumeReader};
use crate::session::{ConsumerGroup, ConsumerGroupHandler};
use crate::state::{SourceState, StateCell};
use crate::transport::TransportConfig;


/// Returned by [`KafkaSource::pending`] when lag cannot be computed.
pub const PENDING_UNAVAILABLE: i64 = -1;

/// Tuning knobs of a [`KafkaSource`].
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Capacity of the queue between partition claims and `read`
    pub buffer_size: usize,
    /// Capacity of each partition claim's channel
    pub claim_buffer: usize,
    /// Timeout of every admin request made by `pending`
    pub metadata_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            claim_buffer: 16,
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

impl SourceOptions {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_claim_buffer(mut self, claim_buffer: usize) -> Self {
        self.claim_buffer = claim_buffer;
        self
    }

    pub fn with_metadata_timeout(mut self, metadata_timeout: Duration) -> Self {
        self.metadata_timeout = metadata_timeout;
        self
    }
}

/// A pull-based, checkpointable view of one Kafka topic.
///
/// A background task keeps the consumer group joined and feeds every claimed
/// partition into a bounded queue that [`KafkaSource::read`] drains.
/// [`KafkaSource::ack`] marks offsets on the current session; marked offsets
/// are committed periodically and whenever the session ends.
pub struct KafkaSource {
    topic: String,
    handler: Arc<ConsumerHandler>,
    admin: RwLock<Arc<dyn ClusterAdmin>>,
    admin_factory: AdminFactory,
    state: StateCell,
    lifecycle: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl KafkaSource {
    /// Connect with secrets read from the default secret volume.
    pub async fn new(config: &Config, options: SourceOptions) -> Result<Self> {
        Self::with_volume_reader(config, options, &SecretVolumeReader::default()).await
    }

    /// Connect, reading TLS and SASL secrets through `reader`.
    ///
    /// Returns once the first consumer-group session is established.
    pub async fn with_volume_reader(
        config: &Config,
        options: SourceOptions,
        reader: &dyn VolumeReader,
    ) -> Result<Self> {
        config.validate()?;
        let transport =
            TransportConfig::resolve(config.tls.as_ref(), config.sasl.as_ref(), reader)?;
        debug!(?transport, "Creating Kafka clients");

        let group = RdKafkaConsumerGroup::new(
            &consumer_client_config(config, &transport)?,
            options.claim_buffer,
        )?;
        info!(
            topic = %config.topic,
            consumer_group = %config.consumer_group,
            brokers = ?config.brokers,
            "Created Kafka consumer group"
        );

        let admin_factory = RdKafkaAdmin::factory(
            admin_client_config(config, &transport)?,
            options.metadata_timeout,
        );
        Self::start(config.topic.clone(), options, Arc::new(group), admin_factory).await
    }

    /// Start consuming `topic` through `group`, with admin clients built by
    /// `admin_factory`.
    pub async fn start(
        topic: impl Into<String>,
        options: SourceOptions,
        group: Arc<dyn ConsumerGroup>,
        admin_factory: AdminFactory,
    ) -> Result<Self> {
        let topic = topic.into();
        let state = StateCell::new();
        state.transition(SourceState::Connecting);

        let admin = admin_factory()?;
        let handler = Arc::new(ConsumerHandler::new(options.buffer_size, state.clone()));
        let lifecycle = CancellationToken::new();

        info!(topic = %topic, "Starting Kafka consumer...");
        let task = tokio::spawn(run_lifecycle(
            group,
            vec![topic.clone()],
            Arc::clone(&handler),
            state.clone(),
            lifecycle.clone(),
        ));

        let source = Self {
            topic,
            handler,
            admin: RwLock::new(admin),
            admin_factory,
            state,
            lifecycle,
            task: Mutex::new(Some(task)),
        };

        // wait for the consumer to setup.
        let fault = tokio::select! {
            _ = source.handler.wait_ready() => None,
            reason = source.state.faulted() => Some(reason.unwrap_or_default()),
        };
        match fault {
            None => {
                info!(topic = %source.topic, "Consumer ready. Starting kafka reader...");
                Ok(source)
            }
            Some(reason) => {
                let _ = source.close().await;
                Err(Error::Connect(format!("failed to join consumer group: {reason}")))
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SourceState {
        self.state.get()
    }

    /// Resolves with the reason once the consumer group failed for good.
    pub async fn faulted(&self) -> Option<String> {
        self.state.faulted().await
    }

    /// Partitions of the topic owned by the current session.
    pub async fn partitions(&self) -> Vec<i32> {
        self.handler
            .claims()
            .await
            .remove(&self.topic)
            .unwrap_or_default()
    }

    /// Lazily read up to `count` messages, stopping early once `timeout`
    /// elapses. Messages already read are kept when the deadline hits.
    pub fn read(
        &self,
        count: usize,
        timeout: Duration,
    ) -> impl Stream<Item = Message> + Send + 'static {
        self.state
            .advance_if(&SourceState::Ready, SourceState::Consuming);

        let deadline = deadline_after(timeout);
        let queue = self.handler.messages();
        stream::unfold(
            (queue, None, 0usize),
            move |(queue, guard, produced)| async move {
                if produced >= count {
                    return None;
                }
                let mut guard = match guard {
                    Some(guard) => guard,
                    None => tokio::time::timeout_at(deadline, Arc::clone(&queue).lock_owned())
                        .await
                        .ok()?,
                };
                let record = tokio::time::timeout_at(deadline, guard.recv()).await.ok()??;
                let message = record.into_message(Utc::now());
                Some((message, (queue, Some(guard), produced + 1)))
            },
        )
    }

    /// Collect [`KafkaSource::read`] into a batch.
    pub async fn read_batch(&self, count: usize, timeout: Duration) -> Vec<Message> {
        self.read(count, timeout).collect().await
    }

    /// Mark the records behind `offsets` as consumed.
    ///
    /// A malformed token fails the whole call before anything is marked.
    /// Tokens that cannot be marked on the current session are logged and
    /// skipped; Kafka redelivers them to whichever member owns the partition
    /// next.
    pub async fn ack(&self, offsets: &[SourceOffset]) -> Result<()> {
        let offsets = offsets
            .iter()
            .map(KafkaOffset::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let _inflight = self.handler.begin_ack().await;
        let Some(session) = self.handler.current_session().await else {
            warn!(count = offsets.len(), "No active consumer session, skipping ack");
            return Ok(());
        };

        for offset in &offsets {
            if let Err(e) =
                session.mark_offset(offset.topic(), offset.partition(), offset.sequence())
            {
                warn!(
                    offset = %offset,
                    generation_id = session.generation_id(),
                    error = %e,
                    "Failed to mark offset, skipping"
                );
            }
        }
        debug!(
            count = offsets.len(),
            generation_id = session.generation_id(),
            "Marked offsets"
        );
        Ok(())
    }

    /// Records not yet committed by the consumer group, summed over every
    /// partition the group has committed for. [`PENDING_UNAVAILABLE`] when
    /// the lag cannot be computed.
    pub async fn pending(&self) -> i64 {
        let state = self.state.get();
        if state == SourceState::Draining || state.is_terminal() {
            return PENDING_UNAVAILABLE;
        }

        let admin = Arc::clone(&*self.admin.read().await);

        let committed = match admin.partitions(&self.topic).await {
            Ok(partitions) => admin.committed_offsets(&self.topic, &partitions).await,
            Err(e) => Err(e),
        };
        let committed = match committed {
            Ok(committed) => committed,
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    error = %e,
                    "Failed to fetch committed offsets, refreshing admin client"
                );
                self.refresh_admin().await;
                return PENDING_UNAVAILABLE;
            }
        };

        let mut partitions: Vec<_> = committed.into_iter().collect();
        partitions.sort_unstable_by_key(|(partition, _)| *partition);

        let mut total = 0;
        for (partition, committed) in partitions {
            let Some(committed) = committed else {
                continue;
            };
            match admin.newest_offset(&self.topic, partition).await {
                Ok(newest) => total += newest - committed,
                Err(e) => {
                    debug!(
                        topic = %self.topic,
                        partition,
                        error = %e,
                        "Failed to fetch newest offset"
                    );
                    return PENDING_UNAVAILABLE;
                }
            }
        }
        total
    }

    async fn refresh_admin(&self) {
        match (self.admin_factory)() {
            Ok(fresh) => {
                let stale = std::mem::replace(&mut *self.admin.write().await, fresh);
                stale.close();
                info!(topic = %self.topic, "Refreshed Kafka admin client");
            }
            Err(e) => error!(
                topic = %self.topic,
                error = %e,
                "Failed to refresh Kafka admin client"
            ),
        }
    }

    /// Stop consuming and release every client. Later calls return `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        info!(topic = %self.topic, "Shutting down Kafka source...");
        self.state.transition(SourceState::Draining);
        self.lifecycle.cancel();

        let result = task
            .await
            .map_err(|e| Error::ConsumeFatal(format!("lifecycle task failed: {e}")))
            .and_then(|result| result);

        self.admin.read().await.close();
        self.state.transition(SourceState::Closed);
        info!(topic = %self.topic, "Kafka source closed");
        result
    }
}

impl Drop for KafkaSource {
    fn drop(&mut self) {
        self.lifecycle.cancel();
    }
}

/// `now + timeout`, saturating at roughly thirty years for huge timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// Keep the group joined until `lifecycle` is cancelled or consuming fails.
async fn run_lifecycle(
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    handler: Arc<ConsumerHandler>,
    state: StateCell,
    lifecycle: CancellationToken,
) -> Result<()> {
    let drain = group.take_errors().map(|mut errors| {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = lifecycle.cancelled() => break,
                    err = errors.recv() => match err {
                        Some(err) => error!(error = %err, "Kafka consumer error"),
                        None => break,
                    },
                }
            }
        })
    });

    let delegate: Arc<dyn ConsumerGroupHandler> = handler;
    let result = loop {
        // consume returns on every rebalance and must be called again to
        // rejoin the group with the new claims.
        if let Err(e) = group
            .consume(&lifecycle, &topics, Arc::clone(&delegate))
            .await
        {
            error!(error = %e, "Kafka consumer failed with error");
            let fatal = match e {
                Error::ConsumeFatal(reason) => reason,
                other => other.to_string(),
            };
            state.transition(SourceState::Faulted(fatal.clone()));
            lifecycle.cancel();
            break Err(Error::ConsumeFatal(fatal));
        }
        if lifecycle.is_cancelled() {
            break Ok(());
        }
    };

    if let Some(drain) = drain {
        if let Err(e) = drain.await {
            warn!(error = %e, "Kafka error drain task failed");
        }
    }
    if let Err(e) = group.close() {
        warn!(error = %e, "Failed to close Kafka consumer group");
    }
    result
}
