use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a [`crate::KafkaSource`].
///
/// ```text
/// Constructing -> Connecting -> Ready -> Consuming <-> Rebalancing -> Draining -> Closed
/// ```
///
/// `Faulted` is reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    Constructing,
    Connecting,
    Ready,
    Consuming,
    Rebalancing,
    Draining,
    Closed,
    Faulted(String),
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceState::Closed | SourceState::Faulted(_))
    }

    fn can_become(&self, next: &SourceState) -> bool {
        match (self, next) {
            (SourceState::Closed | SourceState::Faulted(_), _) => false,
            (_, SourceState::Faulted(_)) => true,
            (SourceState::Draining, next) => *next == SourceState::Closed,
            (current, next) => current != next,
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceState::Faulted(reason) => write!(f, "faulted ({reason})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Shared, observable [`SourceState`].
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<SourceState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SourceState::Constructing);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn get(&self) -> SourceState {
        self.tx.borrow().clone()
    }

    /// Move to `next` unless the transition is not allowed. Returns whether
    /// the state changed.
    pub(crate) fn transition(&self, next: SourceState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|current| {
            if current.can_become(&next) {
                from = Some(std::mem::replace(current, next.clone()));
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!(from = %from, to = %next, "Kafka source state changed");
        }
        changed
    }

    /// Move to `next` only while the state is still `from`.
    pub(crate) fn advance_if(&self, from: &SourceState, next: SourceState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if current == from && current.can_become(&next) {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            debug!(from = %from, to = %next, "Kafka source state changed");
        }
        changed
    }

    /// Resolves with the fault reason once the state becomes `Faulted`.
    pub(crate) async fn faulted(&self) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, SourceState::Faulted(_)))
            .await
            .ok()?;
        let reason = match &*state {
            SourceState::Faulted(reason) => Some(reason.clone()),
            _ => None,
        };
        reason
    }
}
