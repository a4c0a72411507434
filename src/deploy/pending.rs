//! Fan-out/fan-in tracking of multi-target script starts
//!
//! One pending start is held per key. It becomes ready once every target has
//! reported success and is cancelled by the first failure. Either outcome
//! removes the entry and is published to every subscriber. Cancellations
//! raised by the wait timer are also queued on a lossless channel for the
//! single owner that has to clean up after them.

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

const UNKNOWN_ERROR: &str = "unknown error";
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// What to send once every target is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyStart {
    pub run_payload: Bytes,
    /// `run_payload` is a complete message to forward verbatim
    pub run_payload_prepared: bool,
    pub run_name: String,
    /// Every registered target, sorted
    pub targets: Vec<String>,
}

/// Result of reporting one target's outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Unknown key, target not outstanding, or already finalized
    Ignored,
    /// Recorded; other targets are still outstanding
    Progress { remaining: usize },
    /// That was the last outstanding target
    Ready(ReadyStart),
    /// A target failed and the whole start is cancelled
    Cancelled(String),
}

impl Completion {
    /// Whether the report was applied to a live entry
    pub fn is_handled(&self) -> bool {
        !matches!(self, Completion::Ignored)
    }
}

/// Terminal outcome broadcast to observers
///
/// `generation` is the value `register` returned for the entry, so an outcome
/// can be told apart from one for a later registration under the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Ready {
        key: String,
        generation: u64,
        start: ReadyStart,
    },
    Cancelled {
        key: String,
        generation: u64,
        reason: String,
    },
}

impl StartOutcome {
    pub fn key(&self) -> &str {
        match self {
            StartOutcome::Ready { key, .. } | StartOutcome::Cancelled { key, .. } => key,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            StartOutcome::Ready { generation, .. } | StartOutcome::Cancelled { generation, .. } => {
                *generation
            }
        }
    }

    /// Pair a terminal completion with its entry; `None` for anything else
    pub fn from_completion(key: &str, generation: u64, completion: Completion) -> Option<Self> {
        match completion {
            Completion::Ready(start) => Some(StartOutcome::Ready {
                key: key.to_string(),
                generation,
                start,
            }),
            Completion::Cancelled(reason) => Some(StartOutcome::Cancelled {
                key: key.to_string(),
                generation,
                reason,
            }),
            Completion::Ignored | Completion::Progress { .. } => None,
        }
    }
}

struct PendingStart {
    run_payload: Bytes,
    run_payload_prepared: bool,
    run_name: String,
    targets: Vec<String>,
    remaining: BTreeSet<String>,
    generation: u64,
    wait_timer: Option<JoinHandle<()>>,
}

impl PendingStart {
    fn into_ready(mut self) -> ReadyStart {
        self.stop_timer();
        ReadyStart {
            run_payload: self.run_payload,
            run_payload_prepared: self.run_payload_prepared,
            run_name: self.run_name,
            targets: self.targets,
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.wait_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    seq: u64,
    entries: HashMap<String, PendingStart>,
}

impl Registry {
    /// Apply a report; also yields the generation of the entry it applied to
    fn complete(
        &mut self,
        key: &str,
        target: &str,
        success: bool,
        reason: &str,
    ) -> (Completion, Option<u64>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return (Completion::Ignored, None);
        };
        if !entry.remaining.contains(target) {
            return (Completion::Ignored, None);
        }
        let generation = entry.generation;

        if !success {
            if let Some(mut entry) = self.entries.remove(key) {
                entry.stop_timer();
            }
            let reason = reason.trim();
            let reason = if reason.is_empty() { UNKNOWN_ERROR } else { reason };
            return (Completion::Cancelled(reason.to_string()), Some(generation));
        }

        entry.remaining.remove(target);
        if !entry.remaining.is_empty() {
            let remaining = entry.remaining.len();
            return (Completion::Progress { remaining }, Some(generation));
        }

        match self.entries.remove(key) {
            Some(entry) => (Completion::Ready(entry.into_ready()), Some(generation)),
            None => (Completion::Ignored, None),
        }
    }
}

/// Tracks outstanding multi-target script starts
pub struct PendingStartCoordinator {
    registry: Arc<Mutex<Registry>>,
    wait: Duration,
    outcomes: broadcast::Sender<StartOutcome>,
    expired_tx: mpsc::UnboundedSender<StartOutcome>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<StartOutcome>>>,
}

impl PendingStartCoordinator {
    /// Create a coordinator; a zero `wait` leaves timeouts to the caller
    pub fn new(wait: Duration) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            wait,
            outcomes,
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
        }
    }

    /// Receive every terminal outcome from now on
    ///
    /// A slow subscriber can lag and miss outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<StartOutcome> {
        self.outcomes.subscribe()
    }

    /// Every cancellation raised by the wait timer, including ones raised
    /// before this call. Only the first caller gets the receiver.
    pub async fn take_expirations(&self) -> Option<mpsc::UnboundedReceiver<StartOutcome>> {
        self.expired_rx.lock().await.take()
    }

    /// Register (or replace) the pending start for `key`
    ///
    /// Duplicate and blank targets collapse. Returns the entry's generation,
    /// or `None` when the key is blank or no target remains.
    pub async fn register<T: AsRef<str>>(
        &self,
        key: &str,
        run_payload: impl Into<Bytes>,
        run_payload_prepared: bool,
        run_name: impl Into<String>,
        targets: &[T],
    ) -> Option<u64> {
        if key.trim().is_empty() {
            return None;
        }
        let remaining: BTreeSet<String> = targets
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if remaining.is_empty() {
            return None;
        }

        let mut registry = self.registry.lock().await;
        registry.seq += 1;
        let generation = registry.seq;

        let wait_timer = (!self.wait.is_zero()).then(|| {
            let registry = self.registry.clone();
            let outcomes = self.outcomes.clone();
            let expired = self.expired_tx.clone();
            let key = key.to_string();
            let wait = self.wait;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                expire(&registry, &outcomes, &expired, &key, generation).await;
            })
        });

        let entry = PendingStart {
            run_payload: run_payload.into(),
            run_payload_prepared,
            run_name: run_name.into(),
            targets: remaining.iter().cloned().collect(),
            remaining,
            generation,
            wait_timer,
        };

        if let Some(mut stale) = registry.entries.insert(key.to_string(), entry) {
            stale.stop_timer();
            info!("Replaced stale pending start {} (generation {})", key, stale.generation);
        }

        Some(generation)
    }

    /// Report one target's outcome
    pub async fn complete(&self, key: &str, target: &str, success: bool, reason: &str) -> Completion {
        self.complete_tracked(key, target, success, reason).await.0
    }

    /// Same as [`complete`](Self::complete), also returning the generation of
    /// the entry the report was applied to
    pub async fn complete_tracked(
        &self,
        key: &str,
        target: &str,
        success: bool,
        reason: &str,
    ) -> (Completion, Option<u64>) {
        let (completion, generation) = self
            .registry
            .lock()
            .await
            .complete(key, target, success, reason);
        if let Some(generation) = generation {
            if let Some(outcome) = StartOutcome::from_completion(key, generation, completion.clone()) {
                publish(&self.outcomes, outcome);
            }
        }
        (completion, generation)
    }

    /// Drop the pending start for `key`, if any
    pub async fn clear(&self, key: &str) {
        if let Some(mut entry) = self.registry.lock().await.entries.remove(key) {
            entry.stop_timer();
            debug!("Cleared pending start {}", key);
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.registry.lock().await.entries.contains_key(key)
    }

    /// Number of outstanding pending starts
    pub async fn len(&self) -> usize {
        self.registry.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn publish(outcomes: &broadcast::Sender<StartOutcome>, outcome: StartOutcome) {
    // No subscribers is fine
    let _ = outcomes.send(outcome);
}

/// Inject a failing completion if `generation` is still waiting on targets
async fn expire(
    registry: &Mutex<Registry>,
    outcomes: &broadcast::Sender<StartOutcome>,
    expired: &mpsc::UnboundedSender<StartOutcome>,
    key: &str,
    generation: u64,
) {
    let completion = {
        let mut registry = registry.lock().await;
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        // This task is the timer; forget the handle instead of aborting ourselves
        entry.wait_timer = None;
        let Some(target) = entry.remaining.iter().next().cloned() else {
            return;
        };
        let reason = format!("timed out waiting for {} target(s)", entry.remaining.len());
        registry.complete(key, &target, false, &reason).0
    };

    warn!("Pending start {} expired", key);
    let Some(outcome) = StartOutcome::from_completion(key, generation, completion) else {
        return;
    };
    // The receiver is gone only when nothing owns cleanup
    let _ = expired.send(outcome.clone());
    publish(outcomes, outcome);
}
