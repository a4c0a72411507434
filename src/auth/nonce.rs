//! Consumed-nonce ledger and its periodic sweep

use fleet_shared::{auth, now_secs};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Records consumed nonces per namespace so each is accepted at most once per TTL
pub struct NonceLedger {
    ttl_secs: i64,
    /// `namespace:nonce` -> consumed-at (unix seconds)
    store: Mutex<HashMap<String, i64>>,
}

impl NonceLedger {
    /// Create a ledger with the standard TTL
    pub fn new() -> Self {
        Self::with_ttl(auth::NONCE_TTL_SECS)
    }

    /// Create a ledger with a custom TTL in seconds
    pub fn with_ttl(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Accept `nonce` once within `namespace`; replays inside the TTL are rejected
    pub async fn check_and_store(&self, namespace: &str, nonce: &str) -> bool {
        self.check_and_store_at(namespace, nonce, now_secs()).await
    }

    /// Same as [`check_and_store`](Self::check_and_store) with an explicit clock
    pub async fn check_and_store_at(&self, namespace: &str, nonce: &str, now: i64) -> bool {
        if nonce.is_empty() {
            return false;
        }
        let cutoff = now - self.ttl_secs;
        let key = format!("{namespace}:{nonce}");

        let mut store = self.store.lock().await;
        if let Some(&consumed_at) = store.get(&key) {
            if consumed_at >= cutoff {
                return false;
            }
        }
        store.insert(key, now);
        true
    }

    /// Drop every record consumed before `now - ttl`; returns how many were removed
    pub async fn cleanup_expired(&self, now: i64) -> usize {
        let cutoff = now - self.ttl_secs;
        let mut store = self.store.lock().await;
        let before = store.len();
        store.retain(|_, consumed_at| *consumed_at >= cutoff);
        before - store.len()
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that periodically sweeps expired nonces
pub struct NonceSweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NonceSweeper {
    /// Start sweeping `ledger` at the standard interval
    pub fn start(ledger: Arc<NonceLedger>) -> Self {
        Self::start_with_interval(
            ledger,
            Duration::from_secs(auth::NONCE_SWEEP_INTERVAL_SECS),
        )
    }

    /// Start sweeping `ledger` every `every`
    pub fn start_with_interval(ledger: Arc<NonceLedger>, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = ledger.cleanup_expired(now_secs()).await;
                        if removed > 0 {
                            debug!("Swept {} expired nonces", removed);
                        }
                    }
                }
            }

            info!("Nonce sweeper stopped");
        });

        Self { cancel, task }
    }

    /// Stop the sweep and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_replay_within_ttl() {
        let ledger = NonceLedger::new();
        assert!(ledger.check_and_store("ws", "nonce-1").await);
        assert!(!ledger.check_and_store("ws", "nonce-1").await);
    }

    #[tokio::test]
    async fn test_allows_reuse_after_ttl() {
        let ledger = NonceLedger::new();
        let now = now_secs();
        ledger
            .store
            .lock()
            .await
            .insert("http:nonce-2".into(), now - auth::NONCE_TTL_SECS - 1);

        assert!(ledger.check_and_store_at("http", "nonce-2", now).await);
        assert!(!ledger.check_and_store_at("http", "nonce-2", now).await);
    }

    #[tokio::test]
    async fn test_reaccepted_once_clock_passes_ttl() {
        let ledger = NonceLedger::new();
        assert!(ledger.check_and_store_at("ws", "n", 1_000).await);
        assert!(!ledger.check_and_store_at("ws", "n", 1_000 + auth::NONCE_TTL_SECS).await);
        assert!(ledger.check_and_store_at("ws", "n", 1_001 + auth::NONCE_TTL_SECS).await);
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let ledger = NonceLedger::new();
        assert!(ledger.check_and_store("http", "same").await);
        assert!(ledger.check_and_store("ws", "same").await);
        assert!(!ledger.check_and_store("ws", "same").await);
    }

    #[tokio::test]
    async fn test_empty_nonce_rejected() {
        let ledger = NonceLedger::new();
        assert!(!ledger.check_and_store("ws", "").await);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_expired_nonces() {
        let ledger = NonceLedger::new();
        let now = now_secs();
        {
            let mut store = ledger.store.lock().await;
            store.insert("ws:old".into(), now - auth::NONCE_TTL_SECS - 10);
            store.insert("ws:edge".into(), now - auth::NONCE_TTL_SECS);
            store.insert("ws:new".into(), now);
        }

        assert_eq!(ledger.cleanup_expired(now).await, 1);

        let store = ledger.store.lock().await;
        assert!(!store.contains_key("ws:old"));
        assert!(store.contains_key("ws:edge"));
        assert!(store.contains_key("ws:new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_and_stops() {
        let ledger = Arc::new(NonceLedger::new());
        ledger
            .store
            .lock()
            .await
            .insert("ws:stale".into(), now_secs() - auth::NONCE_TTL_SECS - 60);
        assert!(ledger.check_and_store("ws", "fresh").await);

        let sweeper = NonceSweeper::start(ledger.clone());

        for _ in 0..10 {
            if ledger.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(auth::NONCE_SWEEP_INTERVAL_SECS)).await;
        }
        assert_eq!(ledger.len().await, 1);

        sweeper.stop().await;
    }
}
