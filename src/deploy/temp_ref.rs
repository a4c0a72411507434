//! Reference-counted lifetime of staged temp files
//!
//! A staged artifact may be fetched by several devices at once. Each in-flight
//! transfer holds one reference; when the count drops to zero the file is
//! deleted after a grace period, unless a new reference arrives first.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

/// Directory component that marks a staged file
pub const TEMP_DIR_NAME: &str = "_temp";

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(300);

struct TempRef {
    path: PathBuf,
    ref_count: usize,
    generation: u64,
    pending_delete: Option<JoinHandle<()>>,
}

impl TempRef {
    fn cancel_delete(&mut self) {
        if let Some(timer) = self.pending_delete.take() {
            timer.abort();
        }
    }
}

/// Shared reference counts for staged temp files, keyed by shared id
pub struct SharedTempRefs {
    entries: Arc<Mutex<HashMap<String, TempRef>>>,
    grace: Duration,
}

impl SharedTempRefs {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Take a reference on `shared_id`, cancelling any pending deletion
    ///
    /// The first registration records `path`; later ones only count.
    pub async fn register_ref(&self, shared_id: &str, path: impl AsRef<Path>) {
        if shared_id.is_empty() {
            return;
        }

        let mut entries = self.entries.lock().await;
        match entries.get_mut(shared_id) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.generation += 1;
                entry.cancel_delete();
            }
            None => {
                entries.insert(
                    shared_id.to_string(),
                    TempRef {
                        path: path.as_ref().to_path_buf(),
                        ref_count: 1,
                        generation: 1,
                        pending_delete: None,
                    },
                );
            }
        }
    }

    /// Drop a reference on `shared_id`; at zero, arm the grace-period deletion
    pub async fn release_ref(&self, shared_id: &str) {
        if shared_id.is_empty() {
            return;
        }

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(shared_id) else {
            return;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }

        entry.generation += 1;
        entry.cancel_delete();

        let generation = entry.generation;
        let registry = self.entries.clone();
        let id = shared_id.to_string();
        let grace = self.grace;
        entry.pending_delete = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let path = {
                let mut entries = registry.lock().await;
                match entries.get(&id) {
                    Some(entry) if entry.generation == generation && entry.ref_count == 0 => {
                        entries.remove(&id).map(|entry| entry.path)
                    }
                    _ => None,
                }
            };

            if let Some(path) = path {
                remove_with_retry(&path).await;
            }
        }));
    }

    /// Current reference count, if the id is tracked
    pub async fn ref_count(&self, shared_id: &str) -> Option<usize> {
        self.entries
            .lock()
            .await
            .get(shared_id)
            .map(|entry| entry.ref_count)
    }

    /// Number of tracked ids (including ones awaiting deletion)
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Whether `path` lives under a staging (`_temp`) directory
///
/// Paths with a `..` component never qualify.
pub fn is_staged_path(path: &Path) -> bool {
    // `..` could climb back out of the staging directory
    if path.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    // The file itself does not count, only its parents
    path.parent().map_or(false, |parent| {
        parent.components().any(|c| c.as_os_str() == TEMP_DIR_NAME)
    })
}

async fn remove_with_retry(path: &Path) {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Cleaned temp file: {}", path.display());
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                warn!("Failed to clean temp file {}: {}", path.display(), e);
            }
            Err(_) => tokio::time::sleep(REMOVE_RETRY_DELAY).await,
        }
    }
}
