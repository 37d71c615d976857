use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle on one live agent process. Cancelling it kills the process; the
/// run then finishes with whatever output it produced so far.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    run_id: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>, cancel: CancellationToken) -> Self {
        Self {
            run_id: NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            cancel,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Live runs keyed by conversation.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, ProcessHandle>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, key: &str, handle: ProcessHandle) {
        self.runs().insert(key.to_string(), handle);
    }

    /// Removes the entry for `key` if it still belongs to `handle`'s run.
    /// A newer run registered under the same key is left in place.
    pub fn remove(&self, key: &str, handle: &ProcessHandle) {
        let mut runs = self.runs();
        if runs.get(key).is_some_and(|h| h.run_id == handle.run_id) {
            runs.remove(key);
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.runs().contains_key(key)
    }

    /// Stops the run for `key`. Returns false when nothing was running.
    pub fn stop(&self, key: &str) -> bool {
        let handle = self.runs().remove(key);
        match handle {
            Some(handle) => {
                info!(key, pid = ?handle.pid(), "Stopping agent run");
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every run whose key starts with `prefix`. Returns how many.
    pub fn stop_prefix(&self, prefix: &str) -> usize {
        let stopped: Vec<ProcessHandle> = {
            let mut runs = self.runs();
            let keys: Vec<String> = runs
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| runs.remove(k)).collect()
        };
        for handle in &stopped {
            handle.stop();
        }
        stopped.len()
    }
}
