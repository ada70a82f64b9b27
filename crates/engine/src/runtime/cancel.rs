//! Active-run tracking and cooperative cancellation.
//!
//! The registry enforces the single-writer invariant (one active run per
//! thread) and backs `CancelRun` / force-delete: cancelling first marks
//! the run detached so persistence ignores ordering races, then cancels
//! its token, which unblocks provider streams, tools, and approval waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle owned by a running turn-loop task.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub endpoint_id: String,
    pub thread_id: String,
    pub cancel: CancellationToken,
    detached: Arc<AtomicBool>,
    done: Arc<Notify>,
}

impl RunHandle {
    /// True once the run was detached (cancel/force-delete); persistence
    /// of thread-level state is skipped after this point.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RegistryInner {
    by_thread: HashMap<(String, String), Uuid>,
    runs: HashMap<Uuid, RunHandle>,
}

/// Guarded by one mutex held only briefly.
#[derive(Default)]
pub struct RunRegistry {
    inner: Mutex<RegistryInner>,
    cleared: Notify,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new active run for a thread. The caller must have
    /// ensured no other run is active.
    pub fn register(&self, endpoint_id: &str, thread_id: &str, run_id: Uuid) -> RunHandle {
        let handle = RunHandle {
            run_id,
            endpoint_id: endpoint_id.to_string(),
            thread_id: thread_id.to_string(),
            cancel: CancellationToken::new(),
            detached: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Notify::new()),
        };
        let mut inner = self.inner.lock();
        inner
            .by_thread
            .insert((endpoint_id.to_string(), thread_id.to_string()), run_id);
        inner.runs.insert(run_id, handle.clone());
        handle
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunHandle> {
        self.inner.lock().runs.get(&run_id).cloned()
    }

    pub fn active_run_for_thread(&self, endpoint_id: &str, thread_id: &str) -> Option<Uuid> {
        self.inner
            .lock()
            .by_thread
            .get(&(endpoint_id.to_string(), thread_id.to_string()))
            .copied()
    }

    /// Drop the mappings for a run (normal exit or detach). Idempotent.
    pub fn detach(&self, run_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.runs.remove(&run_id) {
            handle.detached.store(true, Ordering::Release);
            handle.done.notify_waiters();
            let key = (handle.endpoint_id.clone(), handle.thread_id.clone());
            if inner.by_thread.get(&key) == Some(&run_id) {
                inner.by_thread.remove(&key);
            }
        }
        drop(inner);
        self.cleared.notify_waiters();
    }

    /// Cancel a run: detach the mappings immediately, then signal the
    /// token. Returns the handle when an in-memory run existed.
    pub fn cancel(&self, run_id: Uuid) -> Option<RunHandle> {
        let handle = self.get(run_id)?;
        self.detach(run_id);
        handle.cancel.cancel();
        Some(handle)
    }

    /// Wait until the thread has no active mapping, up to `timeout`.
    pub async fn wait_thread_clear(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_run_for_thread(endpoint_id, thread_id).is_none() {
                return true;
            }
            let notified = self.cleared.notified();
            if self.active_run_for_thread(endpoint_id, thread_id).is_none() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_run_for_thread(endpoint_id, thread_id).is_none();
            }
        }
    }
}
