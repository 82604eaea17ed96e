//! Session Lock (§4.2): a process-wide table mapping `sessionId` to a FIFO
//! mutex. Grounded on the teacher's `SessionRegistry: DashMap<SessionKey,
//! Arc<Session>>` concurrency pattern, generalized from "session as actor"
//! to a bare mutex-per-key since the store itself assumes single-writer.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// FIFO per-session mutex table. `tokio::sync::Mutex` already queues waiters
/// in arrival order, so holding one per session id gives us the fairness
/// guarantee directly.
#[derive(Default)]
pub struct SessionLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the per-session lock, run `f`, then release. If `cancel` is
    /// already cancelled by the time the lock is acquired — the client
    /// disconnected while queued behind a long turn — `f` is skipped
    /// entirely and `None` is returned, so no transcript mutation happens
    /// for aborted requests queued behind a long turn.
    pub async fn with_session_lock<F, Fut, T>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let mutex = self.lock_for(id);
        let _guard = mutex.lock().await;

        if cancel.is_cancelled() {
            tracing::debug!(session_id = id, "skipping queued request, client disconnected");
            return None;
        }

        Some(f().await)
    }

    /// Drops the table entry for `id` if nothing else holds it. Purely a
    /// memory-hygiene helper after session deletion; safe to skip.
    pub fn forget(&self, id: &str) {
        self.locks.remove_if(id, |_, m| Arc::strong_count(m) == 1);
    }

    /// Non-blocking check: is `id`'s turn lock currently held by an in-flight
    /// request? Used to reject session-mutating requests with `SessionInUse`
    /// (spec.md:67) instead of silently queuing behind a running turn.
    pub fn is_locked(&self, id: &str) -> bool {
        match self.locks.get(id) {
            Some(mutex) => mutex.try_lock().is_err(),
            None => false,
        }
    }
}
