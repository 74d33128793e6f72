use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CouncilError, CouncilResult};

/// Orchestrator-wide write mutex. At most one lease exists at a time.
#[derive(Clone, Default)]
pub struct WriteMode {
    lock: Arc<Mutex<()>>,
    held: Arc<AtomicBool>,
}

impl WriteMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock. Cancellation abandons the wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> CouncilResult<WriteLease> {
        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(CouncilError::Interrupted),
            guard = self.lock.clone().lock_owned() => guard,
        };
        Ok(self.lease(guard))
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(&self) -> Option<WriteLease> {
        self.lock
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| self.lease(guard))
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn lease(&self, guard: OwnedMutexGuard<()>) -> WriteLease {
        self.held.store(true, Ordering::SeqCst);
        let lease = WriteLease {
            id: Uuid::new_v4(),
            held: self.held.clone(),
            _guard: guard,
        };
        tracing::debug!(lease = %lease.id, "write lock acquired");
        lease
    }
}

/// Scoped ownership of the write lock; dropping it releases the lock
pub struct WriteLease {
    id: Uuid,
    held: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteLease {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        // flag goes down before the guard field releases the mutex
        self.held.store(false, Ordering::SeqCst);
        tracing::debug!(lease = %self.id, "write lock released");
    }
}

impl std::fmt::Debug for WriteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLease").field("id", &self.id).finish()
    }
}

/// Per-call context threaded through nested agent and flow calls
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    depth: usize,
    lease: Option<Arc<WriteLease>>,
}

impl CallScope {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Scope for one level deeper; fails once `max` would be exceeded
    pub fn child(&self, max: usize) -> CouncilResult<Self> {
        let depth = self.depth + 1;
        if depth > max {
            return Err(CouncilError::CallDepthExceeded { depth, max });
        }
        Ok(Self {
            depth,
            lease: self.lease.clone(),
        })
    }

    pub fn with_lease(mut self, lease: WriteLease) -> Self {
        self.lease = Some(Arc::new(lease));
        self
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub fn lease_id(&self) -> Option<Uuid> {
        self.lease.as_ref().map(|l| l.id())
    }
}
