//! RAII access to the population lock.

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::LockError;
use crate::Lock;

/// The cache's population lock: an in-process mutex stacked on an
/// inter-process [`Lock`].
///
/// Process-level record locks do not exclude threads of the same process, so
/// the local mutex is taken first. The pair is not reentrant; acquiring it
/// twice from the same thread deadlocks.
pub struct WriteLock {
    local: Mutex<()>,
    process: Box<dyn Lock>,
}

/// Proof that the population lock is held. Releases it on drop.
pub struct LockGuard<'a> {
    owner: &'a WriteLock,
    _local: MutexGuard<'a, ()>,
}

impl WriteLock {
    /// Wraps an inter-process lock backend.
    pub fn new(process: Box<dyn Lock>) -> Self {
        Self {
            local: Mutex::new(()),
            process,
        }
    }

    /// Blocks until both the local mutex and the process lock are held.
    pub fn acquire(&self) -> Result<LockGuard<'_>, LockError> {
        let local = self.local.lock();
        self.process.lock()?;
        Ok(LockGuard {
            owner: self,
            _local: local,
        })
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// Returns `Ok(None)` when another thread or process holds it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard<'_>>, LockError> {
        let Some(local) = self.local.try_lock() else {
            return Ok(None);
        };
        if !self.process.try_lock()? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            owner: self,
            _local: local,
        }))
    }

    /// Returns the backend name.
    pub fn kind(&self) -> &'static str {
        self.process.kind()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.owner.process.unlock() {
            warn!(error = %e, backend = self.owner.kind(), "failed to release population lock");
        }
    }
}
