//! Inter-process mutual exclusion for cache population.
//!
//! Two interchangeable backends implement [`Lock`]: a one-byte `fcntl` record
//! lock held on an unlinked file ([`FcntlLock`]) and a System V counting
//! semaphore ([`SemaphoreLock`]) that additionally supports waiting for the
//! count to reach zero. [`WriteLock`] layers in-process serialization on top of
//! either backend and hands out RAII guards.
//!
//! Neither backend is reentrant. A holder that calls `lock` a second time
//! before unlocking blocks forever; callers take the lock exactly once per
//! critical section.

#![warn(missing_docs)]
#![cfg(unix)]

pub mod error;
pub mod fcntl;
pub mod guard;
pub mod sem;

pub use error::LockError;
pub use fcntl::FcntlLock;
pub use guard::{LockGuard, WriteLock};
pub use sem::SemaphoreLock;

/// A blocking, exclusive, non-reentrant lock shared between processes.
pub trait Lock: Send + Sync {
    /// Blocks until the lock is acquired.
    fn lock(&self) -> Result<(), LockError>;

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Ok(false)` if another holder owns it.
    fn try_lock(&self) -> Result<bool, LockError>;

    /// Releases the lock. Never blocks.
    fn unlock(&self) -> Result<(), LockError>;

    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;
}
