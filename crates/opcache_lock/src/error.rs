//! Error types for lock operations.

use std::io;
use std::path::PathBuf;

/// Errors raised by the lock backends.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock resource could not be created or opened.
    ///
    /// This is a startup failure: without a lock the cache cannot publish
    /// safely, so the caller should refuse to start rather than guess.
    #[error("lock resource {identity} unavailable: {source}")]
    Unavailable {
        /// The file path or IPC key the lock was created from.
        identity: PathBuf,
        /// The underlying OS error.
        source: io::Error,
    },

    /// A lock, unlock, or query system call failed.
    #[error("{op} failed: {source}")]
    Io {
        /// Which operation failed.
        op: &'static str,
        /// The underlying OS error.
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = LockError::Unavailable {
            identity: PathBuf::from("/tmp/opcache.lock"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/opcache.lock"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn io_display() {
        let err = LockError::Io {
            op: "semop",
            source: io::Error::new(io::ErrorKind::Other, "boom"),
        };
        assert_eq!(err.to_string(), "semop failed: boom");
    }
}
