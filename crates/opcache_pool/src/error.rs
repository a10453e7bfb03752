//! Error types for pool allocation.

/// Errors raised by allocators and pools.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The allocator cannot satisfy the request.
    #[error("pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted {
        /// Bytes requested.
        requested: usize,
        /// Bytes still free in the allocator.
        available: usize,
    },

    /// The shared segment was mutated outside an unprotect window.
    #[error("shared segment is write-protected")]
    Protected,

    /// The shared segment could not be created.
    #[error("failed to initialize shared segment: {reason}")]
    SegmentInit {
        /// Description of the failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_display() {
        let err = PoolError::Exhausted {
            requested: 4096,
            available: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("pool exhausted"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("100 available"));
    }

    #[test]
    fn protected_display() {
        assert_eq!(PoolError::Protected.to_string(), "shared segment is write-protected");
    }

    #[test]
    fn segment_init_display() {
        let err = PoolError::SegmentInit {
            reason: "size must be positive".into(),
        };
        assert!(err.to_string().contains("size must be positive"));
    }
}
