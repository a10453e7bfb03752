//! Errors raised by key derivation, serializers, and data files.

use std::path::PathBuf;

use opcache_pool::PoolError;

/// Failures inside the cache crate.
///
/// None of these is fatal to a request: the compile path turns each of them
/// into an uncached compile. Only startup (segment, lock, preload) may fail
/// the process.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// OS error.
        source: std::io::Error,
    },

    /// No cache key could be formed for the path.
    #[error("cannot derive cache key for {path}: {reason}")]
    KeyUnavailable {
        /// The requested path.
        path: PathBuf,
        /// Why probing failed.
        reason: String,
    },

    /// The file was modified too recently to be cached safely.
    #[error("{path} was modified too recently to cache")]
    TooRecent {
        /// The requested path.
        path: PathBuf,
    },

    /// The backing pool ran out of space.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A serializer could not encode or decode a value.
    #[error("serializer failed: {reason}")]
    Serialization {
        /// Message from the serializer.
        reason: String,
    },

    /// A data file is too short or its header does not decode.
    #[error("{path} is not a data file: {reason}")]
    InvalidHeader {
        /// The data file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The payload does not match the checksum in its header.
    #[error("{path} is corrupt: header checksum {expected}, payload checksum {actual}")]
    ChecksumMismatch {
        /// The data file.
        path: PathBuf,
        /// Checksum recorded in the header.
        expected: String,
        /// Checksum of the bytes read.
        actual: String,
    },

    /// The data file was written by an incompatible format version.
    #[error("{path} has format version {actual}, this build reads {expected}")]
    VersionMismatch {
        /// The data file.
        path: PathBuf,
        /// Version this build reads.
        expected: u32,
        /// Version found in the file.
        actual: u32,
    },

    /// No serializer is registered under the name.
    #[error("unknown serializer '{name}'")]
    UnknownSerializer {
        /// The requested serializer name.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_names_the_path() {
        let err = CacheError::Io {
            path: PathBuf::from("/srv/data/users.data"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "/srv/data/users.data: denied");
    }

    #[test]
    fn key_unavailable_carries_reason() {
        let err = CacheError::KeyUnavailable {
            path: PathBuf::from("lib.src"),
            reason: "not found in search path".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot derive cache key for lib.src: not found in search path"
        );
    }

    #[test]
    fn pool_error_is_transparent() {
        let err = CacheError::from(PoolError::Exhausted {
            requested: 10,
            available: 2,
        });
        assert!(err.to_string().starts_with("pool exhausted"));
    }

    #[test]
    fn corrupt_file_reports_both_checksums() {
        let err = CacheError::ChecksumMismatch {
            path: PathBuf::from("a.data"),
            expected: "00ff".into(),
            actual: "ff00".into(),
        };
        assert_eq!(
            err.to_string(),
            "a.data is corrupt: header checksum 00ff, payload checksum ff00"
        );
    }

    #[test]
    fn old_format_is_named() {
        let err = CacheError::VersionMismatch {
            path: PathBuf::from("old.data"),
            expected: 1,
            actual: 0,
        };
        assert_eq!(
            err.to_string(),
            "old.data has format version 0, this build reads 1"
        );
    }

    #[test]
    fn unknown_serializer_display() {
        let err = CacheError::UnknownSerializer { name: "igbinary".into() };
        assert_eq!(err.to_string(), "unknown serializer 'igbinary'");
    }
}
