//! Cryptographic file fingerprints for content-addressed cache keys.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Read buffer size used while streaming a file through the hasher.
const READ_CHUNK: usize = 8 * 1024;

/// A SHA-256 digest of a source file's bytes.
///
/// When fingerprinting is enabled, two requests for files with identical bytes
/// produce identical digests regardless of modification time, so the cache
/// treats the content as the source of truth.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDigest([u8; 32]);

impl FileDigest {
    /// Computes the digest of an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Streams a file from disk through SHA-256.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileDigest({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.src");
        std::fs::write(&path, "function f\n").unwrap();
        assert_eq!(
            FileDigest::of_file(&path).unwrap(),
            FileDigest::from_bytes(b"function f\n")
        );
    }

    #[test]
    fn large_file_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.src");
        let data = vec![b'x'; READ_CHUNK * 3 + 17];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(
            FileDigest::of_file(&path).unwrap(),
            FileDigest::from_bytes(&data)
        );
    }

    #[test]
    fn known_vector() {
        let d = FileDigest::from_bytes(b"abc");
        assert_eq!(
            d.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FileDigest::of_file(Path::new("/nonexistent/opcache/file")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn debug_abbreviated() {
        let s = format!("{:?}", FileDigest::from_bytes(b"x"));
        assert!(s.starts_with("FileDigest("));
    }
}
