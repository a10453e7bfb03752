//! Cache key derivation.
//!
//! A key names a file two ways: its *identity* ([`KeySource`]), which selects
//! the index slot, and its *version* (mtime, or a content digest), which
//! decides whether the cached entry in that slot is still current.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use opcache_common::FileDigest;
use opcache_config::CacheConfig;

use crate::error::CacheError;

/// The identity a key is indexed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySource {
    /// The path as given, without probing the filesystem.
    Literal(PathBuf),
    /// The file found by probing, named by device and inode so that every
    /// path leading to it shares one entry.
    Resolved {
        /// Device number.
        device: u64,
        /// Inode number.
        inode: u64,
    },
}

/// A derived cache key.
///
/// Two keys are equal when they name the same file at the same version. With
/// a fingerprint on both sides the version is the digest and mtime is
/// ignored; literal keys have no version.
#[derive(Debug, Clone)]
pub struct CacheKey {
    /// Index identity.
    pub source: KeySource,
    /// The path the file was found at.
    pub path: PathBuf,
    /// Last modification time, in seconds since the epoch.
    pub mtime: i64,
    /// File size in bytes, if the file was probed.
    pub size: Option<u64>,
    /// Content digest, if digest keys are enabled.
    pub fingerprint: Option<FileDigest>,
}

impl CacheKey {
    /// A literal key for `path`.
    pub fn literal(path: impl Into<PathBuf>, mtime: i64) -> Self {
        let path = path.into();
        Self {
            source: KeySource::Literal(path.clone()),
            path,
            mtime,
            size: None,
            fingerprint: None,
        }
    }

    /// A resolved key for a probed file.
    pub fn resolved(path: impl Into<PathBuf>, device: u64, inode: u64, mtime: i64, size: u64) -> Self {
        Self {
            source: KeySource::Resolved { device, inode },
            path: path.into(),
            mtime,
            size: Some(size),
            fingerprint: None,
        }
    }

    /// Attaches a content digest.
    pub fn with_fingerprint(mut self, digest: FileDigest) -> Self {
        self.fingerprint = Some(digest);
        self
    }

    /// Returns `true` if `other` names the same version of this file.
    ///
    /// Callers compare versions only for keys with the same [`KeySource`].
    pub fn same_version(&self, other: &CacheKey) -> bool {
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => a == b,
            _ => match self.source {
                KeySource::Literal(_) => true,
                KeySource::Resolved { .. } => self.mtime == other.mtime,
            },
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.same_version(other)
    }
}

impl Eq for CacheKey {}

/// Derives the key for a compile request.
///
/// With `stat` off an absolute path is keyed literally and never stat'ed;
/// in digest mode its contents are still fingerprinted. Otherwise the file is probed: paths that are absolute or
/// explicitly relative (`./`, `../`) are used as given, anything else is
/// searched for in `search_path` and then in the working directory.
///
/// Files modified within `file_update_protection` seconds of `now` are
/// refused so a file still being written is never cached.
pub fn derive_key(
    path: &Path,
    search_path: &[PathBuf],
    now: i64,
    config: &CacheConfig,
) -> Result<CacheKey, CacheError> {
    if !config.stat && path.is_absolute() {
        return fingerprinted(CacheKey::literal(path, 0), config);
    }

    let (resolved, meta) = probe(path, search_path)?;
    let mtime = meta.mtime();
    let protection = i64::try_from(config.file_update_protection).unwrap_or(i64::MAX);
    if protection > 0 && now.saturating_sub(mtime) < protection {
        return Err(CacheError::TooRecent { path: resolved });
    }

    let key = CacheKey::resolved(&resolved, meta.dev(), meta.ino(), mtime, meta.size());
    fingerprinted(key, config)
}

fn fingerprinted(key: CacheKey, config: &CacheConfig) -> Result<CacheKey, CacheError> {
    if !config.file_digest {
        return Ok(key);
    }
    let digest = FileDigest::of_file(&key.path).map_err(|source| CacheError::Io {
        path: key.path.clone(),
        source,
    })?;
    Ok(key.with_fingerprint(digest))
}

fn is_explicit(path: &Path) -> bool {
    path.is_absolute()
        || matches!(
            path.components().next(),
            Some(Component::CurDir | Component::ParentDir)
        )
}

fn probe(path: &Path, search_path: &[PathBuf]) -> Result<(PathBuf, Metadata), CacheError> {
    let candidates: Vec<PathBuf> = if is_explicit(path) {
        vec![path.to_path_buf()]
    } else {
        search_path
            .iter()
            .map(|dir| dir.join(path))
            .chain(std::iter::once(path.to_path_buf()))
            .collect()
    };

    candidates
        .into_iter()
        .find_map(|candidate| match std::fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() => Some((candidate, meta)),
            _ => None,
        })
        .ok_or_else(|| CacheError::KeyUnavailable {
            path: path.to_path_buf(),
            reason: "not found in search path".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            file_update_protection: 0,
            ..CacheConfig::default()
        }
    }

    fn far_future() -> i64 {
        i64::MAX / 2
    }

    #[test]
    fn equal_path_and_mtime_give_equal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.src");
        std::fs::write(&file, "echo hi\n").unwrap();

        let a = derive_key(&file, &[], far_future(), &config()).unwrap();
        let b = derive_key(&file, &[], far_future(), &config()).unwrap();
        assert_eq!(a, b);
        assert!(matches!(a.source, KeySource::Resolved { .. }));
        assert_eq!(a.size, Some(8));
    }

    #[test]
    fn changed_mtime_changes_resolved_key() {
        let a = CacheKey::resolved("/srv/a.src", 1, 2, 100, 10);
        let b = CacheKey::resolved("/srv/a.src", 1, 2, 101, 10);
        assert_ne!(a, b);
        assert_eq!(a.source, b.source);
    }

    #[test]
    fn digest_keys_ignore_mtime() {
        let d = FileDigest::from_bytes(b"echo hi\n");
        let a = CacheKey::resolved("/srv/a.src", 1, 2, 100, 8).with_fingerprint(d);
        let b = CacheKey::resolved("/srv/a.src", 1, 2, 999, 8).with_fingerprint(d);
        assert_eq!(a, b);

        let c = CacheKey::resolved("/srv/a.src", 1, 2, 100, 8)
            .with_fingerprint(FileDigest::from_bytes(b"echo bye\n"));
        assert_ne!(a, c);
    }

    #[test]
    fn literal_keys_when_stat_disabled() {
        let cfg = CacheConfig {
            stat: false,
            ..config()
        };
        let key = derive_key(Path::new("/does/not/exist.src"), &[], 0, &cfg).unwrap();
        assert_eq!(key.source, KeySource::Literal(PathBuf::from("/does/not/exist.src")));
        assert_eq!(key.size, None);
        assert_eq!(key, CacheKey::literal("/does/not/exist.src", 42));
    }

    #[test]
    fn relative_paths_search_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        std::fs::create_dir(&lib).unwrap();
        std::fs::write(lib.join("util.src"), "function f\n").unwrap();

        let key = derive_key(
            Path::new("util.src"),
            &[dir.path().to_path_buf(), lib.clone()],
            far_future(),
            &config(),
        )
        .unwrap();
        assert_eq!(key.path, lib.join("util.src"));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let err = derive_key(Path::new("nope.src"), &[], far_future(), &config()).unwrap_err();
        assert!(matches!(err, CacheError::KeyUnavailable { .. }));
    }

    #[test]
    fn recent_files_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hot.src");
        std::fs::write(&file, "echo hi\n").unwrap();
        let mtime = std::fs::metadata(&file).unwrap().mtime();

        let cfg = CacheConfig {
            file_update_protection: 2,
            ..config()
        };
        let err = derive_key(&file, &[], mtime + 1, &cfg).unwrap_err();
        assert!(matches!(err, CacheError::TooRecent { .. }));
        assert!(derive_key(&file, &[], mtime + 2, &cfg).is_ok());
    }

    #[test]
    fn digest_mode_fingerprints_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.src");
        std::fs::write(&file, "echo hi\n").unwrap();
        let cfg = CacheConfig {
            file_digest: true,
            ..config()
        };
        let key = derive_key(&file, &[], far_future(), &cfg).unwrap();
        assert_eq!(key.fingerprint, Some(FileDigest::from_bytes(b"echo hi\n")));
    }

    #[test]
    fn digest_mode_fingerprints_literal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.src");
        std::fs::write(&file, "echo hi\n").unwrap();
        let cfg = CacheConfig {
            stat: false,
            file_digest: true,
            ..config()
        };

        let first = derive_key(&file, &[], far_future(), &cfg).unwrap();
        assert!(matches!(first.source, KeySource::Literal(_)));
        assert_eq!(first.fingerprint, Some(FileDigest::from_bytes(b"echo hi\n")));
        assert_eq!(first, derive_key(&file, &[], far_future(), &cfg).unwrap());

        std::fs::write(&file, "echo bye\n").unwrap();
        let second = derive_key(&file, &[], far_future(), &cfg).unwrap();
        assert_eq!(first.source, second.source);
        assert_ne!(first, second);
    }

    #[test]
    fn digest_keys_survive_a_touch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.src");
        std::fs::write(&file, "echo hi\n").unwrap();
        let cfg = CacheConfig {
            file_digest: true,
            ..config()
        };
        let before = derive_key(&file, &[], far_future(), &cfg).unwrap();

        let later =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(4_000_000_000);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        let after = derive_key(&file, &[], far_future(), &cfg).unwrap();

        assert_ne!(before.mtime, after.mtime);
        assert_eq!(before, after);
    }

    #[test]
    fn unbounded_update_protection_refuses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.src");
        std::fs::write(&file, "echo hi\n").unwrap();
        let cfg = CacheConfig {
            file_update_protection: u64::MAX,
            ..config()
        };
        let err = derive_key(&file, &[], far_future(), &cfg).unwrap_err();
        assert!(matches!(err, CacheError::TooRecent { .. }));
    }
}
