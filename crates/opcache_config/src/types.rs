//! Configuration types deserialized from `opcache.toml`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::PathBuf;

/// The top-level configuration parsed from `opcache.toml`.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpcacheConfig {
    /// Settings for the compiled-artifact cache and its shared segment.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Policy for installing cached definitions into the live environment.
    #[serde(default)]
    pub install: InstallConfig,
    /// Settings for the auxiliary serialized-value store.
    #[serde(default)]
    pub values: ValuesConfig,
}

/// Settings for the compiled-artifact cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off every compile request bypasses the cache.
    pub enabled: bool,
    /// Capacity of the shared memory segment backing all cache entries.
    pub shm_size: ByteSize,
    /// Initial capacity of the key index.
    pub num_files_hint: usize,
    /// Idle seconds after which an entry may be expunged under memory
    /// pressure. Zero means any unreferenced entry may be expunged.
    pub ttl: u64,
    /// Idle seconds after which an unreferenced entry is swept by the
    /// opportunistic collector. Zero disables the sweep.
    pub gc_ttl: u64,
    /// Files larger than this are always compiled uncached.
    pub max_file_size: ByteSize,
    /// Files modified within this many seconds of the request are not cached.
    pub file_update_protection: u64,
    /// Probe the filesystem for device/inode/mtime keys. When off, absolute
    /// paths are keyed literally and never checked for staleness.
    pub stat: bool,
    /// Key entries by a SHA-256 digest of the file contents, ignoring mtime.
    pub file_digest: bool,
    /// Cache files that match no filter.
    pub cache_by_default: bool,
    /// Include (`+regex`) and exclude (`-regex` or bare `regex`) path filters.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub filters: Vec<String>,
    /// Take the population lock without blocking; skip caching when contended.
    pub write_lock: bool,
    /// Which inter-process lock backend serializes population.
    pub lock: LockKind,
    /// Identity of the lock resource (a throwaway file or a `ftok` path).
    pub lock_path: PathBuf,
    /// Fraction of the segment in use at which the cache reports busy.
    pub busy_watermark: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shm_size: ByteSize(32 * 1024 * 1024),
            num_files_hint: 1000,
            ttl: 0,
            gc_ttl: 3600,
            max_file_size: ByteSize(1024 * 1024),
            file_update_protection: 2,
            stat: true,
            file_digest: false,
            cache_by_default: true,
            filters: Vec::new(),
            write_lock: true,
            lock: LockKind::Fcntl,
            lock_path: std::env::temp_dir().join(".opcache.lock"),
            busy_watermark: 0.95,
        }
    }
}

/// Inter-process lock backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// A one-byte `fcntl` record lock over an unlinked file.
    #[default]
    Fcntl,
    /// A System V counting semaphore.
    Semaphore,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Fcntl => f.write_str("fcntl"),
            LockKind::Semaphore => f.write_str("semaphore"),
        }
    }
}

/// Policy for installing cached definitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Defer function installation until first lookup.
    pub lazy_functions: bool,
    /// Defer class installation until first lookup.
    pub lazy_classes: bool,
    /// Warn whenever dynamic inheritance forces an uncached recompile.
    pub report_autofilter: bool,
}

/// Settings for the auxiliary value store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValuesConfig {
    /// Default lifetime of stored values in seconds (zero = no expiry).
    pub ttl: u64,
    /// Initial capacity of the value index.
    pub entries_hint: usize,
    /// Name of the serializer used to encode stored values.
    pub serializer: String,
    /// Directory scanned for `*.data` files at startup.
    pub preload_path: Option<PathBuf>,
}

impl Default for ValuesConfig {
    fn default() -> Self {
        Self {
            ttl: 0,
            entries_hint: 4096,
            serializer: "bincode".to_string(),
            preload_path: None,
        }
    }
}

/// A byte count that accepts either an integer or a suffixed string
/// (`"512K"`, `"32M"`, `"1G"`) in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Returns the size in bytes.
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Parses a size string with an optional `K`, `M`, or `G` suffix.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (digits, shift) = match s.chars().last()? {
            'k' | 'K' => (&s[..s.len() - 1], 10),
            'm' | 'M' => (&s[..s.len() - 1], 20),
            'g' | 'G' => (&s[..s.len() - 1], 30),
            _ => (s, 0),
        };
        let n: u64 = digits.trim().parse().ok()?;
        n.checked_mul(1u64 << shift).map(ByteSize)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl<'de> Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a byte count or a string such as \"32M\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                ByteSize::parse(v).ok_or_else(|| E::custom(format!("invalid size '{v}'")))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Deserializes a field that can be either a single string or a list of strings.
///
/// Allows `filters = "-\\.tmp$"` as shorthand for a one-element list.
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut vec = Vec::new();
            while let Some(val) = seq.next_element::<String>()? {
                vec.push(val);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(ByteSize::parse("512"), Some(ByteSize(512)));
        assert_eq!(ByteSize::parse("4K"), Some(ByteSize(4096)));
        assert_eq!(ByteSize::parse("32m"), Some(ByteSize(32 << 20)));
        assert_eq!(ByteSize::parse("1G"), Some(ByteSize(1 << 30)));
    }

    #[test]
    fn byte_size_rejects_garbage() {
        assert_eq!(ByteSize::parse(""), None);
        assert_eq!(ByteSize::parse("M"), None);
        assert_eq!(ByteSize::parse("twelve"), None);
    }

    #[test]
    fn defaults_are_sane() {
        let c = CacheConfig::default();
        assert!(c.enabled);
        assert!(c.stat);
        assert!(!c.file_digest);
        assert_eq!(c.lock, LockKind::Fcntl);
        assert_eq!(ValuesConfig::default().serializer, "bincode");
    }

    #[test]
    fn lock_kind_display() {
        assert_eq!(LockKind::Fcntl.to_string(), "fcntl");
        assert_eq!(LockKind::Semaphore.to_string(), "semaphore");
    }
}
