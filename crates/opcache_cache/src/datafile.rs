//! Persisted value files and directory preload.
//!
//! A data file is a 4-byte little-endian header length, a bincode-encoded
//! [`DataHeader`], then the payload produced by the named serializer. At
//! startup every `*.data` file in the preload directory is loaded into the
//! [`ValueStore`] under its file stem.

use std::path::{Path, PathBuf};

use opcache_common::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::serializer::{Serializer, SerializerRegistry};
use crate::store::ValueStore;
use crate::value::Value;

/// Magic bytes identifying a data file.
const DATA_MAGIC: [u8; 4] = *b"OPCD";

/// Current data file format version.
const DATA_FORMAT_VERSION: u32 = 1;

/// Extension recognised by [`preload_dir`].
pub const DATA_EXTENSION: &str = "data";

/// Header prepended to every data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHeader {
    /// Magic bytes: must be `b"OPCD"`.
    pub magic: [u8; 4],
    /// Format version.
    pub format_version: u32,
    /// Name of the serializer that produced the payload.
    pub serializer: String,
    /// Checksum of the payload.
    pub checksum: ContentHash,
}

/// Encodes `value` with `serializer` and writes it to `path`.
pub fn write_data_file(path: &Path, value: &Value, serializer: &Serializer) -> Result<(), CacheError> {
    let payload = serializer.serialize(value)?;
    let header = DataHeader {
        magic: DATA_MAGIC,
        format_version: DATA_FORMAT_VERSION,
        serializer: serializer.name().to_string(),
        checksum: ContentHash::from_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;

    let header_len = header_bytes.len() as u32;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);

    std::fs::write(path, &output).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads and validates a data file, decoding it with the serializer its
/// header names.
pub fn read_data_file(path: &Path, registry: &SerializerRegistry) -> Result<Value, CacheError> {
    let raw = std::fs::read(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: &str| CacheError::InvalidHeader {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let len_bytes: [u8; 4] = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("file too short"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_bytes = raw
        .get(4..4 + header_len)
        .ok_or_else(|| invalid("truncated header"))?;

    let (header, _): (DataHeader, usize) =
        bincode::serde::decode_from_slice(header_bytes, bincode::config::standard())
            .map_err(|e| invalid(&e.to_string()))?;
    if header.magic != DATA_MAGIC {
        return Err(invalid("bad magic bytes"));
    }
    if header.format_version != DATA_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            path: path.to_path_buf(),
            expected: DATA_FORMAT_VERSION,
            actual: header.format_version,
        });
    }

    let payload = &raw[4 + header_len..];
    let actual = ContentHash::from_bytes(payload);
    if actual != header.checksum {
        return Err(CacheError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum.to_string(),
            actual: actual.to_string(),
        });
    }

    registry.require(&header.serializer)?.deserialize(payload)
}

/// Loads every `*.data` file in `dir`, in sorted order, into `store`.
///
/// Files that fail to read or decode are skipped with a warning. Returns the
/// keys loaded.
pub fn preload_dir(dir: &Path, store: &ValueStore, now: i64) -> Result<Vec<String>, CacheError> {
    let io_err = |source| CacheError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(DATA_EXTENSION))
        .collect();
    files.sort();

    let mut loaded = Vec::with_capacity(files.len());
    for path in files {
        let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match read_data_file(&path, store.registry()) {
            Ok(value) => {
                store.store(&key, &value, 0, false, now)?;
                debug!(key = %key, path = %path.display(), "preloaded value");
                loaded.push(key);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable data file"),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcache_config::ValuesConfig;
    use opcache_pool::SharedSegment;
    use std::sync::Arc;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::with_defaults()
    }

    fn store() -> ValueStore {
        let seg = Arc::new(SharedSegment::create(1 << 16).unwrap());
        ValueStore::new(seg, registry(), &ValuesConfig::default()).unwrap()
    }

    fn value() -> Value {
        Value::List(vec![Value::Str("hello".into()), Value::Int(42)])
    }

    #[test]
    fn written_file_reads_back_with_each_serializer() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        for name in ["bincode", "json"] {
            let path = dir.path().join(format!("{name}.data"));
            write_data_file(&path, &value(), reg.find(name).unwrap()).unwrap();
            assert_eq!(read_data_file(&path, &reg).unwrap(), value());
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.data");
        let reg = registry();
        write_data_file(&path, &value(), reg.find("json").unwrap()).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            read_data_file(&path, &reg),
            Err(CacheError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.data");
        std::fs::write(&path, [1u8, 0]).unwrap();
        assert!(matches!(
            read_data_file(&path, &registry()),
            Err(CacheError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn unknown_serializer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.data");
        let mut custom = SerializerRegistry::new();
        custom.register(
            "custom",
            |v, _| {
                serde_json::to_vec(v).map_err(|e| CacheError::Serialization {
                    reason: e.to_string(),
                })
            },
            |b, _| {
                serde_json::from_slice(b).map_err(|e| CacheError::Serialization {
                    reason: e.to_string(),
                })
            },
            None,
        );
        write_data_file(&path, &value(), custom.find("custom").unwrap()).unwrap();
        assert!(matches!(
            read_data_file(&path, &registry()),
            Err(CacheError::UnknownSerializer { .. })
        ));
    }

    #[test]
    fn preload_loads_sorted_data_files_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let bin = reg.find("bincode").unwrap();
        write_data_file(&dir.path().join("zeta.data"), &Value::Int(2), bin).unwrap();
        write_data_file(&dir.path().join("alpha.data"), &Value::Int(1), bin).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.data"), "garbage").unwrap();

        let loaded = preload_dir(dir.path(), &store(), 0).unwrap();
        assert_eq!(loaded, vec!["alpha".to_string(), "zeta".to_string()]);

        let store = store();
        preload_dir(dir.path(), &store, 0).unwrap();
        assert_eq!(store.fetch("alpha", 0).unwrap(), Some(Value::Int(1)));
        assert_eq!(store.keys(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn preload_of_missing_dir_is_io_error() {
        let err = preload_dir(Path::new("/nonexistent/opcache/data"), &store(), 0).unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }
}
