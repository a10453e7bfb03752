//! `opcache pack` and `opcache preload`: value store data files.

use std::path::{Path, PathBuf};

use opcache_cache::{write_data_file, SerializerRegistry, Value, DATA_EXTENSION};
use opcache_runtime::{unix_now, CacheService, LineCompiler};

use crate::{GlobalArgs, PackArgs};

/// Runs the `opcache pack` command.
pub fn pack(args: &PackArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = global.load_config()?;
    let name = args.serializer.as_deref().unwrap_or(&config.values.serializer);
    let path = pack_value(&args.key, &args.json, &args.out, name)?;
    if !global.quiet {
        eprintln!("wrote {}", path.display());
    }
    Ok(0)
}

/// Encodes the JSON document `json` with serializer `name` and writes it as
/// `<out>/<key>.data`.
pub fn pack_value(
    key: &str,
    json: &str,
    out: &Path,
    name: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if key.is_empty() || key.contains(['/', '\\']) {
        return Err(format!("invalid key '{key}'").into());
    }
    let document: serde_json::Value = serde_json::from_str(json)?;
    let registry = SerializerRegistry::with_defaults();
    let serializer = registry.require(name)?;
    let path = out.join(format!("{key}.{DATA_EXTENSION}"));
    write_data_file(&path, &Value::from(document), serializer)?;
    Ok(path)
}

/// Runs the `opcache preload` command: starts a service preloading `dir` and
/// prints every key with its value as JSON.
pub fn preload(dir: &Path, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = global.load_config()?;
    config.values.preload_path = Some(dir.to_path_buf());
    let service = CacheService::new(config, Box::new(LineCompiler))?;

    let values = service.values();
    let mut keys = values.keys();
    keys.sort();
    let now = unix_now();
    for key in &keys {
        if let Some(value) = values.fetch(key, now)? {
            println!("{key} = {}", to_json(&value));
        }
    }
    if !global.quiet {
        eprintln!("{} values preloaded from {}", keys.len(), dir.display());
    }
    Ok(0)
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(f) => (*f).into(),
        Value::Str(s) => s.as_str().into(),
        Value::List(items) => items.iter().map(to_json).collect(),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), to_json(v)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcache_cache::read_data_file;

    #[test]
    fn packed_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = pack_value("user", r#"{"name": "ada", "age": 36}"#, dir.path(), "json").unwrap();
        assert_eq!(path, dir.path().join("user.data"));

        let value = read_data_file(&path, &SerializerRegistry::with_defaults()).unwrap();
        assert_eq!(
            to_json(&value),
            serde_json::json!({"name": "ada", "age": 36})
        );
    }

    #[test]
    fn unknown_serializer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack_value("k", "1", dir.path(), "msgpack").is_err());
        assert!(!dir.path().join("k.data").exists());
    }

    #[test]
    fn keys_with_separators_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack_value("../k", "1", dir.path(), "bincode").is_err());
    }

    #[test]
    fn invalid_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack_value("k", "{oops", dir.path(), "bincode").is_err());
    }
}
