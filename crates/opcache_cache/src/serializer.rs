//! Named serializer registry.
//!
//! A fixed table of at most [`MAX_SERIALIZERS`] entries, appended to at
//! registration and scanned linearly by name.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::value::Value;

/// Capacity of a [`SerializerRegistry`].
pub const MAX_SERIALIZERS: usize = 16;

/// Opaque per-serializer configuration.
pub type SerializerConfig = dyn Any + Send + Sync;

/// Encodes a value.
pub type SerializeFn = fn(&Value, Option<&SerializerConfig>) -> Result<Vec<u8>, CacheError>;

/// Decodes a value.
pub type DeserializeFn = fn(&[u8], Option<&SerializerConfig>) -> Result<Value, CacheError>;

/// Output style for the `json` serializer, passed as its config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    /// Single-line output.
    Compact,
    /// Indented output.
    Pretty,
}

/// A registered (serialize, deserialize, config) triple.
#[derive(Clone)]
pub struct Serializer {
    name: String,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    config: Option<Arc<SerializerConfig>>,
}

impl Serializer {
    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encodes `value`.
    pub fn serialize(&self, value: &Value) -> Result<Vec<u8>, CacheError> {
        (self.serialize)(value, self.config.as_deref())
    }

    /// Decodes `bytes`.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value, CacheError> {
        (self.deserialize)(bytes, self.config.as_deref())
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("name", &self.name)
            .field("has_config", &self.config.is_some())
            .finish()
    }
}

/// The serializer table.
#[derive(Debug, Clone, Default)]
pub struct SerializerRegistry {
    slots: Vec<Serializer>,
}

impl SerializerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_SERIALIZERS),
        }
    }

    /// A registry holding the built-in `bincode` and `json` serializers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("bincode", bincode_serialize, bincode_deserialize, None);
        registry.register("json", json_serialize, json_deserialize, None);
        registry
    }

    /// Adds a serializer.
    ///
    /// Returns `false` when the table is full or the name is already taken.
    pub fn register(
        &mut self,
        name: &str,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
        config: Option<Arc<SerializerConfig>>,
    ) -> bool {
        if self.slots.len() >= MAX_SERIALIZERS || self.find(name).is_some() {
            return false;
        }
        self.slots.push(Serializer {
            name: name.to_string(),
            serialize,
            deserialize,
            config,
        });
        true
    }

    /// Looks a serializer up by name.
    pub fn find(&self, name: &str) -> Option<&Serializer> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Like [`find`](Self::find), but reports a missing name as an error.
    pub fn require(&self, name: &str) -> Result<&Serializer, CacheError> {
        self.find(name).ok_or_else(|| CacheError::UnknownSerializer {
            name: name.to_string(),
        })
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// Number of registered serializers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn serialization(e: impl fmt::Display) -> CacheError {
    CacheError::Serialization {
        reason: e.to_string(),
    }
}

fn bincode_serialize(value: &Value, _: Option<&SerializerConfig>) -> Result<Vec<u8>, CacheError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(serialization)
}

fn bincode_deserialize(bytes: &[u8], _: Option<&SerializerConfig>) -> Result<Value, CacheError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(serialization)?;
    if read != bytes.len() {
        return Err(serialization(format!(
            "{} trailing bytes after value",
            bytes.len() - read
        )));
    }
    Ok(value)
}

fn json_serialize(value: &Value, config: Option<&SerializerConfig>) -> Result<Vec<u8>, CacheError> {
    let style = config
        .and_then(|c| c.downcast_ref::<JsonStyle>())
        .copied()
        .unwrap_or(JsonStyle::Compact);
    let encoded = match style {
        JsonStyle::Compact => serde_json::to_vec(value),
        JsonStyle::Pretty => serde_json::to_vec_pretty(value),
    };
    encoded.map_err(serialization)
}

fn json_deserialize(bytes: &[u8], _: Option<&SerializerConfig>) -> Result<Value, CacheError> {
    serde_json::from_slice(bytes).map_err(serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::List(vec![Value::Int(-7), Value::Str("x".into()), Value::Null])
    }

    #[test]
    fn defaults_are_registered_in_order() {
        let registry = SerializerRegistry::with_defaults();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["bincode", "json"]);
    }

    #[test]
    fn each_default_decodes_what_it_encodes() {
        let registry = SerializerRegistry::with_defaults();
        for name in ["bincode", "json"] {
            let s = registry.find(name).unwrap();
            let bytes = s.serialize(&sample()).unwrap();
            assert_eq!(s.deserialize(&bytes).unwrap(), sample(), "{name}");
        }
    }

    #[test]
    fn registration_stops_at_capacity() {
        let mut registry = SerializerRegistry::new();
        for i in 0..MAX_SERIALIZERS {
            assert!(registry.register(&format!("s{i}"), bincode_serialize, bincode_deserialize, None));
        }
        assert!(!registry.register("overflow", json_serialize, json_deserialize, None));
        assert_eq!(registry.len(), MAX_SERIALIZERS);
        assert!(registry.find("overflow").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = SerializerRegistry::with_defaults();
        assert!(!registry.register("json", bincode_serialize, bincode_deserialize, None));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn config_reaches_the_serializer() {
        let mut registry = SerializerRegistry::new();
        let pretty: Arc<SerializerConfig> = Arc::new(JsonStyle::Pretty);
        registry.register("json-pretty", json_serialize, json_deserialize, Some(pretty));
        let bytes = registry
            .find("json-pretty")
            .unwrap()
            .serialize(&Value::List(vec![Value::Int(1)]))
            .unwrap();
        assert!(bytes.contains(&b'\n'));
    }

    #[test]
    fn require_reports_unknown_names() {
        let registry = SerializerRegistry::with_defaults();
        assert!(matches!(
            registry.require("msgpack"),
            Err(CacheError::UnknownSerializer { .. })
        ));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let registry = SerializerRegistry::with_defaults();
        let err = registry.find("json").unwrap().deserialize(b"{not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }
}
