//! The shared compiled-artifact cache and its value store.
//!
//! [`ArtifactCache`] maps a [`CacheKey`] to a reference-counted
//! [`CacheEntry`] holding a pooled image of one compiled file. Entries are
//! published first-writer-wins, checked out on every hit, and freed only when
//! evicted and no longer checked out.
//!
//! Beside it, [`ValueStore`] holds serialized values, loaded at startup from
//! data files through the [`SerializerRegistry`].

#![warn(missing_docs)]

pub mod cache;
pub mod datafile;
pub mod entry;
pub mod error;
pub mod key;
pub mod serializer;
pub mod store;
pub mod value;

pub use cache::{ArtifactCache, CacheInfo, EntryInfo};
pub use datafile::{preload_dir, read_data_file, write_data_file, DATA_EXTENSION};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use key::{derive_key, CacheKey, KeySource};
pub use serializer::{JsonStyle, Serializer, SerializerRegistry, MAX_SERIALIZERS};
pub use store::ValueStore;
pub use value::Value;
