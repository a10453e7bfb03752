//! Parsing and validation of `opcache.toml` configuration files.
//!
//! This crate reads the cache configuration and produces a strongly-typed
//! [`OpcacheConfig`] covering the compiled-artifact cache, the install policy,
//! and the auxiliary value store, plus the compiled include/exclude
//! [`FilterSet`].

#![warn(missing_docs)]

pub mod error;
pub mod filter;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use filter::{FilterMatch, FilterSet};
pub use loader::{load_config, load_config_from_str};
pub use types::*;
