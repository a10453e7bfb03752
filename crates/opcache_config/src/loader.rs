//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::filter::FilterSet;
use crate::types::OpcacheConfig;
use std::path::Path;

/// Loads and validates an `opcache.toml` configuration from the given file.
pub fn load_config(path: &Path) -> Result<OpcacheConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Parses and validates an `opcache.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<OpcacheConfig, ConfigError> {
    let config: OpcacheConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates that configuration values are consistent.
fn validate_config(config: &OpcacheConfig) -> Result<(), ConfigError> {
    if config.cache.shm_size.bytes() == 0 {
        return Err(ConfigError::ValidationError(
            "cache.shm_size must be positive".to_string(),
        ));
    }
    let watermark = config.cache.busy_watermark;
    if !(watermark > 0.0 && watermark <= 1.0) {
        return Err(ConfigError::ValidationError(format!(
            "cache.busy_watermark must be in (0, 1], got {watermark}"
        )));
    }
    if config.values.serializer.is_empty() {
        return Err(ConfigError::ValidationError(
            "values.serializer must name a serializer".to_string(),
        ));
    }
    FilterSet::compile(&config.cache.filters)?;
    Ok(())
}
