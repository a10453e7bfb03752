//! Error types for configuration loading and validation.

/// Errors that can occur when loading or validating an `opcache.toml` configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading the configuration file.
    #[error("failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A path filter is not a valid regular expression.
    #[error("invalid filter '{pattern}': {reason}")]
    InvalidFilter {
        /// The filter as written in the configuration.
        pattern: String,
        /// Why the regex engine rejected it.
        reason: String,
    },

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}
