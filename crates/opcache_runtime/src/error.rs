//! Error types for compilation, installation, and startup.

use std::fmt;
use std::path::PathBuf;

use opcache_cache::CacheError;
use opcache_lock::LockError;
use opcache_pool::PoolError;

/// What kind of definition a [`RegistryError`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    /// A function.
    Function,
    /// A class.
    Class,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionKind::Function => f.write_str("function"),
            DefinitionKind::Class => f.write_str("class"),
        }
    }
}

/// Rejections from the live environment's symbol tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A definition with this name is already registered.
    #[error("cannot redeclare {kind} {name}")]
    NameConflict {
        /// Function or class.
        kind: DefinitionKind,
        /// The conflicting name.
        name: String,
    },

    /// The named parent class does not exist.
    #[error("class {class} extends unknown class {parent}")]
    ParentUnresolved {
        /// The class being linked.
        class: String,
        /// The missing parent.
        parent: String,
    },
}

/// Why a cached file could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The live environment rejected a definition.
    #[error("install of {path} failed: {source}")]
    Registry {
        /// The cached file.
        path: PathBuf,
        /// The rejection.
        source: RegistryError,
    },

    /// Materializing the cached image failed.
    #[error("install of {path} failed: {source}")]
    Pool {
        /// The cached file.
        path: PathBuf,
        /// The allocation failure.
        source: PoolError,
    },

    /// The entry's pool was already destroyed.
    #[error("cache entry for {path} is no longer backed")]
    Released {
        /// The cached file.
        path: PathBuf,
    },
}

/// A failure reported by the compiler. Passed through to the caller as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{}: {message}", .path.display(), .line.map(|l| format!(":{l}")).unwrap_or_default())]
pub struct CompileFailure {
    /// The file being compiled.
    pub path: PathBuf,
    /// The offending line, when known.
    pub line: Option<u32>,
    /// What went wrong.
    pub message: String,
}

impl CompileFailure {
    /// A failure at a specific line.
    pub fn at(path: impl Into<PathBuf>, line: u32, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: Some(line),
            message: message.into(),
        }
    }

    /// A failure not tied to a line.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
            message: message.into(),
        }
    }
}

/// Infrastructure failures at service construction. These are the only
/// process-fatal conditions.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The shared segment could not be created.
    #[error("shared segment: {0}")]
    Segment(#[source] PoolError),

    /// The population lock could not be created.
    #[error("population lock: {0}")]
    Lock(#[source] LockError),

    /// The value store could not be set up or preloaded.
    #[error("value store: {0}")]
    Preload(#[source] CacheError),

    /// The configured filters are invalid.
    #[error("configuration: {0}")]
    Config(#[source] opcache_config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_conflict_display() {
        let err = RegistryError::NameConflict {
            kind: DefinitionKind::Function,
            name: "f".into(),
        };
        assert_eq!(err.to_string(), "cannot redeclare function f");
    }

    #[test]
    fn parent_unresolved_display() {
        let err = RegistryError::ParentUnresolved {
            class: "Child".into(),
            parent: "Base".into(),
        };
        assert_eq!(err.to_string(), "class Child extends unknown class Base");
    }

    #[test]
    fn compile_failure_display() {
        let with_line = CompileFailure::at("/srv/a.src", 7, "unknown statement 'frobnicate'");
        assert_eq!(with_line.to_string(), "/srv/a.src:7: unknown statement 'frobnicate'");
        let without = CompileFailure::new("/srv/a.src", "no such file");
        assert_eq!(without.to_string(), "/srv/a.src: no such file");
    }

    #[test]
    fn install_error_names_the_file() {
        let err = InstallError::Registry {
            path: PathBuf::from("/srv/child.src"),
            source: RegistryError::ParentUnresolved {
                class: "Child".into(),
                parent: "Base".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("/srv/child.src"));
        assert!(msg.contains("unknown class Base"));
    }

    #[test]
    fn startup_error_display() {
        let err = StartupError::Segment(PoolError::SegmentInit {
            reason: "segment size must be positive".into(),
        });
        assert!(err.to_string().starts_with("shared segment:"));
    }
}
