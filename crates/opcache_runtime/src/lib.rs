//! The compile-and-install protocol on top of the artifact cache.
//!
//! A [`CacheService`] is built once per process. Each request opens a
//! [`RequestSession`] over its live [`Environment`] and asks it to compile
//! files; the session serves them from the cache, populates the cache, or
//! falls back to an uncached compile, and unwinds everything it installed
//! when dropped.

#![warn(missing_docs)]

pub mod compiler;
pub mod env;
pub mod error;
mod install;
pub mod service;
pub mod session;

pub use compiler::{compile_source, CompileMode, Compiler, LineCompiler, SourceHandle};
pub use env::{Environment, LiveEnvironment};
pub use error::{CompileFailure, DefinitionKind, InstallError, RegistryError, StartupError};
pub use service::{unix_now, BypassReason, CacheService, CompiledFile, Origin};
pub use session::{Checkout, RequestSession, SessionStack};
