//! The process-wide cache service.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use opcache_cache::{preload_dir, ArtifactCache, CacheInfo, SerializerRegistry, ValueStore};
use opcache_config::{FilterSet, LockKind, OpcacheConfig};
use opcache_ir::OpArray;
use opcache_lock::{FcntlLock, Lock, SemaphoreLock, WriteLock};
use opcache_pool::{Allocator, HeapAllocator, SharedSegment};
use tracing::info;

use crate::compiler::Compiler;
use crate::env::Environment;
use crate::error::StartupError;
use crate::session::RequestSession;

/// Why a request compiled without the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Caching is switched off.
    Disabled,
    /// The cache is expunging or near capacity.
    Busy,
    /// A path filter excluded the file.
    Filtered,
    /// No key could be derived for the file.
    NoKey,
    /// The file is larger than the configured ceiling.
    TooLarge,
    /// The population lock was contended or failed.
    LockUnavailable,
    /// The shared segment could not hold the compiled file.
    PoolExhausted,
    /// Another populator published the file first.
    InsertRaced,
    /// The cached file could not be installed.
    InstallFailed,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BypassReason::Disabled => "disabled",
            BypassReason::Busy => "busy",
            BypassReason::Filtered => "filtered",
            BypassReason::NoKey => "no key",
            BypassReason::TooLarge => "too large",
            BypassReason::LockUnavailable => "lock unavailable",
            BypassReason::PoolExhausted => "pool exhausted",
            BypassReason::InsertRaced => "insert raced",
            BypassReason::InstallFailed => "install failed",
        };
        f.write_str(s)
    }
}

/// Where a compiled file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Installed from the cache.
    Hit,
    /// Compiled and published by this request.
    Populated,
    /// Compiled without touching the cache.
    Uncached(BypassReason),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Hit => f.write_str("hit"),
            Origin::Populated => f.write_str("populated"),
            Origin::Uncached(reason) => write!(f, "uncached ({reason})"),
        }
    }
}

/// The result of one compile request: the file body to execute and how it
/// was obtained.
#[derive(Debug, Clone)]
pub struct CompiledFile {
    /// Executable file body, owned by the caller.
    pub op_array: Arc<OpArray>,
    /// Cache outcome.
    pub origin: Origin,
}

/// Owns the shared segment, the artifact cache, the population lock and the
/// value store. Built once at startup and shared by reference with every
/// request.
pub struct CacheService {
    pub(crate) config: OpcacheConfig,
    pub(crate) filters: FilterSet,
    pub(crate) heap: Arc<dyn Allocator>,
    pub(crate) cache: ArtifactCache,
    pub(crate) write_lock: WriteLock,
    pub(crate) values: ValueStore,
    pub(crate) compiler: Box<dyn Compiler>,
    pub(crate) force_update: bool,
    pub(crate) search_path: Vec<PathBuf>,
}

impl CacheService {
    /// Creates the shared segment and lock described by `config` and builds
    /// the service on them.
    pub fn new(config: OpcacheConfig, compiler: Box<dyn Compiler>) -> Result<Self, StartupError> {
        let capacity = usize::try_from(config.cache.shm_size.bytes()).unwrap_or(usize::MAX);
        let segment = SharedSegment::create(capacity).map_err(StartupError::Segment)?;
        let lock: Box<dyn Lock> = match config.cache.lock {
            LockKind::Fcntl => {
                Box::new(FcntlLock::create(&config.cache.lock_path).map_err(StartupError::Lock)?)
            }
            LockKind::Semaphore => {
                Box::new(SemaphoreLock::create(None, 0, 1).map_err(StartupError::Lock)?)
            }
        };
        Self::with_parts(config, Arc::new(segment), lock, compiler)
    }

    /// Builds the service over an existing segment and lock backend.
    pub fn with_parts(
        config: OpcacheConfig,
        segment: Arc<dyn Allocator>,
        lock: Box<dyn Lock>,
        compiler: Box<dyn Compiler>,
    ) -> Result<Self, StartupError> {
        let filters = FilterSet::compile(&config.cache.filters).map_err(StartupError::Config)?;
        let cache = ArtifactCache::new(Arc::clone(&segment), &config.cache);
        let values = ValueStore::new(
            Arc::clone(&segment),
            SerializerRegistry::with_defaults(),
            &config.values,
        )
        .map_err(StartupError::Preload)?;

        let preloaded = match &config.values.preload_path {
            Some(dir) => preload_dir(dir, &values, unix_now()).map_err(StartupError::Preload)?.len(),
            None => 0,
        };

        let write_lock = WriteLock::new(lock);
        info!(
            segment = ?segment.capacity(),
            lock = write_lock.kind(),
            enabled = config.cache.enabled,
            preloaded,
            "cache service started"
        );

        Ok(Self {
            config,
            filters,
            heap: Arc::new(HeapAllocator::new()),
            cache,
            write_lock,
            values,
            compiler,
            force_update: false,
            search_path: Vec::new(),
        })
    }

    /// Starts a request against `env` at the current time.
    pub fn begin_request<'s>(&'s self, env: &'s mut dyn Environment) -> RequestSession<'s> {
        self.begin_request_at(env, unix_now())
    }

    /// Starts a request against `env` at a fixed time.
    pub fn begin_request_at<'s>(
        &'s self,
        env: &'s mut dyn Environment,
        now: i64,
    ) -> RequestSession<'s> {
        RequestSession::new(self, env, now)
    }

    /// When set, lookups are skipped and every cacheable file is recompiled
    /// and republished.
    pub fn set_force_update(&mut self, force: bool) {
        self.force_update = force;
    }

    /// Directories searched for relative paths during key derivation.
    pub fn set_search_path(&mut self, dirs: Vec<PathBuf>) {
        self.search_path = dirs;
    }

    /// The compiled-artifact cache.
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// The value store.
    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    /// A snapshot of the cache.
    pub fn info(&self) -> CacheInfo {
        self.cache.info()
    }

    /// The configuration the service was built with.
    pub fn config(&self) -> &OpcacheConfig {
        &self.config
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
