//! Per-request state: checked-out entries, deferred definitions, and the
//! compile-and-install protocol.

use std::path::Path;
use std::sync::Arc;

use opcache_cache::{derive_key, CacheEntry, CacheKey};
use opcache_ir::{is_mangled, Class, FileUnit, Function, OpArray};
use opcache_lock::LockGuard;
use opcache_pool::{deep_copy_in, Pool, PoolStrategy};
use tracing::{debug, instrument, warn};

use crate::compiler::{CompileMode, SourceHandle};
use crate::env::Environment;
use crate::error::{CompileFailure, DefinitionKind};
use crate::install::{Installer, LazyTable};
use crate::service::{BypassReason, CacheService, CompiledFile, Origin};

/// A cache entry checked out by the current request, with the definitions
/// installed from it.
#[derive(Clone)]
pub struct Checkout {
    entry: Arc<CacheEntry>,
    functions: Vec<String>,
    classes: Vec<String>,
}

impl Checkout {
    /// The checked-out entry.
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Functions installed from the entry.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Classes installed from the entry.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Entries checked out by one request, most recent last.
#[derive(Default)]
pub struct SessionStack {
    checkouts: Vec<Checkout>,
}

impl SessionStack {
    /// Records a checkout.
    pub fn push(&mut self, checkout: Checkout) {
        self.checkouts.push(checkout);
    }

    /// Removes the most recent checkout.
    pub fn pop(&mut self) -> Option<Checkout> {
        self.checkouts.pop()
    }

    /// Number of outstanding checkouts.
    pub fn len(&self) -> usize {
        self.checkouts.len()
    }

    /// Returns `true` if nothing is checked out.
    pub fn is_empty(&self) -> bool {
        self.checkouts.is_empty()
    }

    /// Checkouts from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Checkout> {
        self.checkouts.iter()
    }
}

/// One request's view of the cache.
///
/// Dropping the session unwinds it: deferred definitions are forgotten,
/// everything installed from the cache is removed from the environment, and
/// checkouts are released newest first. This runs on every exit path,
/// including unwinding from a panic.
pub struct RequestSession<'s> {
    service: &'s CacheService,
    env: &'s mut dyn Environment,
    stack: SessionStack,
    lazy: LazyTable,
    now: i64,
}

impl<'s> RequestSession<'s> {
    pub(crate) fn new(service: &'s CacheService, env: &'s mut dyn Environment, now: i64) -> Self {
        Self {
            service,
            env,
            stack: SessionStack::default(),
            lazy: LazyTable::default(),
            now,
        }
    }

    fn installer(&self) -> Installer<'s> {
        let svc = self.service;
        Installer {
            policy: &svc.config.install,
            heap: &svc.heap,
        }
    }

    /// Compiles `path`, serving it from the cache when possible.
    ///
    /// Compiler failures are returned as is. Every other problem degrades to
    /// an uncached compile, reported through [`CompiledFile::origin`].
    #[instrument(skip(self))]
    pub fn compile_file(
        &mut self,
        path: &Path,
        mode: CompileMode,
    ) -> Result<CompiledFile, CompileFailure> {
        let svc = self.service;
        let config = &svc.config.cache;

        if !config.enabled {
            return self.compile_uncached(path, None, mode, BypassReason::Disabled);
        }
        if svc.cache.is_busy() {
            debug!("cache busy, bypassing");
            return self.compile_uncached(path, None, mode, BypassReason::Busy);
        }

        let key = match derive_key(path, &svc.search_path, self.now, config) {
            Ok(key) => key,
            Err(e) => {
                if !svc.filters.allows(&path.to_string_lossy(), config.cache_by_default) {
                    return self.compile_uncached(path, None, mode, BypassReason::Filtered);
                }
                debug!(error = %e, "no cache key");
                return self.compile_uncached(path, None, mode, BypassReason::NoKey);
            }
        };
        let resolved = key.path.clone();
        // Filters see the path the file was found at, not the requested one.
        if !svc.filters.allows(&resolved.to_string_lossy(), config.cache_by_default) {
            return self.compile_uncached(path, Some(&resolved), mode, BypassReason::Filtered);
        }
        let size = match key.size {
            Some(size) => size,
            None => match std::fs::metadata(&resolved) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    debug!(error = %e, "cannot stat source");
                    return self.compile_uncached(path, Some(&resolved), mode, BypassReason::NoKey);
                }
            },
        };
        if size > config.max_file_size.bytes() {
            debug!(size, "file exceeds cache ceiling");
            return self.compile_uncached(path, Some(&resolved), mode, BypassReason::TooLarge);
        }

        if !svc.force_update {
            if let Some(entry) = svc.cache.find(&key, self.now) {
                match self.install(entry) {
                    Ok(op_array) => {
                        return Ok(CompiledFile {
                            op_array,
                            origin: Origin::Hit,
                        })
                    }
                    Err(reason) => {
                        return self.compile_uncached(path, Some(&resolved), mode, reason)
                    }
                }
            }
        }

        let guard = match self.acquire_write_lock() {
            Some(guard) => guard,
            None => {
                return self.compile_uncached(
                    path,
                    Some(&resolved),
                    mode,
                    BypassReason::LockUnavailable,
                )
            }
        };

        let source = SourceHandle {
            path: path.to_path_buf(),
            resolved: Some(resolved.clone()),
        };
        let (op_array, marks) = self.compile_tracked(&source, mode)?;
        let unit = FileUnit {
            filename: resolved,
            main: Arc::clone(&op_array),
            functions: self.env.functions_since(marks.0),
            classes: self.env.classes_since(marks.1),
        };
        let origin = self.publish(key, &unit);
        drop(guard);
        Ok(CompiledFile { op_array, origin })
    }

    fn acquire_write_lock(&self) -> Option<LockGuard<'s>> {
        let svc = self.service;
        let lock = &svc.write_lock;
        let result = if svc.config.cache.write_lock {
            lock.try_acquire()
        } else {
            lock.acquire().map(Some)
        };
        match result {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!("population lock contended");
                None
            }
            Err(e) => {
                warn!(error = %e, "population lock failed");
                None
            }
        }
    }

    /// Installs a found entry and checks it out. On failure the entry is
    /// released and nothing it declares remains installed.
    fn install(&mut self, entry: Arc<CacheEntry>) -> Result<Arc<OpArray>, BypassReason> {
        let installer = self.installer();
        match installer.install_entry(&entry, &mut *self.env, &mut self.lazy) {
            Ok(installed) => {
                self.env.mark_included(entry.filename());
                self.stack.push(Checkout {
                    entry,
                    functions: installed.functions,
                    classes: installed.classes,
                });
                Ok(installed.main)
            }
            Err(e) => {
                debug!(error = %e, "install failed, recompiling");
                self.service.cache.release(&entry);
                Err(BypassReason::InstallFailed)
            }
        }
    }

    /// Copies a freshly compiled unit into a shared pool and publishes it.
    fn publish(&self, key: CacheKey, unit: &FileUnit) -> Origin {
        let svc = self.service;
        let copied = Pool::create(PoolStrategy::Shared, Arc::clone(svc.cache.segment()))
            .and_then(|mut pool| deep_copy_in(unit, &mut pool).map(|image| (image, pool)));
        let (image, pool) = match copied {
            Ok(parts) => parts,
            Err(e) => {
                warn!(path = %unit.filename.display(), error = %e, "cannot cache compiled file");
                let expunged = svc.cache.expunge(self.now);
                debug!(expunged, "expunged after failed copy");
                return Origin::Uncached(BypassReason::PoolExhausted);
            }
        };

        let entry = CacheEntry::new(key, image, pool, self.now);
        let published = if svc.force_update {
            svc.cache.replace(entry, self.now)
        } else {
            svc.cache.insert(entry, self.now)
        };
        if published {
            Origin::Populated
        } else {
            Origin::Uncached(BypassReason::InsertRaced)
        }
    }

    fn compile_uncached(
        &mut self,
        path: &Path,
        resolved: Option<&Path>,
        mode: CompileMode,
        reason: BypassReason,
    ) -> Result<CompiledFile, CompileFailure> {
        debug!(reason = %reason, "compiling uncached");
        let source = SourceHandle {
            path: path.to_path_buf(),
            resolved: resolved.map(Path::to_path_buf),
        };
        let (op_array, _) = self.compile_tracked(&source, mode)?;
        Ok(CompiledFile {
            op_array,
            origin: Origin::Uncached(reason),
        })
    }

    /// Runs the compiler, returning the table sizes taken beforehand. If the
    /// compiler fails, whatever it registered before failing is removed.
    fn compile_tracked(
        &mut self,
        source: &SourceHandle,
        mode: CompileMode,
    ) -> Result<(Arc<OpArray>, (usize, usize)), CompileFailure> {
        let marks = (self.env.function_count(), self.env.class_count());
        match self.service.compiler.compile(source, mode, &mut *self.env) {
            Ok(op_array) => {
                self.env.mark_included(source.file());
                Ok((op_array, marks))
            }
            Err(failure) => {
                for function in self.env.functions_since(marks.0).iter().rev() {
                    self.env.unregister_function(&function.name);
                }
                for class in self.env.classes_since(marks.1).iter().rev() {
                    self.env.unregister_class(&class.name);
                }
                Err(failure)
            }
        }
    }

    /// Finds a function, installing it from the deferred table on first use.
    pub fn lookup_function(&mut self, name: &str) -> Option<Arc<Function>> {
        if let Some(function) = self.env.find_function(name) {
            return Some(function);
        }
        let installer = self.installer();
        match installer.install_lazy_function(name, &mut *self.env, &mut self.lazy) {
            Ok(found) => found,
            Err(e) => {
                warn!(function = name, error = %e, "could not install deferred function");
                None
            }
        }
    }

    /// Finds a class, installing it (and a deferred parent) on first use.
    pub fn lookup_class(&mut self, name: &str) -> Option<Arc<Class>> {
        if let Some(class) = self.env.find_class(name) {
            return Some(class);
        }
        let installer = self.installer();
        match installer.install_lazy_class(name, &mut *self.env, &mut self.lazy) {
            Ok(found) => found,
            Err(e) => {
                warn!(class = name, error = %e, "could not install deferred class");
                None
            }
        }
    }

    /// Names of every function the request can call: installed ones in
    /// registration order, then deferred ones sorted.
    pub fn defined_functions(&self) -> Vec<String> {
        let mut deferred: Vec<String> = self.lazy.functions.keys().cloned().collect();
        deferred.sort();
        self.env
            .functions_since(0)
            .iter()
            .map(|f| f.name.clone())
            .chain(deferred)
            .collect()
    }

    /// Names of every class the request can use. File-scoped names are
    /// left out.
    pub fn declared_classes(&self) -> Vec<String> {
        let mut deferred: Vec<String> = self.lazy.classes.keys().cloned().collect();
        deferred.sort();
        self.env
            .classes_since(0)
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !is_mangled(name))
            .chain(deferred)
            .collect()
    }

    /// The entries this request holds.
    pub fn stack(&self) -> &SessionStack {
        &self.stack
    }

    /// The live environment.
    pub fn env(&self) -> &dyn Environment {
        &*self.env
    }

    /// The live environment, for run-time declarations.
    pub fn env_mut(&mut self) -> &mut dyn Environment {
        &mut *self.env
    }

    /// The request's clock.
    pub fn now(&self) -> i64 {
        self.now
    }
}

impl Drop for RequestSession<'_> {
    fn drop(&mut self) {
        self.lazy.clear();
        for (kind, name) in self.lazy.installed.drain(..).rev() {
            match kind {
                DefinitionKind::Function => self.env.unregister_function(&name),
                DefinitionKind::Class => self.env.unregister_class(&name),
            };
        }
        while let Some(checkout) = self.stack.pop() {
            for name in checkout.functions.iter().rev() {
                self.env.unregister_function(name);
            }
            for name in checkout.classes.iter().rev() {
                self.env.unregister_class(name);
            }
            let remaining = self.service.cache.release(&checkout.entry);
            debug!(
                path = %checkout.entry.filename().display(),
                refcount = remaining,
                "checkout released"
            );
        }
    }
}
