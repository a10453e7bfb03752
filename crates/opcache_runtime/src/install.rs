//! Installing cached definitions into the live environment.
//!
//! Eager installation runs in two phases. Phase 1 declares every class and
//! registers every function without linking parents; phase 2 links each
//! class to its parent. A failure in either phase removes everything this
//! pass added, in reverse order, so the environment never holds part of a
//! file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use opcache_cache::CacheEntry;
use opcache_config::InstallConfig;
use opcache_ir::{is_mangled, ClassId, FileImage, FunctionId, OpArray};
use opcache_pool::{Allocator, Materializer, Pool, PoolError, PoolStrategy};
use tracing::{debug, warn};

use crate::env::Environment;
use crate::error::{DefinitionKind, InstallError, RegistryError};

/// A definition known to the session but not yet installed.
#[derive(Clone)]
pub(crate) struct LazyDef<I> {
    pub(crate) entry: Arc<CacheEntry>,
    pub(crate) id: I,
}

/// Definitions deferred until first reference, keyed by name, plus the
/// deferred definitions installed so far.
#[derive(Default)]
pub(crate) struct LazyTable {
    pub(crate) functions: HashMap<String, LazyDef<FunctionId>>,
    pub(crate) classes: HashMap<String, LazyDef<ClassId>>,
    pub(crate) installed: Vec<(DefinitionKind, String)>,
}

impl LazyTable {
    /// Forgets every deferred definition. Installed ones stay listed.
    pub(crate) fn clear(&mut self) {
        self.functions.clear();
        self.classes.clear();
    }
}

/// What one install pass put into the environment and the lazy tables.
#[derive(Debug)]
pub(crate) struct Installed {
    pub(crate) main: Arc<OpArray>,
    pub(crate) functions: Vec<String>,
    pub(crate) classes: Vec<String>,
}

#[derive(Default)]
struct Pass {
    functions: Vec<String>,
    classes: Vec<String>,
    lazy_functions: Vec<String>,
    lazy_classes: Vec<String>,
}

impl Pass {
    fn roll_back(&self, env: &mut dyn Environment, lazy: &mut LazyTable) {
        for name in self.lazy_classes.iter().rev() {
            lazy.classes.remove(name);
        }
        for name in self.lazy_functions.iter().rev() {
            lazy.functions.remove(name);
        }
        for name in self.functions.iter().rev() {
            env.unregister_function(name);
        }
        for name in self.classes.iter().rev() {
            env.unregister_class(name);
        }
    }
}

/// Installs definitions from cache entries.
pub(crate) struct Installer<'a> {
    pub(crate) policy: &'a InstallConfig,
    pub(crate) heap: &'a Arc<dyn Allocator>,
}

impl Installer<'_> {
    fn pool(&self) -> Result<Pool, PoolError> {
        Pool::create(PoolStrategy::Unpooled, Arc::clone(self.heap))
    }

    /// Installs everything `entry` declares and materializes its file body.
    ///
    /// On error nothing from this entry remains in `env` or `lazy`.
    pub(crate) fn install_entry(
        &self,
        entry: &Arc<CacheEntry>,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
    ) -> Result<Installed, InstallError> {
        let path = entry.filename().to_path_buf();
        let image = entry
            .image()
            .ok_or_else(|| InstallError::Released { path: path.clone() })?;
        let mut pool = self.pool().map_err(|source| InstallError::Pool {
            path: path.clone(),
            source,
        })?;

        let mut pass = Pass::default();
        match self.run_phases(entry, &image, &mut pool, env, lazy, &mut pass) {
            Ok(main) => {
                debug!(
                    path = %path.display(),
                    functions = pass.functions.len(),
                    classes = pass.classes.len(),
                    deferred = pass.lazy_functions.len() + pass.lazy_classes.len(),
                    "installed cached file"
                );
                Ok(Installed {
                    main,
                    functions: pass.functions,
                    classes: pass.classes,
                })
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "rolling back install");
                pass.roll_back(env, lazy);
                Err(e)
            }
        }
    }

    fn run_phases(
        &self,
        entry: &Arc<CacheEntry>,
        image: &FileImage,
        pool: &mut Pool,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
        pass: &mut Pass,
    ) -> Result<Arc<OpArray>, InstallError> {
        let path = image.filename.clone();
        let registry = |source: RegistryError| InstallError::Registry {
            path: path.clone(),
            source,
        };
        let pooled = |source: PoolError| InstallError::Pool {
            path: path.clone(),
            source,
        };
        let mut m = Materializer::new(image, pool);
        let mut links = Vec::new();

        for &id in &image.classes {
            let node = &image.nodes.classes[id];
            let name = node.name.as_str();
            let mangled = is_mangled(name);
            if mangled && env.find_class(name).is_some() {
                continue;
            }
            if self.policy.lazy_classes && !mangled {
                let present = env.find_class(name).is_some();
                defer(&mut lazy.classes, present, name, DefinitionKind::Class, entry, id)
                    .map_err(registry)?;
                pass.lazy_classes.push(name.to_string());
                continue;
            }
            let class = m.class(id).map_err(pooled)?;
            env.declare_class(class).map_err(registry)?;
            pass.classes.push(name.to_string());
            if let Some(parent) = &node.parent_name {
                links.push((name.to_string(), parent.clone()));
            }
        }

        for &id in &image.functions {
            let name = image.nodes.functions[id].name.as_str();
            if self.policy.lazy_functions {
                let present = env.find_function(name).is_some();
                defer(&mut lazy.functions, present, name, DefinitionKind::Function, entry, id)
                    .map_err(registry)?;
                pass.lazy_functions.push(name.to_string());
                continue;
            }
            let function = m.function(id).map_err(pooled)?;
            env.register_function(function).map_err(registry)?;
            pass.functions.push(name.to_string());
        }

        for (name, parent) in links {
            if env.find_class(&parent).is_none() {
                self.resolve_parent(entry, &parent, env, lazy, pass)?;
            }
            if let Err(e) = env.link_class(&name, &parent) {
                if self.policy.report_autofilter {
                    warn!(class = %name, parent = %parent, "dynamic inheritance detected");
                }
                return Err(registry(e));
            }
        }

        m.op_array(image.main).map_err(pooled)
    }

    /// Pulls a missing parent out of the lazy table. A parent deferred by the
    /// file being installed becomes part of this pass.
    fn resolve_parent(
        &self,
        entry: &Arc<CacheEntry>,
        parent: &str,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
        pass: &mut Pass,
    ) -> Result<(), InstallError> {
        let Some(def) = lazy.classes.get(parent) else {
            return Ok(());
        };
        let own = Arc::ptr_eq(&def.entry, entry);
        if self.install_lazy_class(parent, env, lazy)?.is_some() && own {
            lazy.installed
                .retain(|(kind, name)| *kind != DefinitionKind::Class || name != parent);
            pass.lazy_classes.retain(|n| n != parent);
            pass.classes.push(parent.to_string());
        }
        Ok(())
    }

    /// Installs a deferred function. Returns `Ok(None)` if `name` is not
    /// deferred.
    pub(crate) fn install_lazy_function(
        &self,
        name: &str,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
    ) -> Result<Option<Arc<opcache_ir::Function>>, InstallError> {
        let Some(def) = lazy.functions.remove(name) else {
            return Ok(None);
        };
        match self.materialize_function(&def, env) {
            Ok(function) => {
                lazy.installed.push((DefinitionKind::Function, name.to_string()));
                Ok(Some(function))
            }
            Err(e) => {
                lazy.functions.insert(name.to_string(), def);
                Err(e)
            }
        }
    }

    fn materialize_function(
        &self,
        def: &LazyDef<FunctionId>,
        env: &mut dyn Environment,
    ) -> Result<Arc<opcache_ir::Function>, InstallError> {
        let path = def.entry.filename().to_path_buf();
        let image = def
            .entry
            .image()
            .ok_or_else(|| InstallError::Released { path: path.clone() })?;
        let mut pool = self.pool().map_err(|source| pool_error(&path, source))?;
        let function = Materializer::new(&image, &mut pool)
            .function(def.id)
            .map_err(|source| pool_error(&path, source))?;
        env.register_function(Arc::clone(&function))
            .map_err(|source| InstallError::Registry { path, source })?;
        Ok(function)
    }

    /// Installs a deferred class, first installing a deferred parent if
    /// needed. Returns `Ok(None)` if `name` is not deferred.
    ///
    /// A failed attempt leaves the class deferred so a later reference can
    /// retry once its parent exists.
    pub(crate) fn install_lazy_class(
        &self,
        name: &str,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
    ) -> Result<Option<Arc<opcache_ir::Class>>, InstallError> {
        let Some(def) = lazy.classes.remove(name) else {
            return Ok(None);
        };
        let result = self.materialize_class(&def, env, lazy);
        if result.is_err() {
            lazy.classes.insert(name.to_string(), def);
        }
        result.map(Some)
    }

    fn materialize_class(
        &self,
        def: &LazyDef<ClassId>,
        env: &mut dyn Environment,
        lazy: &mut LazyTable,
    ) -> Result<Arc<opcache_ir::Class>, InstallError> {
        let path: PathBuf = def.entry.filename().to_path_buf();
        let image = def
            .entry
            .image()
            .ok_or_else(|| InstallError::Released { path: path.clone() })?;
        let mut pool = self.pool().map_err(|source| pool_error(&path, source))?;
        let class = Materializer::new(&image, &mut pool)
            .class(def.id)
            .map_err(|source| pool_error(&path, source))?;

        if let Some(parent) = &class.parent_name {
            if env.find_class(parent).is_none() {
                self.install_lazy_class(parent, env, lazy)?;
            }
        }
        env.register_class(Arc::clone(&class), class.parent_name.as_deref())
            .map_err(|source| {
                if self.policy.report_autofilter {
                    if let RegistryError::ParentUnresolved { .. } = source {
                        warn!(class = %class.name, "dynamic inheritance detected");
                    }
                }
                InstallError::Registry { path, source }
            })?;
        lazy.installed.push((DefinitionKind::Class, class.name.clone()));
        Ok(class)
    }
}

fn pool_error(path: &std::path::Path, source: PoolError) -> InstallError {
    InstallError::Pool {
        path: path.to_path_buf(),
        source,
    }
}

fn defer<I>(
    table: &mut HashMap<String, LazyDef<I>>,
    present: bool,
    name: &str,
    kind: DefinitionKind,
    entry: &Arc<CacheEntry>,
    id: I,
) -> Result<(), RegistryError> {
    if present || table.contains_key(name) {
        return Err(RegistryError::NameConflict {
            kind,
            name: name.to_string(),
        });
    }
    table.insert(
        name.to_string(),
        LazyDef {
            entry: Arc::clone(entry),
            id,
        },
    );
    Ok(())
}
