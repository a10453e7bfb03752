//! The live execution environment the installer writes into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use opcache_ir::{Class, Function};

use crate::error::{DefinitionKind, RegistryError};

/// The host runtime's function and class tables.
///
/// Tables keep registration order, so the definitions added while compiling
/// one file are exactly those past the counts taken before compiling it.
pub trait Environment {
    /// Number of registered functions.
    fn function_count(&self) -> usize;

    /// Number of registered classes.
    fn class_count(&self) -> usize;

    /// Functions registered after the first `mark`, in order.
    fn functions_since(&self, mark: usize) -> Vec<Arc<Function>>;

    /// Classes registered after the first `mark`, in order.
    fn classes_since(&self, mark: usize) -> Vec<Arc<Class>>;

    /// Looks up a function.
    fn find_function(&self, name: &str) -> Option<Arc<Function>>;

    /// Looks up a class.
    fn find_class(&self, name: &str) -> Option<Arc<Class>>;

    /// The class a registered class is linked to, if any.
    fn parent_of(&self, name: &str) -> Option<Arc<Class>>;

    /// Adds a function.
    fn register_function(&mut self, function: Arc<Function>) -> Result<(), RegistryError>;

    /// Adds a class without linking its parent.
    fn declare_class(&mut self, class: Arc<Class>) -> Result<(), RegistryError>;

    /// Links a declared class to its parent.
    fn link_class(&mut self, name: &str, parent: &str) -> Result<(), RegistryError>;

    /// Adds a class and links it to `parent_name`. Nothing is left registered
    /// on failure.
    fn register_class(&mut self, class: Arc<Class>, parent_name: Option<&str>) -> Result<(), RegistryError> {
        let name = class.name.clone();
        self.declare_class(class)?;
        if let Some(parent) = parent_name {
            if let Err(e) = self.link_class(&name, parent) {
                self.unregister_class(&name);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes a function. Returns `true` if it was present.
    fn unregister_function(&mut self, name: &str) -> bool;

    /// Removes a class. Returns `true` if it was present.
    fn unregister_class(&mut self, name: &str) -> bool;

    /// Records that a file has been included.
    fn mark_included(&mut self, path: &Path);

    /// Returns `true` if a file has been included.
    fn is_included(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone)]
struct ClassSlot {
    class: Arc<Class>,
    parent: Option<Arc<Class>>,
}

/// An in-memory [`Environment`].
#[derive(Debug, Clone, Default)]
pub struct LiveEnvironment {
    functions: IndexMap<String, Arc<Function>>,
    classes: IndexMap<String, ClassSlot>,
    included: IndexSet<PathBuf>,
}

impl LiveEnvironment {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered function names, in order.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Registered class names, in order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Included files, in order.
    pub fn included_files(&self) -> impl Iterator<Item = &Path> {
        self.included.iter().map(PathBuf::as_path)
    }
}

impl Environment for LiveEnvironment {
    fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn functions_since(&self, mark: usize) -> Vec<Arc<Function>> {
        self.functions.values().skip(mark).cloned().collect()
    }

    fn classes_since(&self, mark: usize) -> Vec<Arc<Class>> {
        self.classes
            .values()
            .skip(mark)
            .map(|slot| Arc::clone(&slot.class))
            .collect()
    }

    fn find_function(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.get(name).cloned()
    }

    fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.get(name).map(|slot| Arc::clone(&slot.class))
    }

    fn parent_of(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.get(name).and_then(|slot| slot.parent.clone())
    }

    fn register_function(&mut self, function: Arc<Function>) -> Result<(), RegistryError> {
        if self.functions.contains_key(&function.name) {
            return Err(RegistryError::NameConflict {
                kind: DefinitionKind::Function,
                name: function.name.clone(),
            });
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    fn declare_class(&mut self, class: Arc<Class>) -> Result<(), RegistryError> {
        if self.classes.contains_key(&class.name) {
            return Err(RegistryError::NameConflict {
                kind: DefinitionKind::Class,
                name: class.name.clone(),
            });
        }
        self.classes
            .insert(class.name.clone(), ClassSlot { class, parent: None });
        Ok(())
    }

    fn link_class(&mut self, name: &str, parent: &str) -> Result<(), RegistryError> {
        let unresolved = || RegistryError::ParentUnresolved {
            class: name.to_string(),
            parent: parent.to_string(),
        };
        let parent_class = self
            .classes
            .get(parent)
            .map(|slot| Arc::clone(&slot.class))
            .ok_or_else(unresolved)?;
        let slot = self.classes.get_mut(name).ok_or_else(unresolved)?;
        slot.parent = Some(parent_class);
        Ok(())
    }

    fn unregister_function(&mut self, name: &str) -> bool {
        self.functions.shift_remove(name).is_some()
    }

    fn unregister_class(&mut self, name: &str) -> bool {
        self.classes.shift_remove(name).is_some()
    }

    fn mark_included(&mut self, path: &Path) {
        self.included.insert(path.to_path_buf());
    }

    fn is_included(&self, path: &Path) -> bool {
        self.included.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcache_ir::OpArray;

    fn function(name: &str) -> Arc<Function> {
        Arc::new(Function {
            name: name.into(),
            op_array: Arc::new(OpArray {
                name: Some(name.into()),
                filename: PathBuf::from("/srv/a.src"),
                ops: Vec::new(),
                constants: Vec::new(),
                line_start: 1,
                line_end: 1,
            }),
        })
    }

    fn class(name: &str, parent: Option<&str>) -> Arc<Class> {
        Arc::new(Class {
            name: name.into(),
            parent_name: parent.map(str::to_string),
            constants: Vec::new(),
            methods: Vec::new(),
        })
    }

    #[test]
    fn marks_capture_later_registrations() {
        let mut env = LiveEnvironment::new();
        env.register_function(function("old")).unwrap();
        let mark = env.function_count();
        env.register_function(function("f")).unwrap();
        env.register_function(function("g")).unwrap();
        let names: Vec<_> = env
            .functions_since(mark)
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["f", "g"]);
    }

    #[test]
    fn duplicate_function_conflicts() {
        let mut env = LiveEnvironment::new();
        env.register_function(function("f")).unwrap();
        assert!(matches!(
            env.register_function(function("f")),
            Err(RegistryError::NameConflict {
                kind: DefinitionKind::Function,
                ..
            })
        ));
    }

    #[test]
    fn register_class_links_parent() {
        let mut env = LiveEnvironment::new();
        env.register_class(class("Base", None), None).unwrap();
        env.register_class(class("Child", Some("Base")), Some("Base"))
            .unwrap();
        assert_eq!(env.parent_of("Child").unwrap().name, "Base");
        assert!(env.parent_of("Base").is_none());
    }

    #[test]
    fn unresolved_parent_leaves_nothing_registered() {
        let mut env = LiveEnvironment::new();
        let err = env
            .register_class(class("Child", Some("Base")), Some("Base"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::ParentUnresolved {
                class: "Child".into(),
                parent: "Base".into()
            }
        );
        assert!(env.find_class("Child").is_none());
        assert_eq!(env.class_count(), 0);
    }

    #[test]
    fn unregister_keeps_order_of_the_rest() {
        let mut env = LiveEnvironment::new();
        for name in ["a", "b", "c"] {
            env.register_function(function(name)).unwrap();
        }
        assert!(env.unregister_function("b"));
        assert!(!env.unregister_function("b"));
        assert_eq!(env.function_names().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn included_files_are_recorded_once() {
        let mut env = LiveEnvironment::new();
        env.mark_included(Path::new("/srv/a.src"));
        env.mark_included(Path::new("/srv/a.src"));
        assert!(env.is_included(Path::new("/srv/a.src")));
        assert_eq!(env.included_files().count(), 1);
    }
}
