//! The live, executable form of a compiled file.
//!
//! Nodes are reference counted. The compiler is free to share a node between
//! several parents (one interned literal used by two functions, one body
//! aliased by two methods), and a faithful copy must preserve that sharing.

use std::path::PathBuf;
use std::sync::Arc;

/// A literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// An ordered list of nested literals.
    List(Vec<Arc<Constant>>),
}

/// One instruction. Operands index the owning [`OpArray`]'s constant table.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Print a constant.
    Echo(u32),
    /// Call a function by name.
    Call(String),
    /// Bind a named global constant.
    BindConstant {
        /// Global name.
        name: String,
        /// Constant table index of the value.
        value: u32,
    },
    /// Declare a class whose parent was not known when the file was compiled.
    /// The class body was registered under `mangled`; executing the
    /// instruction binds it to `name` once `parent` exists.
    DeclareClass {
        /// Public class name.
        name: String,
        /// File-scoped name the body was registered under.
        mangled: String,
        /// Parent class name.
        parent: String,
    },
    /// Leave the current op array.
    Return,
}

/// An instruction sequence with its constant table.
#[derive(Debug, Clone, PartialEq)]
pub struct OpArray {
    /// Function or method name; `None` for a file body.
    pub name: Option<String>,
    /// The file this code was compiled from.
    pub filename: PathBuf,
    /// Instructions.
    pub ops: Vec<Op>,
    /// Literals referenced by `ops`.
    pub constants: Vec<Arc<Constant>>,
    /// First source line.
    pub line_start: u32,
    /// Last source line.
    pub line_end: u32,
}

impl OpArray {
    /// Returns the constant an operand refers to.
    pub fn constant(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize).map(Arc::as_ref)
    }
}

/// A named function (or method) and its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Compiled body.
    pub op_array: Arc<OpArray>,
}

/// A class definition.
///
/// The parent is carried by name only. It is resolved against the live
/// environment each time the class is installed.
#[derive(Debug, Clone, PartialEq)]
pub struct Class {
    /// Class name.
    pub name: String,
    /// Name of the parent class, if the class extends one.
    pub parent_name: Option<String>,
    /// Class constants in declaration order.
    pub constants: Vec<(String, Arc<Constant>)>,
    /// Methods in declaration order.
    pub methods: Vec<Arc<Function>>,
}

impl Class {
    /// Looks up a method by name.
    pub fn method(&self, name: &str) -> Option<&Arc<Function>> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Everything one compilation produced: the file body plus the functions and
/// classes it declared, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUnit {
    /// The compiled file.
    pub filename: PathBuf,
    /// Top-level code.
    pub main: Arc<OpArray>,
    /// Newly declared functions.
    pub functions: Vec<Arc<Function>>,
    /// Newly declared classes.
    pub classes: Vec<Arc<Class>>,
}

impl FileUnit {
    /// Names of the declared functions, in order.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    /// Names of the declared classes, in order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }
}
