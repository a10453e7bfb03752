//! The pooled form of a compiled file.
//!
//! A [`FileImage`] owns one [`UnitImage`]: four arenas holding every node of
//! the file's reference graph exactly once. Edges are IDs into those arenas,
//! so an image never points outside itself.

use std::path::PathBuf;

use crate::arena::Arena;
use crate::ids::{ClassId, ConstId, FunctionId, OpArrayId};
use crate::unit::Op;

/// A literal stored in an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstImage {
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
    /// Nested literals.
    List(Vec<ConstId>),
}

/// An instruction sequence stored in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct OpArrayImage {
    /// Function or method name; `None` for a file body.
    pub name: Option<String>,
    /// Source file.
    pub filename: PathBuf,
    /// Instructions, operands unchanged.
    pub ops: Vec<Op>,
    /// Constant table, by ID.
    pub constants: Vec<ConstId>,
    /// First source line.
    pub line_start: u32,
    /// Last source line.
    pub line_end: u32,
}

/// A function stored in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionImage {
    /// Function name.
    pub name: String,
    /// Body.
    pub op_array: OpArrayId,
}

/// A class stored in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassImage {
    /// Class name.
    pub name: String,
    /// Parent to resolve at install time.
    pub parent_name: Option<String>,
    /// Class constants.
    pub constants: Vec<(String, ConstId)>,
    /// Methods.
    pub methods: Vec<FunctionId>,
}

/// Node storage for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitImage {
    /// Literals.
    pub constants: Arena<ConstId, ConstImage>,
    /// Instruction sequences.
    pub op_arrays: Arena<OpArrayId, OpArrayImage>,
    /// Functions and methods.
    pub functions: Arena<FunctionId, FunctionImage>,
    /// Classes.
    pub classes: Arena<ClassId, ClassImage>,
}

impl UnitImage {
    /// Total number of nodes across all arenas.
    pub fn node_count(&self) -> usize {
        self.constants.len() + self.op_arrays.len() + self.functions.len() + self.classes.len()
    }
}

/// A compiled file as stored in a pool: the file body plus the functions and
/// classes it declared, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct FileImage {
    /// The compiled file.
    pub filename: PathBuf,
    /// Backing nodes.
    pub nodes: UnitImage,
    /// Top-level code.
    pub main: OpArrayId,
    /// Declared functions.
    pub functions: Vec<FunctionId>,
    /// Declared classes.
    pub classes: Vec<ClassId>,
}

impl FileImage {
    /// Names of the declared functions, in order.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .map(|&id| self.nodes.functions[id].name.as_str())
    }

    /// Names of the declared classes, in order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes
            .iter()
            .map(|&id| self.nodes.classes[id].name.as_str())
    }

    /// Finds a declared function by name.
    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .copied()
            .find(|&id| self.nodes.functions[id].name == name)
    }

    /// Finds a declared class by name.
    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .copied()
            .find(|&id| self.nodes.classes[id].name == name)
    }

    /// Returns `true` if every ID reachable from the image resolves inside its
    /// own arenas.
    pub fn is_closed(&self) -> bool {
        let n = &self.nodes;
        let consts_ok = |ids: &[ConstId]| ids.iter().all(|&id| n.constants.get(id).is_some());

        let roots = n.op_arrays.get(self.main).is_some()
            && self.functions.iter().all(|&id| n.functions.get(id).is_some())
            && self.classes.iter().all(|&id| n.classes.get(id).is_some());

        roots
            && n.constants.iter().all(|(_, c)| match c {
                ConstImage::List(items) => consts_ok(items),
                _ => true,
            })
            && n.op_arrays.iter().all(|(_, oa)| consts_ok(&oa.constants))
            && n.functions
                .iter()
                .all(|(_, f)| n.op_arrays.get(f.op_array).is_some())
            && n.classes.iter().all(|(_, c)| {
                c.constants.iter().all(|(_, id)| n.constants.get(*id).is_some())
                    && c.methods.iter().all(|&m| n.functions.get(m).is_some())
            })
    }
}
