//! Byte accounting for pooled nodes.
//!
//! A pool is charged once per node it stores. The charge is the node's inline
//! size plus every heap buffer the node owns outright; nodes it refers to by
//! ID are charged separately.

use std::mem::size_of;
use std::path::Path;

use crate::ids::{ConstId, FunctionId};
use crate::image::{ClassImage, ConstImage, FileImage, FunctionImage, OpArrayImage};
use crate::unit::Op;

/// Bytes a node occupies in a pool.
pub trait Footprint {
    /// Returns the number of bytes to charge for this node.
    fn footprint(&self) -> usize;
}

fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}

impl Footprint for ConstImage {
    fn footprint(&self) -> usize {
        size_of::<Self>()
            + match self {
                ConstImage::Str(s) => s.len(),
                ConstImage::List(items) => items.len() * size_of::<ConstId>(),
                _ => 0,
            }
    }
}

impl Footprint for Op {
    fn footprint(&self) -> usize {
        size_of::<Self>()
            + match self {
                Op::Call(name) => name.len(),
                Op::BindConstant { name, .. } => name.len(),
                Op::DeclareClass {
                    name,
                    mangled,
                    parent,
                } => name.len() + mangled.len() + parent.len(),
                Op::Echo(_) | Op::Return => 0,
            }
    }
}

impl Footprint for OpArrayImage {
    fn footprint(&self) -> usize {
        size_of::<Self>()
            + self.name.as_ref().map_or(0, String::len)
            + path_len(&self.filename)
            + self.ops.iter().map(Footprint::footprint).sum::<usize>()
            + self.constants.len() * size_of::<ConstId>()
    }
}

impl Footprint for FunctionImage {
    fn footprint(&self) -> usize {
        size_of::<Self>() + self.name.len()
    }
}

impl Footprint for ClassImage {
    fn footprint(&self) -> usize {
        size_of::<Self>()
            + self.name.len()
            + self.parent_name.as_ref().map_or(0, String::len)
            + self
                .constants
                .iter()
                .map(|(name, _)| name.len() + size_of::<(String, ConstId)>())
                .sum::<usize>()
            + self.methods.len() * size_of::<FunctionId>()
    }
}

impl Footprint for FileImage {
    /// The sum of every node's charge plus the image header.
    fn footprint(&self) -> usize {
        let n = &self.nodes;
        size_of::<Self>()
            + path_len(&self.filename)
            + n.constants.iter().map(|(_, c)| c.footprint()).sum::<usize>()
            + n.op_arrays.iter().map(|(_, o)| o.footprint()).sum::<usize>()
            + n.functions.iter().map(|(_, f)| f.footprint()).sum::<usize>()
            + n.classes.iter().map(|(_, c)| c.footprint()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::UnitImage;
    use std::path::PathBuf;

    #[test]
    fn strings_add_to_charge() {
        let short = ConstImage::Str("a".into()).footprint();
        let long = ConstImage::Str("a".repeat(100)).footprint();
        assert_eq!(long - short, 99);
    }

    #[test]
    fn image_charge_covers_nodes() {
        let mut nodes = UnitImage::default();
        let c = nodes.constants.alloc(ConstImage::Int(1));
        let main = nodes.op_arrays.alloc(OpArrayImage {
            name: None,
            filename: PathBuf::from("/a"),
            ops: vec![Op::Echo(0)],
            constants: vec![c],
            line_start: 1,
            line_end: 1,
        });
        let node_total = nodes.constants[c].footprint() + nodes.op_arrays[main].footprint();
        let img = FileImage {
            filename: PathBuf::from("/a"),
            nodes,
            main,
            functions: Vec::new(),
            classes: Vec::new(),
        };
        assert!(img.footprint() > node_total);
    }
}
