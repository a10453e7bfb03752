//! Deep copy between the live model and pooled images.
//!
//! Both directions walk the full reference graph and visit every node exactly
//! once. Going IN, nodes are recognised by `Arc` identity so that a node
//! reachable along two paths becomes one arena slot. Going OUT, nodes are
//! memoised by ID so that one slot becomes one shared `Arc`. Every node copied
//! is charged to the target pool; the first charge that fails aborts the copy
//! and the partial result is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use opcache_ir::{
    Class, ClassId, ClassImage, ConstId, ConstImage, Constant, FileImage, FileUnit, Footprint,
    Function, FunctionId, FunctionImage, OpArray, OpArrayId, OpArrayImage, UnitImage,
};
use tracing::debug;

use crate::error::PoolError;
use crate::pool::Pool;

/// Which way a copy moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Live model into a pool (publishing).
    In,
    /// Pool back into the live model (materializing for execution).
    Out,
}

impl fmt::Display for CopyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyDirection::In => write!(f, "in"),
            CopyDirection::Out => write!(f, "out"),
        }
    }
}

/// Copies a live unit and everything it reaches into `pool`.
///
/// For a shared pool the whole copy runs inside one write window.
pub fn deep_copy_in(unit: &FileUnit, pool: &mut Pool) -> Result<FileImage, PoolError> {
    let _window = pool.write_window();
    let before = pool.size();
    let mut builder = ImageBuilder::new(pool);

    let main = builder.op_array(&unit.main)?;
    let functions = unit
        .functions
        .iter()
        .map(|f| builder.function(f))
        .collect::<Result<Vec<_>, _>>()?;
    let classes = unit
        .classes
        .iter()
        .map(|c| builder.class(c))
        .collect::<Result<Vec<_>, _>>()?;

    let nodes = builder.finish();
    debug!(
        direction = %CopyDirection::In,
        file = %unit.filename.display(),
        nodes = nodes.node_count(),
        bytes = pool.size() - before,
        "deep copy complete"
    );
    Ok(FileImage {
        filename: unit.filename.clone(),
        nodes,
        main,
        functions,
        classes,
    })
}

/// Rebuilds a live unit from an image, charging `pool` for every node.
pub fn deep_copy_out(image: &FileImage, pool: &mut Pool) -> Result<FileUnit, PoolError> {
    let unit = Materializer::new(image, pool).unit()?;
    debug!(
        direction = %CopyDirection::Out,
        file = %image.filename.display(),
        nodes = image.nodes.node_count(),
        "deep copy complete"
    );
    Ok(unit)
}

/// Builds a [`UnitImage`] from live nodes, deduplicating by `Arc` identity.
struct ImageBuilder<'p> {
    pool: &'p mut Pool,
    nodes: UnitImage,
    constants: HashMap<*const Constant, ConstId>,
    op_arrays: HashMap<*const OpArray, OpArrayId>,
    functions: HashMap<*const Function, FunctionId>,
    classes: HashMap<*const Class, ClassId>,
}

impl<'p> ImageBuilder<'p> {
    fn new(pool: &'p mut Pool) -> Self {
        Self {
            pool,
            nodes: UnitImage::default(),
            constants: HashMap::new(),
            op_arrays: HashMap::new(),
            functions: HashMap::new(),
            classes: HashMap::new(),
        }
    }

    fn finish(self) -> UnitImage {
        self.nodes
    }

    fn constant(&mut self, c: &Arc<Constant>) -> Result<ConstId, PoolError> {
        if let Some(&id) = self.constants.get(&Arc::as_ptr(c)) {
            return Ok(id);
        }
        let node = match c.as_ref() {
            Constant::Null => ConstImage::Null,
            Constant::Bool(b) => ConstImage::Bool(*b),
            Constant::Int(i) => ConstImage::Int(*i),
            Constant::Float(x) => ConstImage::Float(*x),
            Constant::Str(s) => ConstImage::Str(s.clone()),
            Constant::List(items) => ConstImage::List(
                items
                    .iter()
                    .map(|item| self.constant(item))
                    .collect::<Result<_, _>>()?,
            ),
        };
        self.pool.alloc(node.footprint())?;
        let id = self.nodes.constants.alloc(node);
        self.constants.insert(Arc::as_ptr(c), id);
        Ok(id)
    }

    fn op_array(&mut self, oa: &Arc<OpArray>) -> Result<OpArrayId, PoolError> {
        if let Some(&id) = self.op_arrays.get(&Arc::as_ptr(oa)) {
            return Ok(id);
        }
        let constants = oa
            .constants
            .iter()
            .map(|c| self.constant(c))
            .collect::<Result<_, _>>()?;
        let node = OpArrayImage {
            name: oa.name.clone(),
            filename: oa.filename.clone(),
            ops: oa.ops.clone(),
            constants,
            line_start: oa.line_start,
            line_end: oa.line_end,
        };
        self.pool.alloc(node.footprint())?;
        let id = self.nodes.op_arrays.alloc(node);
        self.op_arrays.insert(Arc::as_ptr(oa), id);
        Ok(id)
    }

    fn function(&mut self, f: &Arc<Function>) -> Result<FunctionId, PoolError> {
        if let Some(&id) = self.functions.get(&Arc::as_ptr(f)) {
            return Ok(id);
        }
        let op_array = self.op_array(&f.op_array)?;
        let node = FunctionImage {
            name: f.name.clone(),
            op_array,
        };
        self.pool.alloc(node.footprint())?;
        let id = self.nodes.functions.alloc(node);
        self.functions.insert(Arc::as_ptr(f), id);
        Ok(id)
    }

    fn class(&mut self, c: &Arc<Class>) -> Result<ClassId, PoolError> {
        if let Some(&id) = self.classes.get(&Arc::as_ptr(c)) {
            return Ok(id);
        }
        let mut constants = Vec::with_capacity(c.constants.len());
        for (name, value) in &c.constants {
            constants.push((name.clone(), self.constant(value)?));
        }
        let methods = c
            .methods
            .iter()
            .map(|m| self.function(m))
            .collect::<Result<_, _>>()?;
        let node = ClassImage {
            name: c.name.clone(),
            parent_name: c.parent_name.clone(),
            constants,
            methods,
        };
        self.pool.alloc(node.footprint())?;
        let id = self.nodes.classes.alloc(node);
        self.classes.insert(Arc::as_ptr(c), id);
        Ok(id)
    }
}

/// Rebuilds live nodes from an image on demand.
///
/// Each image node is materialized at most once per materializer, so shared
/// structure in the image comes back as shared `Arc`s. Lazy installation uses
/// one materializer per definition instead of one per file.
pub struct Materializer<'a> {
    image: &'a FileImage,
    pool: &'a mut Pool,
    constants: HashMap<ConstId, Arc<Constant>>,
    op_arrays: HashMap<OpArrayId, Arc<OpArray>>,
    functions: HashMap<FunctionId, Arc<Function>>,
    classes: HashMap<ClassId, Arc<Class>>,
}

impl<'a> Materializer<'a> {
    /// Creates a materializer that charges `pool`.
    pub fn new(image: &'a FileImage, pool: &'a mut Pool) -> Self {
        Self {
            image,
            pool,
            constants: HashMap::new(),
            op_arrays: HashMap::new(),
            functions: HashMap::new(),
            classes: HashMap::new(),
        }
    }

    /// Materializes the whole file.
    pub fn unit(&mut self) -> Result<FileUnit, PoolError> {
        let image = self.image;
        let main = self.op_array(image.main)?;
        let functions = image
            .functions
            .iter()
            .map(|&id| self.function(id))
            .collect::<Result<_, _>>()?;
        let classes = image
            .classes
            .iter()
            .map(|&id| self.class(id))
            .collect::<Result<_, _>>()?;
        Ok(FileUnit {
            filename: image.filename.clone(),
            main,
            functions,
            classes,
        })
    }

    /// Materializes one constant.
    pub fn constant(&mut self, id: ConstId) -> Result<Arc<Constant>, PoolError> {
        if let Some(c) = self.constants.get(&id) {
            return Ok(Arc::clone(c));
        }
        let image = self.image;
        let node = &image.nodes.constants[id];
        self.pool.alloc(node.footprint())?;
        let value = match node {
            ConstImage::Null => Constant::Null,
            ConstImage::Bool(b) => Constant::Bool(*b),
            ConstImage::Int(i) => Constant::Int(*i),
            ConstImage::Float(x) => Constant::Float(*x),
            ConstImage::Str(s) => Constant::Str(s.clone()),
            ConstImage::List(items) => Constant::List(
                items
                    .iter()
                    .map(|&item| self.constant(item))
                    .collect::<Result<_, _>>()?,
            ),
        };
        let value = Arc::new(value);
        self.constants.insert(id, Arc::clone(&value));
        Ok(value)
    }

    /// Materializes one op array.
    pub fn op_array(&mut self, id: OpArrayId) -> Result<Arc<OpArray>, PoolError> {
        if let Some(oa) = self.op_arrays.get(&id) {
            return Ok(Arc::clone(oa));
        }
        let image = self.image;
        let node = &image.nodes.op_arrays[id];
        self.pool.alloc(node.footprint())?;
        let constants = node
            .constants
            .iter()
            .map(|&c| self.constant(c))
            .collect::<Result<_, _>>()?;
        let oa = Arc::new(OpArray {
            name: node.name.clone(),
            filename: node.filename.clone(),
            ops: node.ops.clone(),
            constants,
            line_start: node.line_start,
            line_end: node.line_end,
        });
        self.op_arrays.insert(id, Arc::clone(&oa));
        Ok(oa)
    }

    /// Materializes one function.
    pub fn function(&mut self, id: FunctionId) -> Result<Arc<Function>, PoolError> {
        if let Some(f) = self.functions.get(&id) {
            return Ok(Arc::clone(f));
        }
        let image = self.image;
        let node = &image.nodes.functions[id];
        self.pool.alloc(node.footprint())?;
        let f = Arc::new(Function {
            name: node.name.clone(),
            op_array: self.op_array(node.op_array)?,
        });
        self.functions.insert(id, Arc::clone(&f));
        Ok(f)
    }

    /// Materializes one class. The parent stays a name.
    pub fn class(&mut self, id: ClassId) -> Result<Arc<Class>, PoolError> {
        if let Some(c) = self.classes.get(&id) {
            return Ok(Arc::clone(c));
        }
        let image = self.image;
        let node = &image.nodes.classes[id];
        self.pool.alloc(node.footprint())?;
        let mut constants = Vec::with_capacity(node.constants.len());
        for (name, value) in &node.constants {
            constants.push((name.clone(), self.constant(*value)?));
        }
        let methods = node
            .methods
            .iter()
            .map(|&m| self.function(m))
            .collect::<Result<_, _>>()?;
        let c = Arc::new(Class {
            name: node.name.clone(),
            parent_name: node.parent_name.clone(),
            constants,
            methods,
        });
        self.classes.insert(id, Arc::clone(&c));
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, HeapAllocator, SharedSegment};
    use crate::pool::{PoolStrategy, POOL_HEADER_SIZE};
    use opcache_ir::Op;
    use std::path::PathBuf;

    fn sample_unit() -> FileUnit {
        let shared = Arc::new(Constant::Str("shared".into()));
        let list = Arc::new(Constant::List(vec![shared.clone(), Arc::new(Constant::Int(3))]));
        let f_body = Arc::new(OpArray {
            name: Some("f".into()),
            filename: PathBuf::from("/srv/a.src"),
            ops: vec![Op::Echo(0), Op::Echo(1), Op::Return],
            constants: vec![shared.clone(), list],
            line_start: 2,
            line_end: 4,
        });
        let f = Arc::new(Function {
            name: "f".into(),
            op_array: f_body.clone(),
        });
        // A method aliasing the same body as `f`.
        let m = Arc::new(Function {
            name: "run".into(),
            op_array: f_body,
        });
        let c = Arc::new(Class {
            name: "C".into(),
            parent_name: Some("Base".into()),
            constants: vec![("TAG".into(), shared.clone())],
            methods: vec![m],
        });
        let main = Arc::new(OpArray {
            name: None,
            filename: PathBuf::from("/srv/a.src"),
            ops: vec![Op::Call("f".into()), Op::Echo(0), Op::Return],
            constants: vec![shared],
            line_start: 1,
            line_end: 9,
        });
        FileUnit {
            filename: PathBuf::from("/srv/a.src"),
            main,
            functions: vec![f],
            classes: vec![c],
        }
    }

    fn shared_pool(capacity: usize) -> (Arc<SharedSegment>, Pool) {
        let seg = Arc::new(SharedSegment::create(capacity).unwrap());
        let pool = Pool::create(PoolStrategy::Shared, seg.clone()).unwrap();
        (seg, pool)
    }

    #[test]
    fn copy_in_deduplicates_by_identity() {
        let unit = sample_unit();
        let (_seg, mut pool) = shared_pool(1 << 20);
        let image = deep_copy_in(&unit, &mut pool).unwrap();

        // "shared", the list, and 3.
        assert_eq!(image.nodes.constants.len(), 3);
        // main and one body shared by `f` and `C::run`.
        assert_eq!(image.nodes.op_arrays.len(), 2);
        assert_eq!(image.nodes.functions.len(), 2);
        assert!(image.is_closed());
    }

    #[test]
    fn round_trip_is_structurally_identical() {
        let unit = sample_unit();
        let (_seg, mut shared) = shared_pool(1 << 20);
        let image = deep_copy_in(&unit, &mut shared).unwrap();

        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
        let mut out = Pool::create(PoolStrategy::Unpooled, heap).unwrap();
        let back = deep_copy_out(&image, &mut out).unwrap();

        assert_eq!(back, unit);
        assert_eq!(back.function_names().collect::<Vec<_>>(), vec!["f"]);
        assert_eq!(back.classes[0].parent_name.as_deref(), Some("Base"));

        // Sharing is preserved inside the copy and never reaches the original.
        let f_body = &back.functions[0].op_array;
        let method_body = &back.classes[0].methods[0].op_array;
        assert!(Arc::ptr_eq(f_body, method_body));
        assert!(!Arc::ptr_eq(f_body, &unit.functions[0].op_array));
        assert!(Arc::ptr_eq(&back.main.constants[0], &f_body.constants[0]));
        assert!(!Arc::ptr_eq(&back.main.constants[0], &unit.main.constants[0]));
    }

    #[test]
    fn exhaustion_aborts_and_releases_everything() {
        let unit = sample_unit();
        let (seg, mut pool) = shared_pool(POOL_HEADER_SIZE + 64);
        let err = deep_copy_in(&unit, &mut pool).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(seg.is_protected(), "window must close on failure");
        pool.destroy();
        assert_eq!(seg.used(), 0);
        assert_eq!(seg.live_allocations(), 0);
    }

    #[test]
    fn shared_copy_leaves_segment_protected() {
        let (seg, mut pool) = shared_pool(1 << 20);
        deep_copy_in(&sample_unit(), &mut pool).unwrap();
        assert!(seg.is_protected());
        assert!(seg.used() > POOL_HEADER_SIZE);
    }

    #[test]
    fn materializer_builds_single_definitions() {
        let unit = sample_unit();
        let (_seg, mut shared) = shared_pool(1 << 20);
        let image = deep_copy_in(&unit, &mut shared).unwrap();

        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
        let mut out = Pool::create(PoolStrategy::Unpooled, heap).unwrap();
        let class_id = image.find_class("C").unwrap();
        let class = Materializer::new(&image, &mut out).class(class_id).unwrap();
        assert_eq!(class.as_ref(), unit.classes[0].as_ref());
        assert!(out.size() > POOL_HEADER_SIZE);
    }

    #[test]
    fn direction_display() {
        assert_eq!(CopyDirection::In.to_string(), "in");
        assert_eq!(CopyDirection::Out.to_string(), "out");
    }
}
