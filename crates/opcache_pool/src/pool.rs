//! Arena-semantics pools.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::alloc::{Allocation, Allocator};
use crate::error::PoolError;

/// Bytes charged for a pool's own bookkeeping when it is created.
pub const POOL_HEADER_SIZE: usize = 64;

/// How a pool draws on its allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStrategy {
    /// Ordinary private memory, freed normally.
    Private,
    /// The shared segment; every mutation is bracketed by unprotect/protect.
    Shared,
    /// Only the header is allocated. Used as the destination of a copy whose
    /// result the caller owns outright; nodes are counted but not reserved.
    Unpooled,
}

impl fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStrategy::Private => write!(f, "private"),
            PoolStrategy::Shared => write!(f, "shared"),
            PoolStrategy::Unpooled => write!(f, "unpooled"),
        }
    }
}

/// An allocation arena with a single release-everything operation.
///
/// Dropping a pool releases it; [`destroy`](Self::destroy) does the same
/// explicitly.
pub struct Pool {
    strategy: PoolStrategy,
    allocator: Arc<dyn Allocator>,
    allocations: Vec<Allocation>,
    size: usize,
}

impl Pool {
    /// Creates a pool and charges its header to `allocator`.
    pub fn create(strategy: PoolStrategy, allocator: Arc<dyn Allocator>) -> Result<Self, PoolError> {
        let mut pool = Self {
            strategy,
            allocator,
            allocations: Vec::new(),
            size: 0,
        };
        pool.reserve(POOL_HEADER_SIZE)?;
        Ok(pool)
    }

    /// Charges `size` bytes to the pool.
    ///
    /// On failure nothing is charged and the pool is left as it was.
    pub fn alloc(&mut self, size: usize) -> Result<(), PoolError> {
        if self.strategy == PoolStrategy::Unpooled {
            self.size += size;
            return Ok(());
        }
        self.reserve(size)
    }

    fn reserve(&mut self, size: usize) -> Result<(), PoolError> {
        let _window = self.write_window();
        let allocation = self.allocator.alloc(size)?;
        self.allocations.push(allocation);
        self.size += size;
        Ok(())
    }

    /// Opens a write window on the allocator if this pool mutates shared
    /// memory.
    pub fn write_window(&self) -> Option<WriteWindow> {
        (self.strategy == PoolStrategy::Shared).then(|| WriteWindow::open(&self.allocator))
    }

    /// The pool's strategy.
    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    /// Bytes charged so far, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of blocks reserved from the allocator.
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// The allocator this pool draws on.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Releases every block in one step.
    pub fn destroy(self) {
        drop(self);
    }

    fn release(&mut self) {
        if self.allocations.is_empty() {
            return;
        }
        let _window = self.write_window();
        for allocation in self.allocations.drain(..) {
            if let Err(e) = self.allocator.free(allocation) {
                warn!(error = %e, strategy = %self.strategy, "failed to free pool block");
            }
        }
        self.size = 0;
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("strategy", &self.strategy)
            .field("size", &self.size)
            .field("allocations", &self.allocations.len())
            .finish()
    }
}

/// An open unprotect window on an allocator. Re-protects on drop.
pub struct WriteWindow {
    allocator: Arc<dyn Allocator>,
}

impl WriteWindow {
    /// Unprotects `allocator` until the window is dropped.
    pub fn open(allocator: &Arc<dyn Allocator>) -> Self {
        allocator.unprotect();
        Self {
            allocator: Arc::clone(allocator),
        }
    }
}

impl Drop for WriteWindow {
    fn drop(&mut self) {
        self.allocator.protect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HeapAllocator, SharedSegment};

    fn segment(capacity: usize) -> (Arc<SharedSegment>, Arc<dyn Allocator>) {
        let seg = Arc::new(SharedSegment::create(capacity).unwrap());
        let dyn_seg: Arc<dyn Allocator> = seg.clone();
        (seg, dyn_seg)
    }

    #[test]
    fn create_charges_header() {
        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
        let pool = Pool::create(PoolStrategy::Private, heap.clone()).unwrap();
        assert_eq!(pool.size(), POOL_HEADER_SIZE);
        assert_eq!(heap.used(), POOL_HEADER_SIZE);
        drop(pool);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn shared_pool_brackets_every_mutation() {
        let (seg, alloc) = segment(4096);
        let mut pool = Pool::create(PoolStrategy::Shared, alloc).unwrap();
        pool.alloc(100).unwrap();
        assert!(seg.is_protected(), "segment must be protected between calls");
        assert_eq!(seg.used(), POOL_HEADER_SIZE + 100);
        pool.destroy();
        assert!(seg.is_protected());
        assert_eq!(seg.used(), 0);
        assert_eq!(seg.live_allocations(), 0);
    }

    #[test]
    fn failed_alloc_leaves_pool_unchanged() {
        let (seg, alloc) = segment(POOL_HEADER_SIZE + 10);
        let mut pool = Pool::create(PoolStrategy::Shared, alloc).unwrap();
        assert!(matches!(pool.alloc(11), Err(PoolError::Exhausted { .. })));
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(seg.used(), POOL_HEADER_SIZE);
    }

    #[test]
    fn unpooled_reserves_only_header() {
        let heap: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
        let mut pool = Pool::create(PoolStrategy::Unpooled, heap.clone()).unwrap();
        pool.alloc(10_000).unwrap();
        assert_eq!(pool.size(), POOL_HEADER_SIZE + 10_000);
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(heap.used(), POOL_HEADER_SIZE);
    }

    #[test]
    fn private_pool_on_protected_segment_is_refused() {
        let (_seg, alloc) = segment(1024);
        assert_eq!(
            Pool::create(PoolStrategy::Private, alloc).unwrap_err(),
            PoolError::Protected
        );
    }

    #[test]
    fn strategy_display() {
        assert_eq!(PoolStrategy::Shared.to_string(), "shared");
        assert_eq!(PoolStrategy::Unpooled.to_string(), "unpooled");
    }
}
