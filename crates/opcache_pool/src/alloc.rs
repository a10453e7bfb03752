//! Allocator contract and the two allocators pools bind to.
//!
//! The allocators here account for bytes rather than hand out addresses. Node
//! storage itself lives in the image arenas; what the cache needs from an
//! allocator is the capacity limit, the failure mode when it is reached, and
//! the write-protection discipline around shared mutation.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::PoolError;

/// One block handed out by an [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    id: u64,
    size: usize,
}

impl Allocation {
    /// Allocator-unique block number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The operations a pool needs from the memory it draws on.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Reserves `size` bytes.
    fn alloc(&self, size: usize) -> Result<Allocation, PoolError>;

    /// Returns a block.
    fn free(&self, allocation: Allocation) -> Result<(), PoolError>;

    /// Re-enables write protection. Calls nest with [`unprotect`](Self::unprotect).
    fn protect(&self);

    /// Opens the segment for mutation.
    fn unprotect(&self);

    /// Bytes currently reserved.
    fn used(&self) -> usize;

    /// Total bytes available, or `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Number of blocks currently reserved.
    fn live_allocations(&self) -> usize;

    /// Fraction of capacity in use; always `0.0` for unbounded allocators.
    fn usage(&self) -> f64 {
        match self.capacity() {
            Some(cap) if cap > 0 => self.used() as f64 / cap as f64,
            _ => 0.0,
        }
    }
}

/// The process-private heap. Never fails and ignores protection.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    next_id: AtomicU64,
    used: AtomicUsize,
    live: AtomicUsize,
}

impl HeapAllocator {
    /// Creates an empty heap allocator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<Allocation, PoolError> {
        self.used.fetch_add(size, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Allocation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            size,
        })
    }

    fn free(&self, allocation: Allocation) -> Result<(), PoolError> {
        self.used.fetch_sub(allocation.size, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn protect(&self) {}

    fn unprotect(&self) {}

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct SegmentState {
    used: usize,
    live: usize,
    next_id: u64,
    unprotect_depth: usize,
}

/// A fixed-size region shared by every process using the cache.
///
/// The segment starts write-protected. Mutation (`alloc`/`free`) is only
/// permitted between [`unprotect`](Allocator::unprotect) and the matching
/// [`protect`](Allocator::protect); windows nest.
#[derive(Debug)]
pub struct SharedSegment {
    capacity: usize,
    state: Mutex<SegmentState>,
}

impl SharedSegment {
    /// Creates a segment of `capacity` bytes.
    pub fn create(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::SegmentInit {
                reason: "segment size must be positive".to_string(),
            });
        }
        Ok(Self {
            capacity,
            state: Mutex::new(SegmentState::default()),
        })
    }

    /// Bytes not yet reserved.
    pub fn available(&self) -> usize {
        self.capacity - self.state.lock().used
    }

    /// Returns `true` while no unprotect window is open.
    pub fn is_protected(&self) -> bool {
        self.state.lock().unprotect_depth == 0
    }
}

impl Allocator for SharedSegment {
    fn alloc(&self, size: usize) -> Result<Allocation, PoolError> {
        let mut state = self.state.lock();
        if state.unprotect_depth == 0 {
            return Err(PoolError::Protected);
        }
        let available = self.capacity - state.used;
        if size > available {
            return Err(PoolError::Exhausted {
                requested: size,
                available,
            });
        }
        state.used += size;
        state.live += 1;
        let id = state.next_id;
        state.next_id += 1;
        Ok(Allocation { id, size })
    }

    fn free(&self, allocation: Allocation) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.unprotect_depth == 0 {
            return Err(PoolError::Protected);
        }
        state.used = state.used.saturating_sub(allocation.size);
        state.live = state.live.saturating_sub(1);
        Ok(())
    }

    fn protect(&self) {
        let mut state = self.state.lock();
        state.unprotect_depth = state.unprotect_depth.saturating_sub(1);
    }

    fn unprotect(&self) {
        self.state.lock().unprotect_depth += 1;
    }

    fn used(&self) -> usize {
        self.state.lock().used
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn live_allocations(&self) -> usize {
        self.state.lock().live
    }
}
