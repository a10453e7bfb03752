//! Scoped allocation pools and cross-pool deep copy.
//!
//! A [`Pool`] is an arena bound to one [`Allocator`] under one
//! [`PoolStrategy`]; destroying it returns every byte it took in one step.
//! [`deep_copy_in`] publishes a live [`FileUnit`](opcache_ir::FileUnit) into a
//! pool as a self-contained [`FileImage`](opcache_ir::FileImage), and
//! [`deep_copy_out`] rebuilds a live unit from an image.

#![warn(missing_docs)]

pub mod alloc;
pub mod copy;
pub mod error;
pub mod pool;

pub use alloc::{Allocation, Allocator, HeapAllocator, SharedSegment};
pub use copy::{deep_copy_in, deep_copy_out, CopyDirection, Materializer};
pub use error::PoolError;
pub use pool::{Pool, PoolStrategy, WriteWindow};
