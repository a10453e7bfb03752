//! Cache entries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use opcache_ir::FileImage;
use opcache_pool::Pool;
use parking_lot::Mutex;

use crate::key::CacheKey;

struct Backing {
    image: Arc<FileImage>,
    _pool: Pool,
}

/// One published compiled file.
///
/// The entry owns the shared pool its image was copied into. The pool is
/// destroyed only once the entry has been evicted and no checkout still holds
/// a reference; after that [`image`](Self::image) returns `None`.
pub struct CacheEntry {
    key: CacheKey,
    created: i64,
    mem_size: usize,
    access_time: AtomicI64,
    hits: AtomicU64,
    ref_count: AtomicUsize,
    evicted: AtomicBool,
    backing: Mutex<Option<Backing>>,
}

impl CacheEntry {
    /// Wraps an image and the pool that backs it.
    pub fn new(key: CacheKey, image: FileImage, pool: Pool, now: i64) -> Self {
        Self {
            key,
            created: now,
            mem_size: pool.size(),
            access_time: AtomicI64::new(now),
            hits: AtomicU64::new(0),
            ref_count: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            backing: Mutex::new(Some(Backing {
                image: Arc::new(image),
                _pool: pool,
            })),
        }
    }

    /// The key the entry was published under.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The cached file's path.
    pub fn filename(&self) -> &Path {
        &self.key.path
    }

    /// When the entry was created.
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Bytes charged to the entry's pool.
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// When the entry was last found.
    pub fn access_time(&self) -> i64 {
        self.access_time.load(Ordering::Relaxed)
    }

    /// How many lookups have hit this entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Outstanding checkouts.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Whether the entry has been removed from the index.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Whether the backing pool has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.backing.lock().is_none()
    }

    /// The cached image, while the entry is still backed.
    pub fn image(&self) -> Option<Arc<FileImage>> {
        self.backing.lock().as_ref().map(|b| Arc::clone(&b.image))
    }

    pub(crate) fn checkout(&self, now: i64) -> usize {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.access_time.store(now, Ordering::Relaxed);
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the refcount and returns the new value. An unbalanced
    /// release leaves the count at zero.
    pub(crate) fn checkin(&self) -> usize {
        let mut current = self.ref_count.load(Ordering::SeqCst);
        while current > 0 {
            match self.ref_count.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(seen) => current = seen,
            }
        }
        0
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// Drops the backing pool. Returns `true` the first time only.
    pub(crate) fn destroy(&self) -> bool {
        self.backing.lock().take().is_some()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("path", &self.key.path)
            .field("ref_count", &self.ref_count())
            .field("evicted", &self.is_evicted())
            .field("mem_size", &self.mem_size)
            .finish()
    }
}
