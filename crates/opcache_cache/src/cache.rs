//! The shared compiled-artifact store.
//!
//! Readers look entries up under a read lock and take their reference while
//! still holding it, so an entry can never be destroyed between being found
//! and being checked out. Publication and eviction take the write lock. An
//! entry becomes reachable only after its image is fully copied.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use opcache_config::CacheConfig;
use opcache_pool::Allocator;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::key::{CacheKey, KeySource};

struct PendingDeletion {
    entry: Arc<CacheEntry>,
    since: i64,
    warned: bool,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    expunges: AtomicU64,
}

/// A snapshot of one entry for [`CacheInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Cached file.
    pub filename: PathBuf,
    /// Lookups that hit.
    pub hits: u64,
    /// Outstanding checkouts.
    pub ref_count: usize,
    /// Bytes charged to the entry's pool.
    pub mem_size: usize,
    /// Creation time.
    pub created: i64,
    /// Last access time.
    pub access_time: i64,
}

/// A snapshot of the whole cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    /// Live entries, sorted by filename.
    pub entries: Vec<EntryInfo>,
    /// Lookups that hit.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Successful publications.
    pub inserts: u64,
    /// Memory-pressure expunges.
    pub expunges: u64,
    /// Bytes in use in the segment.
    pub mem_used: usize,
    /// Segment capacity, if bounded.
    pub mem_capacity: Option<usize>,
    /// Evicted entries still checked out.
    pub pending_deletions: usize,
}

/// The keyed store of cache entries.
pub struct ArtifactCache {
    segment: Arc<dyn Allocator>,
    index: RwLock<HashMap<KeySource, Arc<CacheEntry>>>,
    deleted: Mutex<Vec<PendingDeletion>>,
    counters: Counters,
    busy: AtomicBool,
    ttl: i64,
    gc_ttl: i64,
    busy_watermark: f64,
}

impl ArtifactCache {
    /// Creates an empty cache over `segment`.
    pub fn new(segment: Arc<dyn Allocator>, config: &CacheConfig) -> Self {
        Self {
            segment,
            index: RwLock::new(HashMap::with_capacity(config.num_files_hint)),
            deleted: Mutex::new(Vec::new()),
            counters: Counters::default(),
            busy: AtomicBool::new(false),
            ttl: config.ttl as i64,
            gc_ttl: config.gc_ttl as i64,
            busy_watermark: config.busy_watermark,
        }
    }

    /// The allocator entries draw their pools from.
    pub fn segment(&self) -> &Arc<dyn Allocator> {
        &self.segment
    }

    /// Looks up `key` and checks the entry out on a hit.
    ///
    /// A resolved entry whose version differs from `key` is stale: it is
    /// evicted and the lookup misses.
    pub fn find(&self, key: &CacheKey, now: i64) -> Option<Arc<CacheEntry>> {
        self.gc(now);

        let stale = {
            let index = self.index.read();
            match index.get(&key.source) {
                None => None,
                Some(entry) if entry.key().same_version(key) => {
                    let refs = entry.checkout(now);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %entry.filename().display(), refcount = refs, "cache hit");
                    return Some(Arc::clone(entry));
                }
                Some(entry) => Some(Arc::clone(entry)),
            }
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = stale {
            debug!(path = %entry.filename().display(), "stale entry replaced on lookup");
            self.evict_entry(&entry, now);
        }
        None
    }

    /// Publishes `entry` unless an entry for the same version is already
    /// present.
    ///
    /// The first successful writer wins: on `false` the caller's entry has
    /// been dropped and its pool released. An entry for a different version
    /// of the same file is replaced.
    pub fn insert(&self, entry: CacheEntry, now: i64) -> bool {
        self.publish(entry, now, false)
    }

    /// Publishes `entry`, replacing whatever is present for its file.
    pub fn replace(&self, entry: CacheEntry, now: i64) -> bool {
        self.publish(entry, now, true)
    }

    fn publish(&self, entry: CacheEntry, now: i64, force: bool) -> bool {
        self.gc(now);

        let replaced = {
            let mut index = self.index.write();
            let source = entry.key().source.clone();
            let previous = index.get(&source).cloned();
            if let Some(existing) = &previous {
                if !force && existing.key().same_version(entry.key()) {
                    debug!(path = %entry.filename().display(), "insert lost race");
                    return false;
                }
            }
            debug!(path = %entry.filename().display(), bytes = entry.mem_size(), "cache insert");
            index.insert(source, Arc::new(entry));
            previous
        };

        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = replaced {
            self.retire(&old, now);
        }
        true
    }

    /// Returns a checkout. Destroys the entry's pool if this was the last
    /// reference to an evicted entry.
    pub fn release(&self, entry: &CacheEntry) -> usize {
        let remaining = entry.checkin();
        if remaining == 0 && entry.is_evicted() && entry.destroy() {
            debug!(path = %entry.filename().display(), "released evicted entry");
        }
        remaining
    }

    /// Returns `true` when population should be skipped: an expunge is in
    /// progress or the segment is above its usage watermark.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) || self.segment.usage() >= self.busy_watermark
    }

    /// Sweeps idle, unreferenced entries and settles pending deletions.
    ///
    /// Entries idle for longer than `gc_ttl` with no checkouts are evicted.
    /// Evicted entries still checked out are never freed here; they are
    /// reported once when they have been pending for longer than `gc_ttl`.
    pub fn gc(&self, now: i64) {
        if self.gc_ttl > 0 {
            let idle: Vec<Arc<CacheEntry>> = self
                .index
                .read()
                .values()
                .filter(|e| e.ref_count() == 0 && now - e.access_time() > self.gc_ttl)
                .cloned()
                .collect();
            for entry in idle {
                debug!(path = %entry.filename().display(), "gc evicting idle entry");
                self.evict_entry(&entry, now);
            }
        }

        let mut deleted = self.deleted.lock();
        deleted.retain_mut(|pending| {
            if pending.entry.ref_count() == 0 {
                pending.entry.destroy();
                return false;
            }
            if self.gc_ttl > 0 && !pending.warned && now - pending.since > self.gc_ttl {
                warn!(
                    path = %pending.entry.filename().display(),
                    refcount = pending.entry.ref_count(),
                    "evicted entry still checked out"
                );
                pending.warned = true;
            }
            !pending.entry.is_destroyed()
        });
    }

    /// Frees memory after a failed population.
    ///
    /// With a `ttl`, entries idle for longer than it are evicted; without one
    /// every unreferenced entry is. New population is refused while this
    /// runs.
    pub fn expunge(&self, now: i64) -> usize {
        self.busy.store(true, Ordering::SeqCst);
        let victims: Vec<Arc<CacheEntry>> = self
            .index
            .read()
            .values()
            .filter(|e| {
                if self.ttl > 0 {
                    now - e.access_time() > self.ttl
                } else {
                    e.ref_count() == 0
                }
            })
            .cloned()
            .collect();
        let count = victims.len();
        for entry in victims {
            self.evict_entry(&entry, now);
        }
        self.counters.expunges.fetch_add(1, Ordering::Relaxed);
        self.busy.store(false, Ordering::SeqCst);
        debug!(evicted = count, "cache expunged");
        count
    }

    /// Evicts the entry indexed for `key`'s file, whatever its version.
    pub fn evict(&self, key: &CacheKey, now: i64) -> bool {
        let entry = self.index.read().get(&key.source).cloned();
        match entry {
            Some(entry) => self.evict_entry(&entry, now),
            None => false,
        }
    }

    /// Evicts every entry.
    pub fn clear(&self, now: i64) -> usize {
        let all: Vec<Arc<CacheEntry>> = self.index.read().values().cloned().collect();
        all.iter().filter(|e| self.evict_entry(e, now)).count()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns `true` if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Takes a snapshot of the cache's state.
    pub fn info(&self) -> CacheInfo {
        let mut entries: Vec<EntryInfo> = self
            .index
            .read()
            .values()
            .map(|e| EntryInfo {
                filename: e.filename().to_path_buf(),
                hits: e.hits(),
                ref_count: e.ref_count(),
                mem_size: e.mem_size(),
                created: e.created(),
                access_time: e.access_time(),
            })
            .collect();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        CacheInfo {
            entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            expunges: self.counters.expunges.load(Ordering::Relaxed),
            mem_used: self.segment.used(),
            mem_capacity: self.segment.capacity(),
            pending_deletions: self.deleted.lock().len(),
        }
    }

    /// Unlinks `entry` from the index if it is still the indexed one.
    fn evict_entry(&self, entry: &Arc<CacheEntry>, now: i64) -> bool {
        {
            let mut index = self.index.write();
            match index.get(&entry.key().source) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    index.remove(&entry.key().source);
                }
                _ => return false,
            }
        }
        self.retire(entry, now);
        true
    }

    /// Destroys an unlinked entry now, or parks it until its last checkout.
    fn retire(&self, entry: &Arc<CacheEntry>, now: i64) {
        entry.mark_evicted();
        if entry.ref_count() == 0 {
            entry.destroy();
        } else {
            self.deleted.lock().push(PendingDeletion {
                entry: Arc::clone(entry),
                since: now,
                warned: false,
            });
        }
    }
}
