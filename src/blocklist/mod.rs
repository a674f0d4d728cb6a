//! Peer-address abuse tracking
//!
//! Admission keeps a bounded LRU of peer addresses that failed the TLS
//! handshake. Every offense extends the block window exponentially
//! (`expiry = now + base * count`), so repeat offenders are dropped before
//! any handshake CPU is spent on them. Expiry is lazy: entries are only
//! evicted when observed after their deadline or when capacity forces the
//! least-recently-used one out, so no sweeper task is needed.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// State tracked for one offending peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbuseEntry {
    /// Instant the current block window ends
    pub expires_at: Instant,
    /// Number of offenses recorded while the entry has been present
    pub count: u32,
}

impl AbuseEntry {
    /// Whether the block window has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Bounded LRU of misbehaving peer addresses
///
/// Thread-safe: admission runs one listener task per pool, all sharing the
/// supervisor's single cache.
pub struct AbuseCache {
    inner: Mutex<LruCache<String, AbuseEntry>>,
}

impl std::fmt::Debug for AbuseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbuseCache")
            .field("len", &self.inner.lock().len())
            .finish_non_exhaustive()
    }
}

impl AbuseCache {
    /// Create a cache bounded at `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up an entry, promoting it to most-recently-used on hit
    #[must_use]
    pub fn get(&self, key: &str) -> Option<AbuseEntry> {
        self.inner.lock().get(key).copied()
    }

    /// Insert or replace an entry, promoting it to most-recently-used
    ///
    /// Overflow evicts the least-recently-used entry.
    pub fn put(&self, key: impl Into<String>, expires_at: Instant, count: u32) {
        self.inner
            .lock()
            .put(key.into(), AbuseEntry { expires_at, count });
    }

    /// Record one offense for `key`
    ///
    /// An existing entry gets `count += 1` and its expiry pushed out to
    /// `now + base_window * count`; a new entry starts at count 1 with a
    /// single base window.
    pub fn increment(&self, key: impl Into<String>, base_window: Duration) {
        let mut cache = self.inner.lock();
        let key = key.into();
        if let Some(entry) = cache.get_mut(&key) {
            entry.count += 1;
            entry.expires_at = Instant::now() + base_window * entry.count;
        } else {
            cache.put(
                key,
                AbuseEntry {
                    expires_at: Instant::now() + base_window,
                    count: 1,
                },
            );
        }
    }

    /// Remove a single entry
    pub fn invalidate(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Evict expired entries, scanning from the LRU end
    ///
    /// Stops at the first unexpired entry; recently-touched entries are
    /// left for lazy eviction on observation.
    pub fn remove_expired(&self) {
        let mut cache = self.inner.lock();
        let now = Instant::now();
        while let Some((_, entry)) = cache.peek_lru() {
            if entry.expires_at <= now {
                cache.pop_lru();
            } else {
                break;
            }
        }
    }

    /// Number of tracked addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
