//! Socket cache — idle outbound connections keyed by destination.
//!
//! At most one idle connection per node address is held. The cache is one
//! LRU with a single global capacity; inserting past capacity closes the
//! least recently returned connection, and inserting for an address that
//! already has an idle connection closes the older one. Connections idle
//! longer than the configured timeout are closed by `evict_idle` and are
//! never handed out by `take`.
//!
//! Callers must not assume atomicity across take → use → return: another
//! task may return a connection for the same address in between, in which
//! case the later return wins.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use trellis_core::NodeAddress;

/// Something the cache can hold. Dropping the value closes it.
pub trait Poolable: Send {
    /// False once the connection has seen an error or a close.
    fn is_usable(&self) -> bool;
}

struct Slot<C> {
    conn: C,
    returned_at: Instant,
}

struct Inner<C> {
    lru: LruCache<NodeAddress, Slot<C>>,
    idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Connections handed out and not yet returned or disposed.
    pub active: u64,
    pub idle: usize,
    pub capacity: usize,
}

pub struct SocketCache<C> {
    inner: Mutex<Inner<C>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    active: AtomicU64,
}

fn capacity_of(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl<C: Poolable> SocketCache<C> {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity_of(capacity)),
                idle_timeout,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<C>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Remove and return the idle connection for `address`, if a usable one
    /// is held. A miss means the caller must establish a new connection.
    pub fn take(&self, address: &NodeAddress) -> Option<C> {
        let slot = {
            let mut inner = self.lock();
            let timeout = inner.idle_timeout;
            inner
                .lru
                .pop(address)
                .map(|slot| (slot.returned_at.elapsed() <= timeout, slot))
        };
        match slot {
            Some((true, slot)) if slot.conn.is_usable() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.active.fetch_add(1, Ordering::Relaxed);
                Some(slot.conn)
            }
            Some(_) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %address, "dropping stale pooled connection");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Count a freshly established connection as handed out.
    pub fn note_established(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a connection for reuse.
    pub fn add_and_evict_old(&self, address: &NodeAddress, conn: C) {
        self.release();
        if !conn.is_usable() {
            tracing::debug!(peer = %address, "not pooling unusable connection");
            return;
        }
        let displaced = {
            let mut inner = self.lock();
            inner.lru.push(
                address.clone(),
                Slot {
                    conn,
                    returned_at: Instant::now(),
                },
            )
        };
        if let Some((old, _slot)) = displaced {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %old, "evicted pooled connection");
        }
    }

    /// Close a connection without pooling it.
    pub fn dispose_item(&self, address: &NodeAddress, conn: C) {
        self.release();
        tracing::debug!(peer = %address, "disposing connection");
        drop(conn);
    }

    /// Close every idle connection older than the idle timeout.
    pub fn evict_idle(&self) -> usize {
        let expired: Vec<Slot<C>> = {
            let mut inner = self.lock();
            let timeout = inner.idle_timeout;
            let keys: Vec<NodeAddress> = inner
                .lru
                .iter()
                .filter(|(_, slot)| slot.returned_at.elapsed() > timeout || !slot.conn.is_usable())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| inner.lru.pop(k)).collect()
        };
        let n = expired.len();
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
            tracing::debug!(count = n, "reaped idle connections");
        }
        n
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.lock();
        let cap = capacity_of(capacity);
        let overflow = inner.lru.len().saturating_sub(cap.get());
        inner.lru.resize(cap);
        if overflow > 0 {
            self.evictions.fetch_add(overflow as u64, Ordering::Relaxed);
        }
    }

    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.lock().idle_timeout = idle_timeout;
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.lock().lru.contains(address)
    }

    pub fn stats(&self) -> CacheStats {
        let (idle, capacity) = {
            let inner = self.lock();
            (inner.lru.len(), inner.lru.cap().get())
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            idle,
            capacity,
        }
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }
}
