//! bounded block caches
//!
//! The same cache serves four levels: the global block cache, one per volume,
//! one per open file and one per open directory. Lines are keyed by
//! `(volume id, block number)` and evicted least recently used first among the
//! lines nobody has pinned. A dirty victim is handed back to the caller, who
//! writes it to the device after the cache lock is released.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use log::debug;
use serde::Serialize;
use spin::Mutex;

use crate::stats::Statistics;

pub type CacheKey = (u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheLevel {
    Global,
    Volume,
    File,
    Directory,
}

/// One cached block of data
#[derive(Debug, Clone)]
pub struct CacheLine {
    pub volume_id: u64,
    pub block: u64,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub refcount: u32,
    pub access_count: u64,
    /// logical clock of the last access, drives replacement
    pub last_access: u64,
}

/// a dirty block leaving the cache, to be written to its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Writeback {
    pub volume_id: u64,
    pub block: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct CacheInner {
    lines: HashMap<CacheKey, CacheLine>,
    /// last access tick → key, for lines with a zero refcount only
    lru: BTreeMap<u64, CacheKey>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// move a line to the most recently used position
    fn touch(&mut self, key: CacheKey) {
        let tick = self.next_tick();
        if let Some(line) = self.lines.get_mut(&key) {
            if line.refcount == 0 {
                self.lru.remove(&line.last_access);
                self.lru.insert(tick, key);
            }
            line.last_access = tick;
            line.access_count += 1;
        }
    }

    fn evict_one(&mut self) -> Option<CacheLine> {
        let (_, key) = self.lru.pop_first()?;
        self.evictions += 1;
        self.lines.remove(&key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub lines: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct BlockCache {
    level: CacheLevel,
    capacity: usize,
    inner: Mutex<CacheInner>,
    stats: Arc<Statistics>,
}

impl BlockCache {
    pub fn new(level: CacheLevel, capacity: usize, stats: Arc<Statistics>) -> Self {
        BlockCache {
            level,
            capacity,
            inner: Mutex::new(CacheInner::default()),
            stats,
        }
    }

    pub fn level(&self) -> CacheLevel {
        self.level
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// copy of the cached block, counting a hit or a miss
    pub fn get(&self, key: CacheKey) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.lines.contains_key(&key) {
            inner.hits += 1;
            inner.touch(key);
            self.stats.inc_cache_hits();
            inner.lines.get(&key).map(|line| line.data.clone())
        } else {
            inner.misses += 1;
            self.stats.inc_cache_misses();
            None
        }
    }

    pub fn contains(&self, key: CacheKey) -> bool {
        self.inner.lock().lines.contains_key(&key)
    }

    /// cache `data` for `key`; a clean fill never replaces a dirty line.
    ///
    /// Returns a dirty line the caller must write back: either the evicted
    /// victim, or `data` itself when every line is pinned.
    pub fn insert(&self, key: CacheKey, data: Vec<u8>, dirty: bool) -> Option<Writeback> {
        let mut inner = self.inner.lock();
        if let Some(line) = inner.lines.get_mut(&key) {
            // a clean fill read from below is older than unflushed data
            if dirty || !line.dirty {
                line.data = data;
            }
            line.dirty |= dirty;
            inner.touch(key);
            return None;
        }

        let mut writeback = None;
        if inner.lines.len() >= self.capacity {
            match inner.evict_one() {
                Some(victim) => {
                    self.stats.inc_cache_evictions();
                    debug!(
                        "{:?} cache evicts block {} of volume {} (dirty: {})",
                        self.level, victim.block, victim.volume_id, victim.dirty
                    );
                    if victim.dirty {
                        writeback = Some(Writeback {
                            volume_id: victim.volume_id,
                            block: victim.block,
                            data: victim.data,
                        });
                    }
                }
                // every line is pinned, the block bypasses this level
                None => {
                    return dirty.then_some(Writeback {
                        volume_id: key.0,
                        block: key.1,
                        data,
                    });
                }
            }
        }

        let tick = inner.next_tick();
        inner.lru.insert(tick, key);
        inner.lines.insert(
            key,
            CacheLine {
                volume_id: key.0,
                block: key.1,
                data,
                dirty,
                refcount: 0,
                access_count: 1,
                last_access: tick,
            },
        );
        writeback
    }

    /// keep a line resident until the matching [BlockCache::unpin]
    pub fn pin(&self, key: CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let Some(line) = inner.lines.get_mut(&key) else {
            return false;
        };
        line.refcount += 1;
        let last_access = line.last_access;
        if line.refcount == 1 {
            inner.lru.remove(&last_access);
        }
        true
    }

    pub fn unpin(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        let Some(line) = inner.lines.get_mut(&key) else {
            return;
        };
        line.refcount = line.refcount.saturating_sub(1);
        if line.refcount == 0 {
            let last_access = line.last_access;
            inner.lru.insert(last_access, key);
        }
    }

    /// clear the dirty flag if the line still holds `data`
    pub fn mark_clean(&self, key: CacheKey, data: &[u8]) {
        if let Some(line) = self.inner.lock().lines.get_mut(&key) {
            if line.data == data {
                line.dirty = false;
            }
        }
    }

    /// hand out every dirty line of a volume, leaving them cached and clean
    pub fn take_dirty_of_volume(&self, volume_id: u64) -> Vec<Writeback> {
        let mut inner = self.inner.lock();
        let mut dirty: Vec<Writeback> = inner
            .lines
            .values_mut()
            .filter(|line| line.dirty && line.volume_id == volume_id)
            .map(|line| {
                line.dirty = false;
                Writeback {
                    volume_id: line.volume_id,
                    block: line.block,
                    data: line.data.clone(),
                }
            })
            .collect();
        dirty.sort_unstable_by_key(|w| (w.volume_id, w.block));
        dirty
    }

    /// drop a line without writing it back
    pub fn invalidate(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(line) = inner.lines.remove(&key) {
            if line.refcount == 0 {
                inner.lru.remove(&line.last_access);
            }
        }
    }

    pub fn invalidate_volume(&self, volume_id: u64) {
        let mut inner = self.inner.lock();
        let CacheInner { lines, lru, .. } = &mut *inner;
        lines.retain(|_, line| {
            if line.volume_id != volume_id {
                return true;
            }
            if line.refcount == 0 {
                lru.remove(&line.last_access);
            }
            false
        });
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            lines: inner.lines.len(),
            dirty: inner.lines.values().filter(|line| line.dirty).count(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}
