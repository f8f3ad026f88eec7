//! process-wide operation counters
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

/// Counters shared by every volume, cache and the coordinator of one instance.
///
/// All updates are relaxed atomic adds, a snapshot never blocks writers.
#[derive(Debug, Default)]
pub struct Statistics {
    reads: AtomicU64,
    writes: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    creates: AtomicU64,
    deletes: AtomicU64,
    renames: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    journal_ops: AtomicU64,
    replication_ops: AtomicU64,
    lock_acquisitions: AtomicU64,
    read_latency_ns: AtomicU64,
    write_latency_ns: AtomicU64,
}

impl Statistics {
    pub fn record_read(&self, bytes: u64, latency: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.read_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64, latency: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn inc_opens(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closes(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_creates(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deletes(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renames(&self) {
        self.renames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_evictions(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_journal_ops(&self) {
        self.journal_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replication_ops(&self, count: u64) {
        self.replication_ops.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_lock_acquisitions(&self) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            journal_ops: self.journal_ops.load(Ordering::Relaxed),
            replication_ops: self.replication_ops.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            read_latency_ns: self.read_latency_ns.load(Ordering::Relaxed),
            write_latency_ns: self.write_latency_ns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [Statistics]
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub opens: u64,
    pub closes: u64,
    pub creates: u64,
    pub deletes: u64,
    pub renames: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub journal_ops: u64,
    pub replication_ops: u64,
    pub lock_acquisitions: u64,
    pub read_latency_ns: u64,
    pub write_latency_ns: u64,
}

impl StatisticsSnapshot {
    /// mean latency of one read, zero before the first read
    pub fn average_read_latency(&self) -> Duration {
        Duration::from_nanos(self.read_latency_ns.checked_div(self.reads).unwrap_or(0))
    }

    pub fn average_write_latency(&self) -> Duration {
        Duration::from_nanos(self.write_latency_ns.checked_div(self.writes).unwrap_or(0))
    }

    /// fraction of cache lookups served from a cache
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}
