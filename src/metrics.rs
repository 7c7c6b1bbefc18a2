//! Lightweight global metrics for UltraKV.
//!
//! Потокобезопасные атомарные счётчики подсистем:
//! - point-операции (put/get/delete)
//! - free-space аллокатор (переиспользование vs рост файла)
//! - flush / фоновый GC

use std::sync::atomic::{AtomicU64, Ordering};

// ----- point ops -----
static PUTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GETS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GET_MISSES: AtomicU64 = AtomicU64::new(0);
static DELETES_TOTAL: AtomicU64 = AtomicU64::new(0);

// ----- free space -----
static FREE_REUSE_HITS: AtomicU64 = AtomicU64::new(0);
static FREE_REUSE_MISSES: AtomicU64 = AtomicU64::new(0);

// ----- maintenance -----
static FLUSHES_TOTAL: AtomicU64 = AtomicU64::new(0);
static GC_RUNS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GC_BYTES_RECLAIMED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub puts_total: u64,
    pub gets_total: u64,
    pub get_misses: u64,
    pub deletes_total: u64,
    pub free_reuse_hits: u64,
    pub free_reuse_misses: u64,
    pub flushes_total: u64,
    pub gc_runs_total: u64,
    pub gc_bytes_reclaimed: u64,
}

/// Снимок всех счётчиков процесса.
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        puts_total: PUTS_TOTAL.load(Ordering::Relaxed),
        gets_total: GETS_TOTAL.load(Ordering::Relaxed),
        get_misses: GET_MISSES.load(Ordering::Relaxed),
        deletes_total: DELETES_TOTAL.load(Ordering::Relaxed),
        free_reuse_hits: FREE_REUSE_HITS.load(Ordering::Relaxed),
        free_reuse_misses: FREE_REUSE_MISSES.load(Ordering::Relaxed),
        flushes_total: FLUSHES_TOTAL.load(Ordering::Relaxed),
        gc_runs_total: GC_RUNS_TOTAL.load(Ordering::Relaxed),
        gc_bytes_reclaimed: GC_BYTES_RECLAIMED.load(Ordering::Relaxed),
    }
}

#[inline]
pub fn record_put() {
    PUTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_get() {
    GETS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_get_miss() {
    GET_MISSES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_delete() {
    DELETES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_free_reuse_hit() {
    FREE_REUSE_HITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_free_reuse_miss() {
    FREE_REUSE_MISSES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_flush() {
    FLUSHES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_gc_run(bytes_reclaimed: u64) {
    GC_RUNS_TOTAL.fetch_add(1, Ordering::Relaxed);
    GC_BYTES_RECLAIMED.fetch_add(bytes_reclaimed, Ordering::Relaxed);
}
