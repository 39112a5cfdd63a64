//! Process-wide allocation statistics: atomic counters plus a derived
//! hit-rate snapshot.

use crate::size_class::SizeClass;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which cache tier satisfied an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

/// Reporting bucket. Micro splits the bottom of the Small category out of
/// the tuning taxonomy for finer-grained reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatClass {
    Micro,
    Small,
    Medium,
    Large,
}

fn stat_class(class: SizeClass) -> StatClass {
    if class <= SizeClass::B64 {
        return StatClass::Micro;
    }
    match class.category() {
        crate::size_class::SizeCategory::Small => StatClass::Small,
        crate::size_class::SizeCategory::Medium => StatClass::Medium,
        _ => StatClass::Large,
    }
}

struct Counters {
    micro_allocs: AtomicU64,
    micro_frees: AtomicU64,
    small_allocs: AtomicU64,
    small_frees: AtomicU64,
    medium_allocs: AtomicU64,
    medium_frees: AtomicU64,
    large_allocs: AtomicU64,
    large_frees: AtomicU64,
    compactions: AtomicU64,
    releases: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
}

static STATS: Counters = Counters {
    micro_allocs: AtomicU64::new(0),
    micro_frees: AtomicU64::new(0),
    small_allocs: AtomicU64::new(0),
    small_frees: AtomicU64::new(0),
    medium_allocs: AtomicU64::new(0),
    medium_frees: AtomicU64::new(0),
    large_allocs: AtomicU64::new(0),
    large_frees: AtomicU64::new(0),
    compactions: AtomicU64::new(0),
    releases: AtomicU64::new(0),
    cache_hits: AtomicU64::new(0),
    cache_misses: AtomicU64::new(0),
    l1_hits: AtomicU64::new(0),
    l2_hits: AtomicU64::new(0),
    l3_hits: AtomicU64::new(0),
};

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub micro_allocs: u64,
    pub micro_frees: u64,
    pub small_allocs: u64,
    pub small_frees: u64,
    pub medium_allocs: u64,
    pub medium_frees: u64,
    pub large_allocs: u64,
    pub large_frees: u64,
    pub compactions: u64,
    pub releases: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    /// cache_hits / total allocs, as a percentage.
    pub hit_rate: f64,
}

impl Stats {
    pub fn total_allocs(&self) -> u64 {
        self.micro_allocs + self.small_allocs + self.medium_allocs + self.large_allocs
    }

    pub fn total_frees(&self) -> u64 {
        self.micro_frees + self.small_frees + self.medium_frees + self.large_frees
    }
}

pub(crate) fn record_alloc(class: SizeClass) {
    let counter = match stat_class(class) {
        StatClass::Micro => &STATS.micro_allocs,
        StatClass::Small => &STATS.small_allocs,
        StatClass::Medium => &STATS.medium_allocs,
        StatClass::Large => &STATS.large_allocs,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_free(class: SizeClass) {
    let counter = match stat_class(class) {
        StatClass::Micro => &STATS.micro_frees,
        StatClass::Small => &STATS.small_frees,
        StatClass::Medium => &STATS.medium_frees,
        StatClass::Large => &STATS.large_frees,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_hit(tier: CacheTier) {
    STATS.cache_hits.fetch_add(1, Ordering::Relaxed);
    let counter = match tier {
        CacheTier::L1 => &STATS.l1_hits,
        CacheTier::L2 => &STATS.l2_hits,
        CacheTier::L3 => &STATS.l3_hits,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_miss() {
    STATS.cache_misses.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_release(slabs: u64) {
    STATS.releases.fetch_add(slabs, Ordering::Relaxed);
}

pub(crate) fn record_compaction(migrations: u64) {
    STATS.compactions.fetch_add(migrations, Ordering::Relaxed);
}

/// Snapshot every counter and derive the cache hit rate.
pub fn snapshot() -> Stats {
    let mut stats = Stats {
        micro_allocs: STATS.micro_allocs.load(Ordering::Relaxed),
        micro_frees: STATS.micro_frees.load(Ordering::Relaxed),
        small_allocs: STATS.small_allocs.load(Ordering::Relaxed),
        small_frees: STATS.small_frees.load(Ordering::Relaxed),
        medium_allocs: STATS.medium_allocs.load(Ordering::Relaxed),
        medium_frees: STATS.medium_frees.load(Ordering::Relaxed),
        large_allocs: STATS.large_allocs.load(Ordering::Relaxed),
        large_frees: STATS.large_frees.load(Ordering::Relaxed),
        compactions: STATS.compactions.load(Ordering::Relaxed),
        releases: STATS.releases.load(Ordering::Relaxed),
        cache_hits: STATS.cache_hits.load(Ordering::Relaxed),
        cache_misses: STATS.cache_misses.load(Ordering::Relaxed),
        l1_hits: STATS.l1_hits.load(Ordering::Relaxed),
        l2_hits: STATS.l2_hits.load(Ordering::Relaxed),
        l3_hits: STATS.l3_hits.load(Ordering::Relaxed),
        hit_rate: 0.0,
    };
    let total = stats.total_allocs();
    if total > 0 {
        stats.hit_rate = stats.cache_hits as f64 / total as f64 * 100.0;
    }
    stats
}
