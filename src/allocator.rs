//! Top-level allocator: classifies a request, walks the cache tiers,
//! falls through to the category managers, and records statistics.
//! Typed helpers expose allocations as slices.

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::manager::{
    calculate_cores, shards_per_class, CategoryManager, DirectHeap, RECLAIM_PERIOD,
};
use crate::size_class::{SizeCategory, SizeClass};
use crate::stats::{self, Stats};
use crate::weight::config::{default_global, GlobalConfig, WeightTable};
use crate::weight::hub::{Event, EventStream, EventType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Large allocations see little contention; a couple of shards per class
/// is plenty.
const LARGE_SHARDS_PER_CLASS: usize = 2;

/// The allocator front door. Thread-safe; all methods take `&self`.
pub struct Allocator {
    cache: Arc<SystemCache>,
    small: Arc<CategoryManager>,
    medium: Arc<CategoryManager>,
    large: Arc<CategoryManager>,
    direct: DirectHeap,
    closed: AtomicBool,
}

impl Allocator {
    /// Build with the default category split.
    pub fn new() -> Self {
        Self::with_weights(default_global())
    }

    /// Build with an explicit category split; shard counts per class are
    /// derived from the CPU count and the small/medium weights.
    pub fn with_weights(global: GlobalConfig) -> Self {
        let cpus = cpu_count();
        let (small_cores, medium_cores) = calculate_cores(cpus, global.small, global.medium);
        let cache = Arc::new(SystemCache::new());
        info!(
            cpus,
            small_cores, medium_cores, "initializing allocator"
        );

        Self {
            small: Arc::new(CategoryManager::new(
                SizeCategory::Small,
                shards_per_class(cpus, small_cores),
                Arc::clone(&cache),
            )),
            medium: Arc::new(CategoryManager::new(
                SizeCategory::Medium,
                shards_per_class(cpus, medium_cores),
                Arc::clone(&cache),
            )),
            large: Arc::new(CategoryManager::new(
                SizeCategory::Large,
                LARGE_SHARDS_PER_CLASS,
                Arc::clone(&cache),
            )),
            cache,
            direct: DirectHeap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn manager_for(&self, category: SizeCategory) -> &Arc<CategoryManager> {
        match category {
            SizeCategory::Small => &self.small,
            SizeCategory::Medium => &self.medium,
            _ => &self.large,
        }
    }

    fn alloc_raw(&self, size: usize) -> Result<*mut u8> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BadArgument("allocator is closed".to_string()));
        }
        if size == 0 {
            return Err(Error::BadArgument("size must be positive".to_string()));
        }

        // Oversize requests bypass the caches entirely.
        if size > SizeClass::MAX.size() {
            let ptr = self.direct.alloc(size)?;
            stats::record_alloc(SizeClass::MAX);
            return Ok(ptr);
        }

        let class = SizeClass::class_of(size);
        if let Some((ptr, tier)) = self.cache.try_alloc(size) {
            stats::record_cache_hit(tier);
            stats::record_alloc(class);
            return Ok(ptr);
        }
        stats::record_cache_miss();

        let ptr = self.manager_for(class.category()).alloc(class)?;
        stats::record_alloc(class);
        Ok(ptr)
    }

    fn free_raw(&self, ptr: *mut u8, size: usize) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::BadArgument("null pointer".to_string()));
        }
        if size == 0 {
            return Err(Error::BadArgument("size must be positive".to_string()));
        }

        if self.direct.owns(ptr) {
            self.direct.free(ptr)?;
            stats::record_free(SizeClass::MAX);
            return Ok(());
        }

        let class = SizeClass::class_of(size);
        if !self.cache.try_put(class, ptr) {
            self.manager_for(class.category()).free(class, ptr)?;
        }
        stats::record_free(class);
        Ok(())
    }

    fn alloc_slice<T>(&self, count: usize) -> Result<&mut [T]> {
        if count == 0 {
            return Err(Error::BadArgument("count must be positive".to_string()));
        }
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::BadArgument(format!("count {count} overflows")))?;
        let ptr = self.alloc_raw(bytes)?;
        // Blocks are at least pointer-aligned and sized for `bytes`;
        // contents are undefined until the caller writes them.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.cast::<T>(), count) })
    }

    /// Allocate `count` bytes; contents undefined.
    pub fn alloc_bytes(&self, count: usize) -> Result<&mut [u8]> {
        self.alloc_slice(count)
    }

    pub fn alloc_i32s(&self, count: usize) -> Result<&mut [i32]> {
        self.alloc_slice(count)
    }

    pub fn alloc_i64s(&self, count: usize) -> Result<&mut [i64]> {
        self.alloc_slice(count)
    }

    pub fn alloc_u32s(&self, count: usize) -> Result<&mut [u32]> {
        self.alloc_slice(count)
    }

    pub fn alloc_u64s(&self, count: usize) -> Result<&mut [u64]> {
        self.alloc_slice(count)
    }

    pub fn alloc_f32s(&self, count: usize) -> Result<&mut [f32]> {
        self.alloc_slice(count)
    }

    pub fn alloc_f64s(&self, count: usize) -> Result<&mut [f64]> {
        self.alloc_slice(count)
    }

    /// Return a slice obtained from any of the `alloc_*` helpers. The
    /// caller must not touch the slice afterwards.
    pub fn free<T>(&self, slice: &mut [T]) -> Result<()> {
        let bytes = std::mem::size_of_val(slice);
        self.free_raw(slice.as_mut_ptr().cast(), bytes)
    }

    /// Snapshot of the process-wide statistics.
    pub fn stats(&self) -> Stats {
        stats::snapshot()
    }

    /// Release idle fully-free slabs across every category. Returns the
    /// number of slabs handed back to the OS.
    pub fn drain_idle(&self, now: Instant) -> usize {
        self.small.drain_idle(now) + self.medium.drain_idle(now) + self.large.drain_idle(now)
    }

    /// Apply one tuning event: global changes reshape shard counts,
    /// size-class changes replace a category's weight vector.
    pub fn apply_event(&self, event: &Event) {
        match event.event_type {
            EventType::GlobalConfigChange => {
                let Some(global) = event.global else {
                    warn!("global config event without payload");
                    return;
                };
                let cpus = cpu_count();
                let (small_cores, medium_cores) =
                    calculate_cores(cpus, global.small, global.medium);
                self.small
                    .retune_shards(shards_per_class(cpus, small_cores));
                self.medium
                    .retune_shards(shards_per_class(cpus, medium_cores));
                debug!(small_cores, medium_cores, "applied global weight change");
            }
            EventType::SizeClassConfigChange => {
                let Some(details) = &event.details else {
                    warn!("size class event without payload");
                    return;
                };
                if event.category == SizeCategory::All {
                    return;
                }
                match WeightTable::from_detail(details) {
                    Ok(table) => {
                        let mut weights: Vec<f64> =
                            table.sorted().into_iter().map(|(_, w)| w).collect();
                        weights.sort_by(|a, b| {
                            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        self.manager_for(event.category).set_class_weights(weights);
                    }
                    Err(err) => warn!(%err, "ignored size class weights"),
                }
            }
        }
    }

    /// Idempotent teardown: flush the caches back into their slabs,
    /// release every fully-free slab, and unmap outstanding direct
    /// regions. Blocks still held by callers keep their slabs mapped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let flushed = self.cache.flush_to_slabs();
        let released = self.small.release_unused()
            + self.medium.release_unused()
            + self.large.release_unused()
            + self.direct.release_all();
        info!(flushed, released, "allocator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Periodically release idle slabs until the allocator closes.
pub fn spawn_reaper(allocator: Arc<Allocator>, period: Option<Duration>) -> JoinHandle<()> {
    let period = period.unwrap_or(RECLAIM_PERIOD);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if allocator.is_closed() {
                break;
            }
            allocator.drain_idle(Instant::now());
        }
    })
}

/// Feed tuning events from a hub subscription into the allocator.
pub fn spawn_tuning(allocator: Arc<Allocator>, mut events: EventStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if allocator.is_closed() {
                break;
            }
            allocator.apply_event(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::config::{SizeClassDetail, SizeClassWeight};

    #[test]
    fn test_alloc_bytes_pattern_roundtrip() {
        let allocator = Allocator::new();
        let buf = allocator.alloc_bytes(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8);
        }
        allocator.free(buf).unwrap();
        allocator.close();
    }

    #[test]
    fn test_alloc_zero_fails() {
        let allocator = Allocator::new();
        assert!(matches!(
            allocator.alloc_bytes(0),
            Err(Error::BadArgument(_))
        ));
        allocator.close();
    }

    #[test]
    fn test_typed_helpers_have_requested_length() {
        let allocator = Allocator::new();

        let i32s = allocator.alloc_i32s(100).unwrap();
        assert_eq!(i32s.len(), 100);
        i32s.fill(-7);
        assert!(i32s.iter().all(|&v| v == -7));
        allocator.free(i32s).unwrap();

        let f64s = allocator.alloc_f64s(33).unwrap();
        assert_eq!(f64s.len(), 33);
        f64s.fill(0.5);
        allocator.free(f64s).unwrap();

        let u64s = allocator.alloc_u64s(9).unwrap();
        assert_eq!(u64s.len(), 9);
        allocator.free(u64s).unwrap();

        allocator.close();
    }

    #[test]
    fn test_reuse_after_free_is_tolerated() {
        let allocator = Allocator::new();
        let first = allocator.alloc_bytes(256).unwrap();
        let first_addr = first.as_ptr();
        allocator.free(first).unwrap();

        // With a cold cache the same block usually comes straight back,
        // but either outcome is valid.
        let second = allocator.alloc_bytes(256).unwrap();
        let _maybe_same = second.as_ptr() == first_addr;
        allocator.free(second).unwrap();
        allocator.close();
    }

    #[test]
    fn test_oversize_goes_direct() {
        let allocator = Allocator::new();
        let size = SizeClass::MAX.size() + 1;
        let buf = allocator.alloc_bytes(size).unwrap();
        assert_eq!(buf.len(), size);
        buf[0] = 1;
        buf[size - 1] = 2;
        allocator.free(buf).unwrap();
        allocator.close();
    }

    #[test]
    fn test_stats_record_allocs_and_hits() {
        let allocator = Allocator::new();
        let before = allocator.stats();

        let a = allocator.alloc_bytes(128).unwrap();
        let a_ptr = a.as_mut_ptr();
        allocator.free(a).unwrap();
        // The freed block sits in L1 now; the next allocation hits it.
        let b = allocator.alloc_bytes(128).unwrap();
        assert_eq!(b.as_mut_ptr(), a_ptr);
        allocator.free(b).unwrap();

        let after = allocator.stats();
        // Counters are process-global and other tests run in parallel, so
        // deltas are lower bounds.
        assert!(after.small_allocs - before.small_allocs >= 2);
        assert!(after.small_frees - before.small_frees >= 2);
        assert!(after.cache_hits > before.cache_hits);
        assert!(after.l1_hits > before.l1_hits);
        allocator.close();
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let allocator = Allocator::new();
        let buf = allocator.alloc_bytes(64).unwrap();
        allocator.free(buf).unwrap();
        allocator.close();
        allocator.close();
        assert!(allocator.is_closed());
        assert!(allocator.alloc_bytes(64).is_err());
    }

    #[test]
    fn test_apply_global_event_retunes_shards() {
        let allocator = Allocator::new();
        let event = Event::global_change(GlobalConfig {
            small: 0.8,
            medium: 0.1,
            large: 0.1,
        });
        allocator.apply_event(&event);
        assert!(allocator.small.shards_per_class() >= allocator.medium.shards_per_class());
        allocator.close();
    }

    #[test]
    fn test_apply_size_class_event_sets_weights() {
        let allocator = Allocator::new();
        let details = SizeClassDetail {
            description: "medium".to_string(),
            weights: vec![
                SizeClassWeight {
                    size: 8192,
                    weight: 0.7,
                },
                SizeClassWeight {
                    size: 65536,
                    weight: 0.3,
                },
            ],
        };
        let event = Event::size_class_change(SizeCategory::Medium, details);
        allocator.apply_event(&event);
        assert_eq!(allocator.medium.class_weights(), vec![0.3, 0.7]);
        allocator.close();
    }
}
