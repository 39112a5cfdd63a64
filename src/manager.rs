//! Size-category managers: own the shards for one category, route
//! allocations by CPU dispersion, steal from siblings on a miss, and
//! reshape the shard pool when tuning weights change.

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::page::{self, PageRegion, PAGE_SIZE};
use crate::shard::Shard;
use crate::size_class::{SizeCategory, SizeClass};
use crate::slab::Slab;
use crate::stats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sibling shards probed after a miss before carving a new slab.
pub const STEAL_LIMIT: usize = 4;
/// Hard ceiling of slabs a single shard may own.
pub const MAX_SLABS_PER_SHARD: usize = 1024;
/// Empty slabs a category keeps around before idle ones are released.
pub const MAX_EMPTY_SLABS: usize = 5;
/// A fully-free slab older than this is eligible for release.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(600);
/// Default period of the idle-slab reaper.
pub const RECLAIM_PERIOD: Duration = Duration::from_secs(300);

/// Smallest region carved into a slab; larger classes get one block per
/// slab.
const SLAB_SPAN_MIN: usize = 64 * 1024;

/// Split the effective core budget between the small and medium
/// categories according to their global weights. Weights summing below
/// 0.01 fall back to an even split.
pub fn calculate_cores(cores: usize, small_weight: f64, medium_weight: f64) -> (usize, usize) {
    let (small_weight, medium_weight, scale) = {
        let scale = small_weight + medium_weight;
        if scale < 0.01 {
            (0.5, 0.5, 1.0)
        } else {
            (small_weight, medium_weight, scale)
        }
    };

    let mut effective = (cores as f64 * scale + 0.5) as usize;
    if effective < 2 {
        effective = 2.min(cores);
    }

    let small_cores = (effective as f64 * (small_weight / scale) + 0.5) as usize;
    let medium_cores = (effective as f64 * (medium_weight / scale) + 0.5) as usize;
    (small_cores, medium_cores)
}

/// Shards per size class for a category that was granted
/// `category_cores` of a `cpu_cores` machine: denser sharding on small
/// boxes, sparser as the core count grows.
pub fn shards_per_class(cpu_cores: usize, category_cores: usize) -> usize {
    let multiplier = match cpu_cores {
        0..=32 => 4,
        33..=64 => 3,
        _ => 2,
    };
    (category_cores * multiplier).max(1)
}

#[cfg(target_os = "linux")]
fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        fallback_cpu()
    } else {
        cpu as usize
    }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> usize {
    fallback_cpu()
}

// Dispersion is what matters, not strict affinity; a per-thread id is an
// acceptable stand-in when the scheduler cannot tell us the CPU.
fn fallback_cpu() -> usize {
    thread_local! {
        static TID: usize = {
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            NEXT.fetch_add(1, Ordering::Relaxed)
        };
    }
    TID.with(|&id| id)
}

fn disperse(cpu: usize, buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    (cpu.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) % buckets
}

fn slab_span(block_size: usize) -> usize {
    let span = block_size.max(SLAB_SPAN_MIN);
    span.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Owns every shard of one size category.
pub struct CategoryManager {
    category: SizeCategory,
    cache: Arc<SystemCache>,
    // One row of shards per class in the category.
    shards: RwLock<Vec<Vec<Arc<Shard>>>>,
    class_weights: RwLock<Vec<f64>>,
    idle_threshold: Duration,
}

impl CategoryManager {
    pub fn new(category: SizeCategory, per_class: usize, cache: Arc<SystemCache>) -> Self {
        let per_class = per_class.max(1);
        let shards = category
            .classes()
            .iter()
            .map(|&class| (0..per_class).map(|_| Arc::new(Shard::new(class))).collect())
            .collect();
        Self {
            category,
            cache,
            shards: RwLock::new(shards),
            class_weights: RwLock::new(Vec::new()),
            idle_threshold: IDLE_THRESHOLD,
        }
    }

    pub fn category(&self) -> SizeCategory {
        self.category
    }

    pub fn shards_per_class(&self) -> usize {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards.first().map_or(0, |row| row.len())
    }

    fn class_pos(&self, class: SizeClass) -> Result<usize> {
        self.category
            .classes()
            .iter()
            .position(|&c| c == class)
            .ok_or_else(|| {
                Error::BadArgument(format!(
                    "class {class} does not belong to the {} category",
                    self.category
                ))
            })
    }

    /// Allocate a block of `class`: chosen shard first, then up to
    /// [`STEAL_LIMIT`] siblings, then a freshly carved slab.
    pub fn alloc(&self, class: SizeClass) -> Result<*mut u8> {
        let pos = self.class_pos(class)?;
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let row = &shards[pos];
        let chosen = disperse(current_cpu(), row.len());

        if let Some(block) = row[chosen].try_alloc() {
            return Ok(block);
        }
        for step in 1..=STEAL_LIMIT.min(row.len().saturating_sub(1)) {
            if let Some(block) = row[(chosen + step) % row.len()].try_alloc() {
                return Ok(block);
            }
        }

        self.carve_into(&row[chosen], class)
    }

    fn carve_into(&self, shard: &Arc<Shard>, class: SizeClass) -> Result<*mut u8> {
        if shard.slab_count() >= MAX_SLABS_PER_SHARD {
            return Err(Error::OutOfMemory(format!(
                "shard for class {class} reached {MAX_SLABS_PER_SHARD} slabs"
            )));
        }

        let span = slab_span(class.size());
        let region = page::alloc_pages(span / PAGE_SIZE)?;
        let slab = Arc::new(Slab::carve(region, class.size())?);
        // The new slab always satisfies at least the triggering request.
        let block = slab
            .alloc_block()
            .ok_or_else(|| Error::OutOfMemory(format!("fresh slab for class {class} is empty")))?;

        shard.add_slab(Arc::clone(&slab));
        self.cache.l3.register_slab(class, slab);
        debug!(%class, span, "carved new slab");
        Ok(block)
    }

    /// Return a block: the dispersion-chosen shard takes it onto its
    /// stacks; when those are full, the slab that owns the pointer gets
    /// it back, wherever it lives in the row. Blocks with no owning slab
    /// in the row (a larger-class block reclassified by an L2 hit) stay
    /// in circulation on the stacks.
    pub fn free(&self, class: SizeClass, block: *mut u8) -> Result<()> {
        let pos = self.class_pos(class)?;
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let row = &shards[pos];
        let chosen = disperse(current_cpu(), row.len());

        if row[chosen].put(block).is_ok() {
            return Ok(());
        }
        for (i, shard) in row.iter().enumerate() {
            if i != chosen && shard.put_to_slab(block).is_ok() {
                return Ok(());
            }
        }
        row[chosen].force_put(block);
        Ok(())
    }

    /// Release idle fully-free slabs beyond the category's empty-slab
    /// budget. Returns the number of slabs handed back to the OS.
    pub fn drain_idle(&self, now: Instant) -> usize {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let mut keep_budget = MAX_EMPTY_SLABS;
        let mut released = 0;
        for row in shards.iter() {
            for shard in row {
                let drained = shard.drain_empty(now, self.idle_threshold, keep_budget);
                keep_budget = keep_budget.saturating_sub(shard.empty_slab_count());
                for slab in drained {
                    self.release_slab(slab);
                    released += 1;
                }
            }
        }
        if released > 0 {
            info!(category = %self.category, released, "released idle slabs");
        }
        released
    }

    fn release_slab(&self, slab: Arc<Slab>) {
        let class = SizeClass::class_of(slab.block_size());
        self.cache.l3.deregister_slab(class, &slab);
        let region = slab.region();
        drop(slab);
        match page::free_pages(region) {
            Ok(()) => stats::record_release(1),
            Err(err) => warn!(%err, "failed to release slab region"),
        }
    }

    /// Resize every class row to `per_class` shards. Growing adds empty
    /// shards; shrinking retires the tail and migrates its blocks and
    /// slabs into the survivors.
    pub fn retune_shards(&self, per_class: usize) {
        let per_class = per_class.max(1);
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        let current = shards.first().map_or(0, |row| row.len());
        if current == per_class {
            return;
        }
        info!(
            category = %self.category,
            from = current,
            to = per_class,
            "retuning shard count"
        );

        for (class_pos, row) in shards.iter_mut().enumerate() {
            let class = self.category.classes()[class_pos];
            if per_class > row.len() {
                while row.len() < per_class {
                    row.push(Arc::new(Shard::new(class)));
                }
                continue;
            }

            let retired = row.split_off(per_class);
            for (i, old) in retired.into_iter().enumerate() {
                let target = &row[i % per_class];
                for block in old.drain_stacks() {
                    target.force_put(block);
                }
                for slab in old.take_slabs() {
                    target.add_slab(slab);
                }
                stats::record_compaction(1);
            }
        }
    }

    /// Replace the per-class weight vector pushed by the tuning pipeline.
    pub fn set_class_weights(&self, weights: Vec<f64>) {
        *self.class_weights.write().unwrap_or_else(|e| e.into_inner()) = weights;
    }

    pub fn class_weights(&self) -> Vec<f64> {
        self.class_weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Hand every fully-free slab back to the OS, ignoring idle age and
    /// the empty-slab budget. Teardown path.
    pub fn release_unused(&self) -> usize {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        let now = Instant::now();
        for row in shards.iter() {
            for shard in row {
                for slab in shard.drain_empty(now, Duration::ZERO, 0) {
                    self.release_slab(slab);
                    released += 1;
                }
            }
        }
        released
    }
}

/// Oversize allocations bypass the class machinery entirely: one page
/// mapping per request, tracked for exact free and best-effort
/// double-free rejection.
pub struct DirectHeap {
    regions: Mutex<HashMap<usize, PageRegion>>,
}

impl DirectHeap {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(Error::BadArgument("size must be positive".to_string()));
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let region = page::alloc_pages(pages)?;
        self.regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(region.addr() as usize, region);
        Ok(region.addr())
    }

    /// Whether `ptr` is the base of a live direct allocation.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(ptr as usize))
    }

    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        let region = self
            .regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(ptr as usize))
            .ok_or_else(|| {
                Error::BadArgument(format!(
                    "pointer {ptr:p} is not a live direct allocation (double free?)"
                ))
            })?;
        page::free_pages(region)
    }

    /// Unmap every outstanding direct region. Teardown path.
    pub fn release_all(&self) -> usize {
        let regions: Vec<PageRegion> = self
            .regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, r)| r)
            .collect();
        let mut released = 0;
        for region in regions {
            if page::free_pages(region).is_ok() {
                released += 1;
            }
        }
        released
    }
}

impl Default for DirectHeap {
    fn default() -> Self {
        Self::new()
    }
}
