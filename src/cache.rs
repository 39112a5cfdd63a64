//! Three-tier free-block cache consulted before any shard is touched.
//!
//! L1 is a per-class lock-free stack of block pointers, padded to avoid
//! false sharing. L2 is a single mutex-guarded LIFO accepting any class.
//! L3 indexes slabs that still have free blocks, per class. L2 and L3 are
//! off the hot path.

use crate::shard::BlockStack;
use crate::size_class::{SizeClass, NUM_SIZE_CLASSES};
use crate::slab::Slab;
use crate::stats::CacheTier;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Blocks kept per size class in L1.
pub const L1_SLOTS: usize = 128;
/// Entries in the shared L2 buffer.
pub const L2_SLOTS: usize = 1024;

const CACHE_LINE: usize = 128;

/// One L1 class row: a bounded lock-free stack of free blocks with its
/// fill counter, aligned so neighbouring classes never share a cache
/// line. The blocks themselves carry the links, same discipline as the
/// shard stacks.
#[repr(align(128))]
struct L1Row {
    stack: BlockStack,
}

const _: () = assert!(std::mem::align_of::<L1Row>() == CACHE_LINE);

pub struct L1Cache {
    rows: Box<[L1Row]>,
}

impl L1Cache {
    fn new() -> Self {
        let rows = (0..NUM_SIZE_CLASSES)
            .map(|_| L1Row {
                stack: BlockStack::new(),
            })
            .collect();
        Self { rows }
    }

    /// Succeeds iff the class row is below capacity. The capacity check
    /// and the push are not one atomic step, so the row can transiently
    /// overshoot by the number of racing producers; the bound is a
    /// working-set target, not a safety limit.
    pub fn try_put(&self, class: SizeClass, block: *mut u8) -> bool {
        let row = &self.rows[class.index()];
        if row.stack.len() >= L1_SLOTS {
            return false;
        }
        row.stack.push(block);
        true
    }

    pub fn try_alloc(&self, class: SizeClass) -> Option<*mut u8> {
        self.rows[class.index()].stack.pop()
    }

    pub fn len(&self, class: SizeClass) -> usize {
        self.rows[class.index()].stack.len()
    }
}

#[derive(Clone, Copy)]
struct L2Entry {
    block: *mut u8,
    class: SizeClass,
}

// Entries are raw block pointers owned by slabs; the mutex serializes
// every touch.
unsafe impl Send for L2Entry {}

/// Shared overflow LIFO. Takes any class; allocation scans from the top
/// for the first block large enough.
pub struct L2Cache {
    entries: Mutex<Vec<L2Entry>>,
}

impl L2Cache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(L2_SLOTS)),
        }
    }

    pub fn try_put(&self, class: SizeClass, block: *mut u8) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= L2_SLOTS {
            return false;
        }
        entries.push(L2Entry { block, class });
        true
    }

    /// First entry from the top whose class covers the request.
    pub fn try_alloc(&self, class: SizeClass) -> Option<(*mut u8, SizeClass)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for i in (0..entries.len()).rev() {
            if entries[i].class >= class {
                let entry = entries.remove(i);
                return Some((entry.block, entry.class));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Empty the buffer and return everything. Used when flushing the
    /// cache back into the slabs at shutdown.
    pub(crate) fn drain(&self) -> Vec<(*mut u8, SizeClass)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.drain(..).map(|e| (e.block, e.class)).collect()
    }
}

/// Registry of slabs that still have free blocks, per class. Last resort
/// before the category managers.
pub struct L3Cache {
    slabs: Mutex<HashMap<SizeClass, Vec<Arc<Slab>>>>,
}

impl L3Cache {
    fn new() -> Self {
        Self {
            slabs: Mutex::new(HashMap::new()),
        }
    }

    /// First registered slab of the class with a free block.
    pub fn try_alloc(&self, class: SizeClass) -> Option<*mut u8> {
        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        let list = slabs.get(&class)?;
        for slab in list {
            if slab.free_count() > 0 {
                if let Some(block) = slab.alloc_block() {
                    return Some(block);
                }
            }
        }
        None
    }

    /// Return a block to the registered slab of its class that owns it;
    /// fails when no registered slab contains the pointer.
    pub fn try_put(&self, class: SizeClass, block: *mut u8) -> bool {
        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = slabs.get(&class) else {
            return false;
        };
        for slab in list {
            if slab.contains(block) {
                return slab.free_block(block).is_ok();
            }
        }
        false
    }

    pub fn register_slab(&self, class: SizeClass, slab: Arc<Slab>) {
        self.slabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(class)
            .or_default()
            .push(slab);
    }

    pub fn deregister_slab(&self, class: SizeClass, slab: &Arc<Slab>) {
        let mut slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = slabs.get_mut(&class) {
            list.retain(|s| !Arc::ptr_eq(s, slab));
        }
    }

    pub fn registered(&self, class: SizeClass) -> usize {
        self.slabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&class)
            .map_or(0, |l| l.len())
    }
}

/// The tiered cache as one unit: L1 then L2 then L3.
pub struct SystemCache {
    pub l1: L1Cache,
    pub l2: L2Cache,
    pub l3: L3Cache,
}

impl SystemCache {
    pub fn new() -> Self {
        Self {
            l1: L1Cache::new(),
            l2: L2Cache::new(),
            l3: L3Cache::new(),
        }
    }

    /// Query each tier in order; the winning tier is reported for
    /// statistics.
    pub fn try_alloc(&self, size: usize) -> Option<(*mut u8, CacheTier)> {
        let class = SizeClass::class_of(size);
        if let Some(block) = self.l1.try_alloc(class) {
            return Some((block, CacheTier::L1));
        }
        if let Some((block, _)) = self.l2.try_alloc(class) {
            return Some((block, CacheTier::L2));
        }
        if let Some(block) = self.l3.try_alloc(class) {
            return Some((block, CacheTier::L3));
        }
        None
    }

    /// Offer a freed block to each tier in order; the first tier with
    /// room keeps it.
    pub fn try_put(&self, class: SizeClass, block: *mut u8) -> bool {
        if self.l1.try_put(class, block) {
            return true;
        }
        if self.l2.try_put(class, block) {
            return true;
        }
        self.l3.try_put(class, block)
    }

    /// Move every L1/L2 block back into the slabs registered with L3.
    /// Returns the number of blocks that found their slab.
    pub(crate) fn flush_to_slabs(&self) -> usize {
        let mut flushed = 0;
        for &class in SizeClass::all() {
            while let Some(block) = self.l1.try_alloc(class) {
                if self.l3.try_put(class, block) {
                    flushed += 1;
                }
            }
        }
        for (block, class) in self.l2.drain() {
            if self.l3.try_put(class, block) {
                flushed += 1;
            }
        }
        flushed
    }
}

impl Default for SystemCache {
    fn default() -> Self {
        Self::new()
    }
}
