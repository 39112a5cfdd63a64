//! A CPU-local bucket of free blocks for one size class: two lock-free
//! stacks (hot for recent frees, cold for overflow) in front of the
//! shard's page-backed slabs.

use crate::error::{Error, Result};
use crate::size_class::SizeClass;
use crate::slab::{Block, Slab};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Blocks kept on the hot stack before spilling to cold.
pub const HOT_CAPACITY: usize = 64;
/// Blocks kept on the cold stack before handing back to the owning slab.
pub const COLD_CAPACITY: usize = 256;

/// Lock-free LIFO of free blocks (Treiber stack).
///
/// Plain-pointer CAS is sufficient here: blocks are recycled only through
/// their owning slab, and slabs are never unmapped while any of their
/// blocks can still be on a stack (a slab is released only when fully
/// free, which requires every block back on its own free-list).
pub(crate) struct BlockStack {
    top: AtomicPtr<Block>,
    count: AtomicUsize,
}

impl BlockStack {
    pub(crate) fn new() -> Self {
        Self {
            top: AtomicPtr::new(std::ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn push(&self, ptr: *mut u8) {
        let node = ptr as *mut Block;
        let mut head = self.top.load(Ordering::Acquire);
        loop {
            unsafe { (*node).next = head };
            match self
                .top
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(observed) => head = observed,
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<*mut u8> {
        let mut head = self.top.load(Ordering::Acquire);
        while !head.is_null() {
            let next = unsafe { (*head).next };
            match self
                .top
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    return Some(head as *mut u8);
                }
                Err(observed) => head = observed,
            }
        }
        None
    }
}

/// One shard serves exactly one size class.
pub struct Shard {
    class: SizeClass,
    block_size: usize,
    hot: BlockStack,
    cold: BlockStack,
    slabs: Mutex<Vec<Arc<Slab>>>,
}

impl Shard {
    pub fn new(class: SizeClass) -> Self {
        Self {
            class,
            block_size: class.size(),
            hot: BlockStack::new(),
            cold: BlockStack::new(),
            slabs: Mutex::new(Vec::new()),
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pop hot, then cold, then walk the owned slabs for one with a free
    /// block. `None` means the caller must carve a new slab.
    pub fn try_alloc(&self) -> Option<*mut u8> {
        if let Some(ptr) = self.hot.pop() {
            return Some(ptr);
        }
        if let Some(ptr) = self.cold.pop() {
            return Some(ptr);
        }

        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        for slab in slabs.iter() {
            if let Some(ptr) = slab.alloc_block() {
                return Some(ptr);
            }
        }
        None
    }

    /// Return a block: hot stack first, cold on overflow, and when both
    /// are at capacity hand it back to the owning slab.
    ///
    /// Fails when neither stack has room and no owned slab contains the
    /// pointer; the caller then routes it to the sibling that owns it.
    pub fn put(&self, ptr: *mut u8) -> Result<()> {
        if self.hot.len() < HOT_CAPACITY {
            self.hot.push(ptr);
            return Ok(());
        }
        if self.cold.len() < COLD_CAPACITY {
            self.cold.push(ptr);
            return Ok(());
        }
        self.put_to_slab(ptr)
    }

    /// Hand a block directly back to its owning slab, bypassing the
    /// stacks.
    pub fn put_to_slab(&self, ptr: *mut u8) -> Result<()> {
        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        for slab in slabs.iter() {
            if slab.contains(ptr) {
                return slab.free_block(ptr);
            }
        }
        Err(Error::BadArgument(format!(
            "pointer {ptr:p} not owned by any slab of this shard"
        )))
    }

    pub fn add_slab(&self, slab: Arc<Slab>) {
        self.slabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(slab);
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Owned slabs that are currently fully free.
    pub fn empty_slab_count(&self) -> usize {
        self.slabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.is_unused())
            .count()
    }

    /// Free blocks sitting in the stacks (not counting slab free-lists).
    pub fn cached_blocks(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    /// Detach slabs that have been fully free for at least
    /// `idle_threshold`, keeping up to `max_keep` empty slabs in place.
    /// Returned slabs hold no outstanding blocks and are safe to unmap
    /// once deregistered everywhere else.
    pub fn drain_empty(
        &self,
        now: Instant,
        idle_threshold: Duration,
        max_keep: usize,
    ) -> Vec<Arc<Slab>> {
        let mut slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        let mut kept_empty = 0usize;
        let mut drained = Vec::new();
        slabs.retain(|slab| {
            if !slab.is_unused() {
                return true;
            }
            if kept_empty < max_keep || !slab.is_idle(now, idle_threshold) {
                kept_empty += 1;
                return true;
            }
            drained.push(Arc::clone(slab));
            false
        });
        drained
    }

    /// Pop every stacked block and return the raw pointers. Used when a
    /// shard is being retired so its blocks can migrate to a survivor.
    pub fn drain_stacks(&self) -> Vec<*mut u8> {
        let mut blocks = Vec::with_capacity(self.cached_blocks());
        while let Some(ptr) = self.hot.pop() {
            blocks.push(ptr);
        }
        while let Some(ptr) = self.cold.pop() {
            blocks.push(ptr);
        }
        blocks
    }

    /// Move every owned slab out of this shard. Pairs with
    /// [`Shard::drain_stacks`] during retirement.
    pub fn take_slabs(&self) -> Vec<Arc<Slab>> {
        std::mem::take(&mut *self.slabs.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Push a block onto the stacks without capacity limits. Retirement
    /// path only; normal returns go through [`Shard::put`].
    pub fn force_put(&self, ptr: *mut u8) {
        if self.hot.len() < HOT_CAPACITY {
            self.hot.push(ptr);
        } else {
            self.cold.push(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page;

    fn shard_with_slab(class: SizeClass, pages: usize) -> Shard {
        let shard = Shard::new(class);
        let region = page::alloc_pages(pages).unwrap();
        let slab = Slab::carve(region, class.size()).unwrap();
        shard.add_slab(Arc::new(slab));
        shard
    }

    fn release_all(shard: &Shard) {
        for slab in shard.take_slabs() {
            page::free_pages(slab.region()).unwrap();
        }
    }

    #[test]
    fn test_alloc_falls_through_to_slab() {
        let shard = shard_with_slab(SizeClass::B64, 1);
        assert_eq!(shard.cached_blocks(), 0);
        let ptr = shard.try_alloc().unwrap();
        assert!(!ptr.is_null());
        shard.put(ptr).unwrap();
        release_all(&shard);
    }

    #[test]
    fn test_put_prefers_hot_stack() {
        let shard = shard_with_slab(SizeClass::B64, 1);
        let ptr = shard.try_alloc().unwrap();
        shard.put(ptr).unwrap();
        assert_eq!(shard.cached_blocks(), 1);
        // Hot hit returns the same block.
        assert_eq!(shard.try_alloc().unwrap(), ptr);
        shard.put(ptr).unwrap();
        release_all(&shard);
    }

    #[test]
    fn test_overflow_spills_to_cold_then_slab() {
        let shard = shard_with_slab(SizeClass::B8, 1);
        let total = 4096 / 8;
        let blocks: Vec<_> = (0..total).map(|_| shard.try_alloc().unwrap()).collect();
        assert!(shard.try_alloc().is_none());

        for ptr in &blocks {
            shard.put(*ptr).unwrap();
        }
        // HOT + COLD stacked, the rest back on the slab free-list.
        assert_eq!(shard.cached_blocks(), HOT_CAPACITY + COLD_CAPACITY);

        // Everything is reachable again.
        for _ in 0..total {
            assert!(shard.try_alloc().is_some());
        }
        assert!(shard.try_alloc().is_none());
        release_all(&shard);
    }

    #[test]
    fn test_put_rejects_foreign_pointer_on_overflow() {
        let shard = Shard::new(SizeClass::B64);
        let mut local = 0u64;
        // No slabs and empty stacks: the block lands on hot instead.
        assert!(shard.put(&mut local as *mut u64 as *mut u8).is_ok());
        // Direct slab hand-back has nowhere to go.
        let mut other = 0u64;
        assert!(shard.put_to_slab(&mut other as *mut u64 as *mut u8).is_err());
        shard.drain_stacks();
    }

    #[test]
    fn test_drain_empty_keeps_requested_slabs() {
        let shard = Shard::new(SizeClass::K1);
        for _ in 0..3 {
            let region = page::alloc_pages(1).unwrap();
            shard.add_slab(Arc::new(Slab::carve(region, 1024).unwrap()));
        }

        let later = Instant::now() + Duration::from_secs(700);
        let drained = shard.drain_empty(later, Duration::from_secs(600), 1);
        assert_eq!(drained.len(), 2);
        assert_eq!(shard.slab_count(), 1);
        for slab in drained {
            page::free_pages(slab.region()).unwrap();
        }
        release_all(&shard);
    }

    #[test]
    fn test_drain_empty_skips_busy_slabs() {
        let shard = shard_with_slab(SizeClass::B64, 1);
        let ptr = shard.try_alloc().unwrap();

        let later = Instant::now() + Duration::from_secs(700);
        let drained = shard.drain_empty(later, Duration::from_secs(600), 0);
        assert!(drained.is_empty());

        shard.put_to_slab(ptr).unwrap();
        release_all(&shard);
    }

    #[test]
    fn test_concurrent_stack_churn() {
        use std::thread;

        let shard = Arc::new(shard_with_slab(SizeClass::B64, 4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let shard = Arc::clone(&shard);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(ptr) = shard.try_alloc() {
                        unsafe { ptr.write_bytes(0xA5, 64) };
                        shard.put(ptr).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every block is either stacked or back on the slab free-list.
        let stacked = shard.cached_blocks();
        let slabs = shard.take_slabs();
        let on_lists: usize = slabs.iter().map(|s| s.free_count()).sum();
        let total: usize = slabs.iter().map(|s| s.total_count()).sum();
        assert_eq!(stacked + on_lists, total);
        for slab in slabs {
            page::free_pages(slab.region()).unwrap();
        }
    }
}
