//! A page-backed slab carved into equal-sized blocks of one size class,
//! with an intrusive free-list threaded through the free blocks.

use crate::error::{Error, Result};
use crate::page::PageRegion;
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Intrusive free-list node embedded in free memory. While a block is in
/// use its contents belong to the caller.
#[repr(C)]
pub(crate) struct Block {
    pub(crate) next: *mut Block,
}

/// A slab owns one page region and hands out fixed-size blocks from it.
///
/// The free-list and counters live behind a short-lived mutex; slabs are
/// reached from shard walks and the L3 cache, each under their own locks,
/// so the inner lock only serializes the list splice itself.
pub struct Slab {
    region: PageRegion,
    block_size: usize,
    total_count: usize,
    inner: Mutex<SlabInner>,
}

struct SlabInner {
    free_head: *mut Block,
    free_count: usize,
    // Stamped when the slab becomes fully free; drives idle reclamation.
    last_free_at: Instant,
}

// Invariant: every block pointer in the free-list stays inside `region`,
// and the region outlives the slab (release is explicit, not on drop).
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Partition `region` into `region.len() / block_size` blocks and
    /// thread them all into the free-list.
    pub fn carve(region: PageRegion, block_size: usize) -> Result<Slab> {
        if block_size < std::mem::size_of::<Block>() {
            return Err(Error::BadArgument(format!(
                "block size {block_size} below minimum {}",
                std::mem::size_of::<Block>()
            )));
        }
        let total_count = region.len() / block_size;
        if total_count == 0 {
            return Err(Error::BadArgument(format!(
                "region of {} bytes cannot hold one {block_size}-byte block",
                region.len()
            )));
        }

        // Thread back-to-front so the list pops in ascending address order.
        let base = region.addr();
        let mut head: *mut Block = ptr::null_mut();
        for i in (0..total_count).rev() {
            let block = unsafe { base.add(i * block_size) } as *mut Block;
            unsafe { (*block).next = head };
            head = block;
        }

        Ok(Slab {
            region,
            block_size,
            total_count,
            inner: Mutex::new(SlabInner {
                free_head: head,
                free_count: total_count,
                last_free_at: Instant::now(),
            }),
        })
    }

    /// Pop the free-list head. Constant time.
    pub fn alloc_block(&self) -> Option<*mut u8> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.free_head.is_null() {
            return None;
        }
        let block = inner.free_head;
        inner.free_head = unsafe { (*block).next };
        inner.free_count -= 1;
        Some(block as *mut u8)
    }

    /// Push a block back onto the free-list. Constant time.
    ///
    /// Rejects pointers outside the slab's range or not aligned to the
    /// block size.
    pub fn free_block(&self, ptr: *mut u8) -> Result<()> {
        if !self.region.contains(ptr) {
            return Err(Error::BadArgument(format!(
                "pointer {ptr:p} outside slab range"
            )));
        }
        let offset = ptr as usize - self.region.addr() as usize;
        if offset % self.block_size != 0 {
            return Err(Error::BadArgument(format!(
                "pointer {ptr:p} not aligned to {}-byte blocks",
                self.block_size
            )));
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let block = ptr as *mut Block;
        unsafe { (*block).next = inner.free_head };
        inner.free_head = block;
        inner.free_count += 1;
        if inner.free_count == self.total_count {
            inner.last_free_at = Instant::now();
        }
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn region(&self) -> PageRegion {
        self.region
    }

    /// Whether `ptr` belongs to this slab's range.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    /// Fully free, with no block handed out since at least `idle_threshold`
    /// before `now`.
    pub fn is_idle(&self, now: Instant, idle_threshold: Duration) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.free_count == self.total_count
            && now.duration_since(inner.last_free_at) >= idle_threshold
    }

    /// Fully free: every block is back on the free-list.
    pub fn is_unused(&self) -> bool {
        self.free_count() == self.total_count
    }
}
