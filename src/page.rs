//! Page source: anonymous, private page mappings backing every slab.
//!
//! All slab memory originates here. Regions are zero-initialized by the
//! kernel and page-aligned. A process-wide registry of live regions gives
//! best-effort double-unmap detection, since `munmap` of an already
//! unmapped range is not reliably an OS error.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ptr;
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Fixed page size used for internal accounting, regardless of the OS
/// page size.
pub const PAGE_SIZE: usize = 4096;

/// A page-aligned region of anonymous memory.
///
/// Plain value type: copying it does not duplicate the mapping, and the
/// mapping is only released through [`free_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRegion {
    addr: *mut u8,
    len: usize,
}

// A region is just an address range; the registry serializes all
// map/unmap transitions.
unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `ptr` falls inside this region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.addr as usize;
        let p = ptr as usize;
        p >= start && p < start + self.len
    }
}

fn live_regions() -> &'static Mutex<HashMap<usize, usize>> {
    static LIVE: OnceLock<Mutex<HashMap<usize, usize>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn os_page_size() -> usize {
    // _SC_PAGESIZE is positive on every supported platform.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        PAGE_SIZE
    } else {
        sz as usize
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Map `num_pages` zeroed, page-aligned pages of anonymous memory.
pub fn alloc_pages(num_pages: usize) -> Result<PageRegion> {
    if num_pages == 0 {
        return Err(Error::BadArgument(
            "number of pages must be positive".to_string(),
        ));
    }

    let len = num_pages * PAGE_SIZE;
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::OsFailure(last_errno()));
    }

    let addr = addr as *mut u8;
    if addr as usize % os_page_size() != 0 {
        // Should never happen for an mmap result; unmap and report.
        unsafe { libc::munmap(addr.cast(), len) };
        return Err(Error::BadArgument(format!(
            "mapping at {addr:p} is not page-aligned"
        )));
    }

    let mut live = live_regions().lock().unwrap_or_else(|e| e.into_inner());
    live.insert(addr as usize, len);
    drop(live);

    debug!(pages = num_pages, len, addr = ?addr, "mapped region");
    Ok(PageRegion { addr, len })
}

/// Unmap a region previously returned by [`alloc_pages`].
///
/// Rejects null or unaligned addresses and regions that are not currently
/// live (a second free of the same region fails here).
pub fn free_pages(region: PageRegion) -> Result<()> {
    if region.addr.is_null() {
        return Err(Error::BadArgument("null region address".to_string()));
    }
    if region.addr as usize % os_page_size() != 0 {
        return Err(Error::BadArgument(format!(
            "region address {:p} is not page-aligned",
            region.addr
        )));
    }

    {
        let mut live = live_regions().lock().unwrap_or_else(|e| e.into_inner());
        match live.get(&(region.addr as usize)) {
            Some(&len) if len == region.len => {
                live.remove(&(region.addr as usize));
            }
            Some(&len) => {
                return Err(Error::BadArgument(format!(
                    "region length mismatch: mapped {len}, freeing {}",
                    region.len
                )));
            }
            None => {
                return Err(Error::BadArgument(format!(
                    "region {:p} is not a live mapping (double free?)",
                    region.addr
                )));
            }
        }
    }

    let rc = unsafe { libc::munmap(region.addr.cast(), region.len) };
    if rc != 0 {
        return Err(Error::OsFailure(last_errno()));
    }

    debug!(len = region.len, addr = ?region.addr, "unmapped region");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pattern(region: &PageRegion) {
        let buf = unsafe { std::slice::from_raw_parts_mut(region.addr(), region.len()) };
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
    }

    fn verify_pattern(region: &PageRegion) {
        let buf = unsafe { std::slice::from_raw_parts(region.addr(), region.len()) };
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8, "mismatch at byte {i}");
        }
    }

    #[test]
    fn test_alloc_free_single_page() {
        let region = alloc_pages(1).unwrap();
        assert_eq!(region.len(), PAGE_SIZE);
        write_pattern(&region);
        verify_pattern(&region);
        free_pages(region).unwrap();
    }

    #[test]
    fn test_alloc_free_many_pages() {
        let region = alloc_pages(64).unwrap();
        assert_eq!(region.len(), 64 * PAGE_SIZE);
        write_pattern(&region);
        verify_pattern(&region);
        free_pages(region).unwrap();
    }

    #[test]
    fn test_regions_are_zeroed() {
        let region = alloc_pages(2).unwrap();
        let buf = unsafe { std::slice::from_raw_parts(region.addr(), region.len()) };
        assert!(buf.iter().all(|&b| b == 0));
        free_pages(region).unwrap();
    }

    #[test]
    fn test_zero_pages_rejected() {
        assert!(matches!(alloc_pages(0), Err(Error::BadArgument(_))));
    }

    #[test]
    fn test_alignment() {
        let region = alloc_pages(1).unwrap();
        assert_eq!(region.addr() as usize % os_page_size(), 0);
        free_pages(region).unwrap();
    }

    #[test]
    fn test_double_free_rejected() {
        let region = alloc_pages(1).unwrap();
        free_pages(region).unwrap();
        assert!(free_pages(region).is_err());
    }

    #[test]
    fn test_free_unknown_region_rejected() {
        let region = PageRegion {
            addr: (os_page_size() * 16) as *mut u8,
            len: PAGE_SIZE,
        };
        assert!(free_pages(region).is_err());
    }

    #[test]
    fn test_free_null_rejected() {
        let region = PageRegion {
            addr: std::ptr::null_mut(),
            len: PAGE_SIZE,
        };
        assert!(matches!(free_pages(region), Err(Error::BadArgument(_))));
    }

    #[test]
    fn test_free_unaligned_rejected() {
        let region = alloc_pages(1).unwrap();
        let skewed = PageRegion {
            addr: unsafe { region.addr().add(1) },
            len: region.len(),
        };
        assert!(matches!(free_pages(skewed), Err(Error::BadArgument(_))));
        free_pages(region).unwrap();
    }
}
