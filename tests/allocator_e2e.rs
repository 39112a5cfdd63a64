//! End-to-end allocation scenarios: pattern round-trips, concurrent
//! churn, and reuse behavior through the full cache/shard/slab path.

use slabpool::Allocator;
use std::sync::Arc;
use std::thread;

const PAGE: usize = 4096;

fn write_pattern(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
}

fn verify_pattern(buf: &[u8]) {
    for (i, b) in buf.iter().enumerate() {
        assert_eq!(*b, (i % 256) as u8, "pattern mismatch at byte {i}");
    }
}

#[test]
fn test_single_page_roundtrip() {
    let allocator = Allocator::new();

    let buf = allocator.alloc_bytes(PAGE).expect("page allocation failed");
    assert_eq!(buf.len(), PAGE);
    write_pattern(buf);
    verify_pattern(buf);
    allocator.free(buf).expect("free failed");

    allocator.close();
}

#[test]
fn test_concurrent_alloc_free() {
    const THREADS: usize = 10;
    const ITERATIONS: usize = 100;
    const PAGES: usize = 10;

    let allocator = Arc::new(Allocator::new());
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let allocator = Arc::clone(&allocator);
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                let buf = allocator
                    .alloc_bytes(PAGES * PAGE)
                    .expect("allocation failed");
                write_pattern(buf);
                verify_pattern(buf);
                allocator.free(buf).expect("free failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    let stats = allocator.stats();
    assert!(stats.total_allocs() >= (THREADS * ITERATIONS) as u64);
    assert!(stats.total_frees() >= (THREADS * ITERATIONS) as u64);
    allocator.close();
}

#[test]
fn test_reuse_after_free() {
    let allocator = Allocator::new();

    let first = allocator.alloc_bytes(512).expect("allocation failed");
    let first_addr = first.as_ptr() as usize;
    allocator.free(first).expect("free failed");

    // With a cold cache the second pointer typically equals the first;
    // the test tolerates either outcome.
    let second = allocator.alloc_bytes(512).expect("allocation failed");
    let second_addr = second.as_ptr() as usize;
    write_pattern(second);
    verify_pattern(second);
    allocator.free(second).expect("free failed");

    let _reused = first_addr == second_addr;
    allocator.close();
}

#[test]
fn test_every_class_size_roundtrips() {
    let allocator = Allocator::new();

    // One allocation either side of each power-of-two boundary up to 1MB.
    let mut size = 8usize;
    while size <= 1024 * 1024 {
        for request in [size - 1, size] {
            if request == 0 {
                continue;
            }
            let buf = allocator.alloc_bytes(request).expect("allocation failed");
            assert_eq!(buf.len(), request);
            buf[0] = 0xAB;
            buf[request - 1] = 0xCD;
            assert_eq!(buf[0], 0xAB);
            assert_eq!(buf[request - 1], 0xCD);
            allocator.free(buf).expect("free failed");
        }
        size *= 2;
    }
    allocator.close();
}

#[test]
fn test_typed_views_roundtrip() {
    let allocator = Allocator::new();

    let i64s = allocator.alloc_i64s(1000).expect("allocation failed");
    assert_eq!(i64s.len(), 1000);
    for (i, v) in i64s.iter_mut().enumerate() {
        *v = i as i64 * 3;
    }
    assert_eq!(i64s[999], 2997);
    allocator.free(i64s).expect("free failed");

    let f32s = allocator.alloc_f32s(256).expect("allocation failed");
    f32s.fill(1.25);
    assert!(f32s.iter().all(|&v| v == 1.25));
    allocator.free(f32s).expect("free failed");

    let u32s = allocator.alloc_u32s(7).expect("allocation failed");
    assert_eq!(u32s.len(), 7);
    allocator.free(u32s).expect("free failed");

    allocator.close();
}

#[test]
fn test_oversize_allocation_clean_path() {
    let allocator = Allocator::new();

    // Above the largest class: served directly from page mappings.
    let size = 33 * 1024 * 1024;
    let buf = allocator.alloc_bytes(size).expect("oversize allocation failed");
    assert_eq!(buf.len(), size);
    buf[0] = 0x11;
    buf[size / 2] = 0x22;
    buf[size - 1] = 0x33;
    assert_eq!(buf[size / 2], 0x22);
    allocator.free(buf).expect("oversize free failed");

    allocator.close();
}

#[test]
fn test_hit_rate_reflects_cache_reuse() {
    let allocator = Allocator::new();
    let before = allocator.stats();

    // Prime the cache, then churn the same class.
    for _ in 0..50 {
        let buf = allocator.alloc_bytes(1024).expect("allocation failed");
        allocator.free(buf).expect("free failed");
    }

    let after = allocator.stats();
    assert!(after.cache_hits > before.cache_hits);
    assert!(after.hit_rate > 0.0);
    assert!(after.hit_rate <= 100.0);
    allocator.close();
}
