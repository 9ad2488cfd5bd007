//! Buffer-pool behavior against the software device.
//!
//! Exercises growth under pressure, shrink hysteresis, zeroing and the
//! bookkeeping invariants through the public pool API only; the software
//! device's map/unmap counters observe segment lifetime from outside.

use std::collections::HashSet;
use std::sync::Arc;

use vpx_driver::sim::SimDevice;
use vpx_driver::{BufferPool, DeviceMemory, PoolConfig, VpxError};

const GROWTH: u32 = 4;

fn make_pool(element_size: usize) -> (Arc<SimDevice>, BufferPool) {
    let dev = Arc::new(SimDevice::new());
    let memory: Arc<dyn DeviceMemory> = dev.clone();
    let pool = BufferPool::new(memory, PoolConfig::new(element_size, GROWTH)).unwrap();
    (dev, pool)
}

#[test]
fn live_handles_never_alias() {
    let (_dev, pool) = make_pool(64);
    let mut live = Vec::new();
    let mut addresses = HashSet::new();

    // Allocate through two growths, free a few, allocate again.
    for _ in 0..(3 * GROWTH) {
        let e = pool.alloc().unwrap();
        assert!(addresses.insert(e.iova()), "aliased element {:#x}", e.iova());
        live.push(e);
    }
    for _ in 0..GROWTH {
        let e = live.swap_remove(1);
        addresses.remove(&e.iova());
        pool.free(e);
    }
    for _ in 0..GROWTH {
        let e = pool.alloc().unwrap();
        assert!(addresses.insert(e.iova()), "aliased element {:#x}", e.iova());
        live.push(e);
    }

    for e in live {
        pool.free(e);
    }
}

#[test]
fn free_total_equals_sum_of_segment_free_counts() {
    let (_dev, pool) = make_pool(32);
    let check = |pool: &BufferPool| {
        let stats = pool.stats();
        assert_eq!(
            stats.free_total,
            stats.per_segment_free.iter().sum::<u32>(),
            "conservation violated: {stats:?}"
        );
    };

    check(&pool);
    let mut live = Vec::new();
    for _ in 0..(2 * GROWTH + 1) {
        live.push(pool.alloc().unwrap());
        check(&pool);
    }
    while let Some(e) = live.pop() {
        pool.free(e);
        check(&pool);
    }
}

#[test]
fn pressure_grows_by_exactly_one_segment() {
    let (dev, pool) = make_pool(64);
    assert_eq!(dev.mapped(), 1);

    let mut live = Vec::new();
    for _ in 0..GROWTH {
        live.push(pool.alloc().unwrap());
    }
    assert_eq!(dev.mapped(), 1, "growth before exhaustion");

    live.push(pool.alloc().unwrap());
    assert_eq!(dev.mapped(), 2, "exactly one new segment");
    assert_eq!(pool.stats().segments, 2);

    for e in live {
        pool.free(e);
    }
}

#[test]
fn empty_segment_survives_below_the_shrink_reserve() {
    let (dev, pool) = make_pool(64);
    let mut live = Vec::new();
    for _ in 0..GROWTH {
        live.push(pool.alloc().unwrap());
    }
    // Exactly growth_increment free elements after these frees: under the
    // 2x reserve, so the (now empty) segment must survive.
    for e in live {
        pool.free(e);
    }
    assert_eq!(pool.stats().segments, 1);
    assert_eq!(pool.free_elements(), GROWTH);
    assert_eq!(dev.unmapped(), 0);
}

#[test]
fn empty_segment_is_destroyed_above_the_shrink_reserve() {
    let (dev, pool) = make_pool(64);

    // Fill three segments, then free one whole segment's worth plus one
    // extra while a second segment drains completely.
    let mut live = Vec::new();
    for _ in 0..(3 * GROWTH) {
        live.push(pool.alloc().unwrap());
    }
    assert_eq!(pool.stats().segments, 3);

    let tail: Vec<_> = live.split_off(2 * GROWTH as usize); // third segment
    for e in live.drain(..GROWTH as usize + 1) {
        pool.free(e); // first segment empties below the reserve, survives
    }
    assert_eq!(pool.stats().segments, 3);
    assert_eq!(pool.free_elements(), GROWTH + 1);

    // Draining the third segment pushes the free count to 2*GROWTH + 1,
    // past the reserve: the segment that just emptied is unmapped.
    for e in tail {
        pool.free(e);
    }
    assert_eq!(pool.stats().segments, 2);
    assert_eq!(dev.unmapped(), 1);
    assert_eq!(pool.free_elements(), GROWTH + 1);

    for e in live {
        pool.free(e);
    }
}

#[test]
fn alloc_zeroed_clears_previous_contents() {
    let (_dev, pool) = make_pool(48);

    let dirty = pool.alloc().unwrap();
    let iova = dirty.iova();
    // SAFETY: the handle owns these len() bytes of the segment mapping.
    unsafe {
        std::ptr::write_bytes(dirty.as_ptr().as_ptr(), 0xA5, dirty.len());
    }
    pool.free(dirty);

    // Lowest-index-first reuse hands back the same element.
    let clean = pool.alloc_zeroed().unwrap();
    assert_eq!(clean.iova(), iova);
    // SAFETY: same bytes, now owned by the new handle.
    let contents = unsafe { std::slice::from_raw_parts(clean.as_ptr().as_ptr(), clean.len()) };
    assert!(contents.iter().all(|&b| b == 0));
    pool.free(clean);
}

#[test]
fn exhausted_memory_surfaces_as_out_of_memory_and_leaves_the_pool_usable() {
    let (dev, pool) = make_pool(64);
    let mut live = Vec::new();
    for _ in 0..GROWTH {
        live.push(pool.alloc().unwrap());
    }

    dev.fail_next_alloc();
    let err = pool.alloc().unwrap_err();
    assert!(matches!(err, VpxError::OutOfMemory { .. }));
    // The failed growth left no partial segment behind.
    assert_eq!(pool.stats().segments, 1);
    assert_eq!(pool.free_elements(), 0);

    // The pool still works once memory is available again.
    live.push(pool.alloc().unwrap());
    assert_eq!(pool.stats().segments, 2);
    for e in live {
        pool.free(e);
    }
}

#[test]
fn dropping_the_pool_releases_every_segment() {
    let (dev, pool) = make_pool(64);
    let a = pool.alloc().unwrap();
    for _ in 0..GROWTH {
        // Force a second segment into existence.
        std::mem::forget(pool.alloc().unwrap());
    }
    assert_eq!(dev.live_mappings(), 2);
    pool.free(a);
    drop(pool);
    assert_eq!(dev.live_mappings(), 0);
}
