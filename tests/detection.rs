use core::ptr::NonNull;
use core::slice;

use guarded_allocator::checksum::POISON_BYTE;
use guarded_allocator::{
    safe_string_copy, BudgetHost, HostAllocator, SafeAllocator, SafePool, SafetyConfig,
    SafetyError, SystemHost,
};

use test_env_log::test;

fn allocator() -> SafeAllocator {
    SafeAllocator::with_config(SystemHost, SafetyConfig::default().with_guard_page_size(64))
        .unwrap()
}

#[test]
fn fresh_blocks_validate_and_read_zero() {
    let allocator = allocator();
    for &size in &[1usize, 7, 16, 40, 63, 64, 1000, 5000] {
        let p = allocator.allocate(size).unwrap().unwrap();
        assert!(allocator.validate(p.as_ptr()));
        let bytes = unsafe { slice::from_raw_parts(p.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0), "size {} not zeroed", size);
        allocator.free(p.as_ptr()).unwrap();
    }
}

#[test]
fn zero_size_is_none() {
    let allocator = allocator();
    assert_eq!(allocator.allocate(0), Ok(None));
    assert_eq!(allocator.stats().total_allocations, 0);
}

#[test]
fn double_free_counted_once() {
    let allocator = allocator();
    let p = allocator.allocate(24).unwrap().unwrap().as_ptr();
    allocator.free(p).unwrap();
    let before = allocator.stats();

    assert_eq!(
        allocator.free(p),
        Err(SafetyError::DoubleFree { addr: p as usize })
    );
    let after = allocator.stats();
    assert_eq!(after.double_free_detected, before.double_free_detected + 1);
    assert_eq!(after.total_freed, before.total_freed);
    assert_eq!(after.active_allocations, before.active_allocations);
}

#[test]
fn free_unknown_pointer() {
    let allocator = allocator();
    let mut local = [0u8; 16];
    let p = local.as_mut_ptr();
    assert_eq!(
        allocator.free(p),
        Err(SafetyError::InvalidPointer { addr: p as usize })
    );
    assert_eq!(allocator.stats().corruption_detected, 1);
    assert!(allocator.free(core::ptr::null_mut()).is_ok());
}

#[test]
fn validate_after_free_counts_use_after_free() {
    let allocator = allocator();
    let p = allocator.allocate(32).unwrap().unwrap().as_ptr();
    allocator.free(p).unwrap();

    assert!(!allocator.validate(p));
    assert_eq!(allocator.stats().use_after_free_detected, 1);
    assert!(allocator.is_freed_pointer(p));
    assert!(allocator.detect_corruption(p));
    assert_eq!(allocator.stats().use_after_free_detected, 2);
}

#[test]
fn bounds_check_up_to_the_boundary() {
    let allocator = allocator();
    for &(size, elem) in &[(40usize, 4usize), (10, 4), (1, 1), (64, 8)] {
        let p = allocator.allocate(size).unwrap().unwrap().as_ptr();
        let last = (size - 1) / elem;
        for i in 0..=last + 1 {
            assert_eq!(
                allocator.bounds_check(p, i, elem),
                i * elem < size,
                "size {} elem {} index {}",
                size,
                elem,
                i
            );
        }
        assert!(!allocator.bounds_check(p, usize::MAX, 2));
        allocator.free(p).unwrap();
        assert!(!allocator.bounds_check(p, 0, elem));
    }
    assert_eq!(allocator.stats().violations(), 0);
}

#[test]
fn reallocate_preserves_contents() {
    let allocator = allocator();
    let p = allocator.allocate(20).unwrap().unwrap().as_ptr();
    let pattern: Vec<u8> = (0..20).collect();
    unsafe { p.copy_from_nonoverlapping(pattern.as_ptr(), 20) };

    let q = allocator.reallocate(p, 200).unwrap().unwrap().as_ptr();
    let moved = unsafe { slice::from_raw_parts(q, 200) };
    assert_eq!(&moved[..20], &pattern[..]);
    assert!(moved[20..].iter().all(|&b| b == 0));
    assert!(allocator.validate(q));

    // The old block is gone
    assert!(allocator.is_freed_pointer(p));
    assert!(matches!(
        allocator.free(p),
        Err(SafetyError::DoubleFree { .. })
    ));

    let r = allocator.reallocate(q, 5).unwrap().unwrap().as_ptr();
    assert_eq!(unsafe { slice::from_raw_parts(r, 5) }, &pattern[..5]);
    assert_eq!(allocator.reallocate(r, 0), Ok(None));
    assert_eq!(allocator.live_allocations(), 0);
}

#[test]
fn reallocate_null_and_invalid() {
    let allocator = allocator();
    let p = allocator.reallocate(core::ptr::null_mut(), 8).unwrap().unwrap();
    assert!(allocator.validate(p.as_ptr()));

    let mut local = [0u8; 8];
    let bogus = local.as_mut_ptr();
    assert_eq!(
        allocator.reallocate(bogus, 16),
        Err(SafetyError::InvalidPointer {
            addr: bogus as usize
        })
    );
    assert_eq!(allocator.stats().corruption_detected, 1);

    unsafe { *p.as_ptr().add(8) = 0 };
    assert_eq!(
        allocator.reallocate(p.as_ptr(), 16),
        Err(SafetyError::Corruption {
            addr: p.as_ptr() as usize
        })
    );
    assert_eq!(allocator.live_allocations(), 1);

    let q = allocator.allocate(8).unwrap().unwrap().as_ptr();
    allocator.free(q).unwrap();
    assert_eq!(
        allocator.reallocate(q, 16),
        Err(SafetyError::UseAfterFree { addr: q as usize })
    );
    assert_eq!(allocator.stats().use_after_free_detected, 1);
}

#[test]
fn overlapping_copy_moves() {
    let allocator = allocator();
    let p = allocator.allocate(16).unwrap().unwrap().as_ptr();
    let init: Vec<u8> = (1..=16).collect();
    unsafe { p.copy_from_nonoverlapping(init.as_ptr(), 16) };

    // Shift bytes 2..12 down to the start of the same block
    unsafe { allocator.safe_copy(p, p.add(2), 10) }.unwrap();
    let mut expected = init.clone();
    expected.copy_within(2..12, 0);
    assert_eq!(unsafe { slice::from_raw_parts(p, 16) }, &expected[..]);
    assert!(allocator.check_canaries(p));

    // The interior of a block is not a valid destination
    assert!(unsafe { allocator.safe_copy(p.add(4), p, 10) }.is_err());
    assert_eq!(unsafe { slice::from_raw_parts(p, 16) }, &expected[..]);
}

#[test]
fn forward_overlap_matches_memmove() {
    let allocator = allocator();
    let p = allocator.allocate(32).unwrap().unwrap().as_ptr();
    let dest = allocator.allocate(32).unwrap().unwrap().as_ptr();
    let init: Vec<u8> = (0..32).collect();
    unsafe { p.copy_from_nonoverlapping(init.as_ptr(), 32) };

    unsafe { allocator.safe_copy(dest, p, 32) }.unwrap();
    assert_eq!(unsafe { slice::from_raw_parts(dest, 32) }, &init[..]);
    assert_eq!(
        unsafe { allocator.safe_copy(dest, p, 33) },
        Err(SafetyError::Overflow {
            needed: 33,
            capacity: 32
        })
    );
    assert_eq!(
        unsafe { allocator.safe_copy(core::ptr::null_mut(), p, 1) },
        Err(SafetyError::NullArgument)
    );
}

#[test]
fn smashed_rear_canary_is_leaked() {
    let allocator = allocator();
    let p = allocator.allocate(40).unwrap().unwrap().as_ptr();
    assert!(allocator.check_canaries(p));

    // One byte past the end lands in the rear canary zone
    unsafe { *p.add(40) = 0x00 };
    assert!(!allocator.check_canaries(p));

    let active = allocator.stats().active_allocations;
    assert_eq!(
        allocator.free(p),
        Err(SafetyError::BufferOverflow {
            addr: p as usize,
            size: 40
        })
    );
    let stats = allocator.stats();
    assert_eq!(stats.buffer_overflow_detected, 1);
    assert_eq!(stats.active_allocations, active);
    assert_eq!(allocator.live_allocations(), 1);
    assert_eq!(allocator.check_all_allocations(), 1);
    assert!(allocator.dump_active_allocations().contains("(size: 40 bytes)"));
}

#[test]
fn write_40_bytes_then_free() {
    let allocator = allocator();
    let p = allocator.allocate(40).unwrap().unwrap().as_ptr();
    unsafe { p.write_bytes(0xAB, 40) };
    assert!(allocator.validate(p));

    allocator.free(p).unwrap();
    assert!(!allocator.validate(p));
    assert_eq!(allocator.stats().use_after_free_detected, 1);
}

// Never gives memory back, so freed blocks stay readable.
struct HoldingHost;

impl HostAllocator for HoldingHost {
    type Err = ();

    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, ()> {
        SystemHost.acquire(size, align).map_err(|_| ())
    }

    unsafe fn release(&self, _ptr: NonNull<u8>, _size: usize, _align: usize) {}
}

#[test]
fn freed_memory_is_poisoned() {
    let allocator =
        SafeAllocator::with_config(HoldingHost, SafetyConfig::default().with_guard_page_size(64))
            .unwrap();
    let p = allocator.allocate(16).unwrap().unwrap().as_ptr();
    unsafe { p.write_bytes(0x42, 16) };

    allocator.free(p).unwrap();
    assert!(allocator.is_freed_pointer(p));
    let bytes = unsafe { slice::from_raw_parts(p, 16) };
    assert!(bytes.iter().all(|&b| b == POISON_BYTE));
}

#[test]
fn toolong_string_leaves_dest_unmodified() {
    let mut dest = [0x5Au8; 8];
    assert_eq!(
        safe_string_copy(&mut dest, b"toolong-string\0"),
        Err(SafetyError::Overflow {
            needed: 15,
            capacity: 8
        })
    );
    assert_eq!(dest, [0x5A; 8]);
}

#[test]
fn out_of_memory_leaves_no_state() {
    let host = BudgetHost::new(SystemHost, 256);
    let allocator =
        SafeAllocator::with_config(&host, SafetyConfig::default().with_guard_page_size(64))
            .unwrap();
    assert_eq!(
        allocator.allocate(1024),
        Err(SafetyError::OutOfMemory { size: 1024 })
    );
    assert_eq!(allocator.stats().total_allocations, 0);
    assert_eq!(allocator.live_allocations(), 0);
    assert_eq!(host.used(), 0);

    assert_eq!(
        allocator.allocate_zeroed(usize::MAX / 2, 3),
        Err(SafetyError::OutOfMemory { size: usize::MAX })
    );
    let p = allocator.allocate_zeroed(4, 8).unwrap().unwrap();
    assert!(allocator.validate_buffer(p.as_ptr(), 32));
    assert!(!allocator.validate_buffer(p.as_ptr(), 33));
    allocator.free(p.as_ptr()).unwrap();
}

#[test]
fn pool_destroy_restores_active_count() {
    let allocator = allocator();
    let before = allocator.stats().active_allocations;
    {
        let mut pool = SafePool::create(&allocator, 64).unwrap();
        assert_eq!(allocator.stats().active_allocations, before + 3);
        let a = pool.alloc(32).unwrap();
        unsafe { a.as_ptr().write_bytes(0xCC, 32) };
        assert!(pool.alloc(33).is_err());
    }
    assert_eq!(allocator.stats().active_allocations, before);
    assert_eq!(allocator.stats().violations(), 0);
}

#[test]
fn disabled_mode_is_passthrough() {
    let allocator = SafeAllocator::with_config(SystemHost, SafetyConfig::disabled()).unwrap();
    let p = allocator.allocate(24).unwrap().unwrap().as_ptr();
    unsafe { p.write_bytes(7, 24) };
    assert!(allocator.validate(p));
    assert!(allocator.check_canaries(p));
    assert!(allocator.bounds_check(p, 1000, 8));

    let q = allocator.reallocate(p, 48).unwrap().unwrap().as_ptr();
    assert_eq!(unsafe { slice::from_raw_parts(q, 24) }, &[7u8; 24][..]);
    allocator.free(q).unwrap();

    let stats = allocator.stats();
    assert_eq!(stats.total_allocations, 0);
    assert_eq!(stats.violations(), 0);
    assert_eq!(allocator.live_allocations(), 0);
    assert!(!allocator.validate(core::ptr::null()));
}

#[test]
fn disabled_mode_refuses_unknown_pointers() {
    let allocator = SafeAllocator::with_config(SystemHost, SafetyConfig::disabled()).unwrap();
    let p = allocator.allocate(16).unwrap().unwrap().as_ptr();
    allocator.free(p).unwrap();
    assert_eq!(
        allocator.free(p),
        Err(SafetyError::InvalidPointer { addr: p as usize })
    );
    assert!(matches!(
        allocator.reallocate(p, 32),
        Err(SafetyError::InvalidPointer { .. })
    ));

    let mut local = [0u8; 16];
    assert!(matches!(
        allocator.free(local.as_mut_ptr()),
        Err(SafetyError::InvalidPointer { .. })
    ));

    // A live block survives a refused call on another pointer.
    let q = allocator.allocate(8).unwrap().unwrap().as_ptr();
    unsafe { q.write_bytes(3, 8) };
    assert!(allocator.reallocate(local.as_mut_ptr(), 8).is_err());
    let r = allocator.reallocate(q, 4).unwrap().unwrap().as_ptr();
    assert_eq!(unsafe { slice::from_raw_parts(r, 4) }, &[3u8; 4][..]);
    allocator.free(r).unwrap();
    assert!(allocator.free(q).is_err());
}

#[test]
fn reset_keeps_active_count() {
    let allocator = allocator();
    let p = allocator.allocate(8).unwrap().unwrap().as_ptr();
    allocator.free(p).unwrap();
    let _ = allocator.free(p);
    let q = allocator.allocate(8).unwrap().unwrap();

    allocator.reset_stats();
    let stats = allocator.stats();
    assert_eq!(stats.violations(), 0);
    assert_eq!(stats.total_allocations, 0);
    assert_eq!(stats.active_allocations, 1);
    assert!(allocator.report().starts_with("=== MEMORY SAFETY REPORT ==="));
    allocator.free(q.as_ptr()).unwrap();
}
