// The process-wide context can only be set up once per process, so
// everything touching it lives in this one test.

use guarded_allocator::{self as guarded, SafetyConfig, SafetyError};

use test_env_log::test;

#[test]
fn global_context_lifecycle() {
    // A rejected configuration installs nothing
    assert!(matches!(
        guarded::init(SafetyConfig::default().with_canary_width(0)),
        Err(SafetyError::InvalidConfig(_))
    ));

    let config = SafetyConfig::default()
        .with_guard_page_size(256)
        .with_canary_width(16);
    let ctx = guarded::init(config.clone()).unwrap();
    assert_eq!(ctx.config(), &config);
    assert_eq!(
        guarded::init(config).err(),
        Some(SafetyError::AlreadyInitialized)
    );
    assert!(core::ptr::eq(ctx, guarded::context()));

    let p = guarded::allocate(40).unwrap().unwrap().as_ptr();
    assert!(guarded::validate(p));
    assert!(guarded::check_canaries(p));
    assert!(guarded::validate_buffer(p, 40));
    assert!(guarded::bounds_check(p, 9, 4));
    assert!(!guarded::bounds_check(p, 10, 4));

    let src = [9u8; 40];
    unsafe { guarded::safe_copy(p, src.as_ptr(), 40) }.unwrap();
    let p = guarded::reallocate(p, 80).unwrap().unwrap().as_ptr();
    assert_eq!(unsafe { *p.add(39) }, 9);

    let z = guarded::allocate_zeroed(10, 4).unwrap().unwrap().as_ptr();
    assert!(guarded::dump_active_allocations().contains("Total active: 2 allocations"));
    assert_eq!(guarded::check_all_allocations(), 0);

    guarded::free(z).unwrap();
    guarded::free(p).unwrap();
    assert!(guarded::is_freed_pointer(p));
    assert!(guarded::detect_corruption(p));
    assert_eq!(guarded::stats().use_after_free_detected, 1);

    {
        let mut pool = guarded::create_pool(128).unwrap();
        pool.alloc(64).unwrap();
    }
    let stats = guarded::stats();
    assert_eq!(stats.active_allocations, 0);
    assert_eq!(stats.double_free_detected, 0);
    assert!(guarded::report().contains("Use-after-free detected:  1"));
}
