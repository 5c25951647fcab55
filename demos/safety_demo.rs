//! Walks through each kind of violation the safety layer detects, then runs
//! a short random workload and prints the final report.
//!
//! Run with `RUST_LOG=warn` (or lower) to see the diagnostics as they are
//! emitted.

use guarded_allocator as guarded;
use guarded_allocator::{safe_string_copy, SafetyConfig, StackGuard};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// Total number of random allocations / frees
const OPERATIONS: usize = 4 * 1024;
// Largest block the random workload asks for
const MAX_SIZE: usize = 4096;

fn scenario(name: &str) {
    println!("\n--- {} ---", name);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [OPERATIONS] [MAX_SIZE]", args[0]);
        return;
    }
    let operations: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(OPERATIONS);
    let max_size: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_SIZE)
        .max(1);

    env_logger::init();
    let ctx = match guarded::init(SafetyConfig::from_env()) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Bad configuration: {}", e);
            std::process::exit(1);
        }
    };
    println!("Running safety demo with {:?}", ctx.config());

    let guard = StackGuard::new();

    scenario("use after free");
    let p = guarded::allocate(40).unwrap().unwrap().as_ptr();
    unsafe { p.write_bytes(0xAB, 40) };
    println!("    valid before free: {}", guarded::validate(p));
    guarded::free(p).unwrap();
    println!("    valid after free:  {}", guarded::validate(p));

    scenario("double free");
    println!("    second free: {:?}", guarded::free(p));

    scenario("buffer overflow");
    let q = guarded::allocate(16).unwrap().unwrap().as_ptr();
    unsafe { q.add(16).write(0) };
    println!("    canaries intact: {}", guarded::check_canaries(q));
    println!("    free: {:?}", guarded::free(q));

    scenario("bounds checking");
    let r = guarded::allocate(10 * 4).unwrap().unwrap().as_ptr();
    for &i in &[0usize, 9, 10] {
        println!("    index {}: {}", i, guarded::bounds_check(r, i, 4));
    }
    match unsafe { ctx.read_element(r as *const u32, 10) } {
        Ok(v) => println!("    read {}", v),
        Err(e) => println!("    read refused: {}", e),
    }
    guarded::free(r).unwrap();

    scenario("string copy");
    let mut dest = [0u8; 8];
    println!(
        "    copy: {:?}, dest untouched: {}",
        safe_string_copy(&mut dest, b"toolong-string\0"),
        dest == [0; 8]
    );

    scenario("pool");
    {
        let mut pool = guarded::create_pool(256).unwrap();
        let mut carved = 0;
        while pool.alloc(48).is_ok() {
            carved += 1;
        }
        println!("    carved {} blocks, {} bytes left", carved, pool.remaining());
    }

    scenario("random workload");
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1usize, max_size);
    let mut live = Vec::new();
    for i in 1..=operations {
        if live.is_empty() || rng.gen_bool(0.55) {
            if let Ok(Some(p)) = guarded::allocate(sizes.sample(&mut rng)) {
                live.push(p);
            }
        } else {
            let ix = rng.gen_range(0, live.len());
            let p = live.swap_remove(ix);
            guarded::free(p.as_ptr()).unwrap();
        }
        if i % 1024 == 0 {
            println!("    step {} / {}: {} live", i, operations, live.len());
        }
    }
    println!(
        "    corrupted blocks: {}",
        guarded::check_all_allocations()
    );
    for p in live {
        guarded::free(p.as_ptr()).unwrap();
    }

    guard.check();
    println!();
    print!("{}", guarded::dump_active_allocations());
    print!("{}", guarded::report());
}
