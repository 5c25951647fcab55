//! The host allocators the safety layer delegates to.
//!
//! ## [`HostAllocator`](trait.HostAllocator.html)
//!
//! A simple trait interface abstracting over whatever actually hands out
//! memory. The safety layer never manages memory itself; it frames what the
//! host gives it.
//!
//! ## [`SystemHost`](struct.SystemHost.html)
//!
//! Uses the Rust global allocator. This is the default.
//!
//! ## [`LibcHost`](struct.LibcHost.html)
//!
//! Uses `malloc`/`free` from the C runtime. Only available with the
//! `use_libc` feature.
//!
//! ## [`BudgetHost`](struct.BudgetHost.html)
//!
//! Wraps another host and refuses requests beyond a fixed byte budget. It is
//! mainly useful for testing out-of-memory handling.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;

/// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

pub trait HostAllocator {
    type Err: fmt::Debug;

    /// Acquire a block of exactly `size` bytes aligned to `align`.
    ///
    /// # Safety
    ///
    /// `size` must be non-zero and `align` a power of two. The returned
    /// memory must be available and untracked by any other rust code until
    /// it is passed back to [`release`](#tymethod.release).
    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give a block back to the host.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `acquire` on this host with the same `size` and
    /// `align`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

impl<'a, H: HostAllocator> HostAllocator for &'a H {
    type Err = H::Err;

    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err> {
        (**self).acquire(size, align)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        (**self).release(ptr, size, align)
    }
}

/// Delegates to the Rust global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHostError {
    pub size: usize,
    pub align: usize,
}

impl HostAllocator for SystemHost {
    type Err = SystemHostError;

    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err> {
        let err = SystemHostError { size, align };
        let layout = std::alloc::Layout::from_size_align(size, align).map_err(|_| err)?;
        NonNull::new(std::alloc::alloc(layout)).ok_or(err)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = std::alloc::Layout::from_size_align_unchecked(size, align);
        std::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Delegates to `malloc`/`free`.
#[cfg(feature = "use_libc")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHost;

#[cfg(feature = "use_libc")]
impl LibcHost {
    // What malloc guarantees on every platform we care about
    const MALLOC_ALIGN: usize = 16;
}

#[cfg(feature = "use_libc")]
impl HostAllocator for LibcHost {
    type Err = Errno;

    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err> {
        if align <= Self::MALLOC_ALIGN {
            let ptr = libc::malloc(size) as *mut u8;
            return NonNull::new(ptr).ok_or_else(errno::errno);
        }

        let mut out: *mut libc::c_void = core::ptr::null_mut();
        let rc = libc::posix_memalign(&mut out, align, size);
        if rc != 0 {
            return Err(Errno(rc));
        }
        NonNull::new(out as *mut u8).ok_or_else(errno::errno)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize, _align: usize) {
        libc::free(ptr.as_ptr() as *mut libc::c_void)
    }
}

/// A host that only hands out `budget` bytes in total (released bytes are
/// returned to the budget).
#[derive(Debug)]
pub struct BudgetHost<H> {
    inner: H,
    budget: usize,
    used: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetError<E> {
    Exhausted { requested: usize, remaining: usize },
    Inner(E),
}

impl<H> BudgetHost<H> {
    pub fn new(inner: H, budget: usize) -> Self {
        BudgetHost {
            inner,
            budget,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used())
    }
}

impl<H: HostAllocator> HostAllocator for BudgetHost<H> {
    type Err = BudgetError<H::Err>;

    unsafe fn acquire(&self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err> {
        let budget = self.budget;
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(size).filter(|&total| total <= budget)
            });
        if let Err(used) = reserved {
            return Err(BudgetError::Exhausted {
                requested: size,
                remaining: budget.saturating_sub(used),
            });
        }

        self.inner.acquire(size, align).map_err(|e| {
            self.used.fetch_sub(size, Ordering::SeqCst);
            BudgetError::Inner(e)
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.inner.release(ptr, size, align);
        self.used.fetch_sub(size, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn round_up_to_increment() {
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX, 4096), None);
    }

    #[test]
    fn system_host_round_trip() {
        let host = SystemHost;
        unsafe {
            let ptr = host.acquire(64, 16).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 16, 0);
            ptr.as_ptr().write_bytes(0x5A, 64);
            host.release(ptr, 64, 16);
        }
    }

    #[test]
    fn budget_host_refuses_past_budget() {
        let host = BudgetHost::new(SystemHost, 100);
        unsafe {
            let a = host.acquire(64, 16).unwrap();
            assert_eq!(host.used(), 64);
            match host.acquire(64, 16) {
                Err(BudgetError::Exhausted {
                    requested,
                    remaining,
                }) => {
                    assert_eq!(requested, 64);
                    assert_eq!(remaining, 36);
                }
                other => panic!("expected exhaustion, got {:?}", other.map(|p| p.as_ptr())),
            }
            host.release(a, 64, 16);
            assert_eq!(host.remaining(), 100);
            let b = host.acquire(100, 16).unwrap();
            host.release(b, 100, 16);
        }
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn libc_host_round_trip() {
        let host = LibcHost;
        unsafe {
            let ptr = host.acquire(128, 16).unwrap();
            host.release(ptr, 128, 16);
            let big = host.acquire(128, 4096).unwrap();
            assert_eq!(big.as_ptr() as usize % 4096, 0);
            host.release(big, 128, 4096);
        }
    }
}
