use core::mem;
use core::ptr::{self, NonNull};

use log::{debug, error};

use crate::allocator::SafeAllocator;
use crate::checksum::FRONT_CANARY;
use crate::error::{Result, SafetyError};
use crate::host::{HostAllocator, SystemHost};

// Lives inside a safe allocation, so its own frame is checked too.
#[repr(C)]
struct PoolHeader {
    base: *mut u8,
    size: usize,
    used: usize,
    bitmap: *mut u8,
    canary: u64,
}

/// A bump-allocated arena carved from one safe allocation.
///
/// The region, a usage bitmap and the pool header itself are all allocated
/// through the owning [`SafeAllocator`](../allocator/struct.SafeAllocator.html),
/// so they are framed and tracked like any other block. Individual frees are
/// not supported: memory comes back only when the whole pool is destroyed.
pub struct SafePool<'a, H: HostAllocator = SystemHost> {
    allocator: &'a SafeAllocator<H>,
    header: NonNull<PoolHeader>,
}

// Blocks whose size is non-zero come back as `Some`.
fn allocate_block<H: HostAllocator>(allocator: &SafeAllocator<H>, size: usize) -> Result<NonNull<u8>> {
    allocator
        .allocate(size)?
        .ok_or(SafetyError::InvalidSize)
}

impl<'a, H: HostAllocator> SafePool<'a, H> {
    /// Create a pool of `size` bytes.
    pub fn create(allocator: &'a SafeAllocator<H>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SafetyError::InvalidSize);
        }

        let header = allocate_block(allocator, mem::size_of::<PoolHeader>())?;
        let base = match allocate_block(allocator, size) {
            Ok(base) => base,
            Err(e) => {
                let _ = allocator.free(header.as_ptr());
                return Err(e);
            }
        };
        let bitmap = match allocate_block(allocator, size / 8 + 1) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                let _ = allocator.free(base.as_ptr());
                let _ = allocator.free(header.as_ptr());
                return Err(e);
            }
        };

        let header = header.cast::<PoolHeader>();
        // SAFETY: a fresh block of the right size, 16-byte aligned.
        unsafe {
            ptr::write(
                header.as_ptr(),
                PoolHeader {
                    base: base.as_ptr(),
                    size,
                    used: 0,
                    bitmap: bitmap.as_ptr(),
                    canary: FRONT_CANARY,
                },
            );
        }
        debug!("Created pool of {} bytes at {:?}", size, base);
        Ok(SafePool { allocator, header })
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: the header block lives as long as the pool.
        unsafe { self.header.as_ref() }
    }

    /// Carve `size` bytes off the pool.
    ///
    /// The returned memory is zeroed the first time round (the region was
    /// zeroed on allocation) and has no particular alignment.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let addr = self.header.as_ptr() as usize;
        if !self.allocator.validate(self.header.as_ptr() as *const u8)
            || self.header().canary != FRONT_CANARY
        {
            error!("Pool corruption detected at {:#x}", addr);
            return Err(SafetyError::Corruption { addr });
        }

        // SAFETY: validated above; we hold the only reference.
        let header = unsafe { self.header.as_mut() };
        let available = header.size - header.used;
        if size > available {
            debug!(
                "Pool at {:?} exhausted: {} requested, {} available",
                header.base, size, available
            );
            return Err(SafetyError::PoolExhausted {
                requested: size,
                available,
            });
        }

        // SAFETY: used + size <= size, so this stays inside the region.
        let ptr = unsafe { header.base.add(header.used) };
        header.used += size;
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Does nothing: pool memory is reclaimed only by `destroy`.
    pub fn free(&mut self, _ptr: NonNull<u8>) {}

    pub fn capacity(&self) -> usize {
        self.header().size
    }

    pub fn used(&self) -> usize {
        self.header().used
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Return the pool's blocks to the allocator.
    pub fn destroy(self) {
        drop(self)
    }
}

impl<'a, H: HostAllocator> Drop for SafePool<'a, H> {
    fn drop(&mut self) {
        let (base, bitmap) = {
            let header = self.header();
            (header.base, header.bitmap)
        };
        for block in &[bitmap, base, self.header.as_ptr() as *mut u8] {
            if let Err(e) = self.allocator.free(*block) {
                error!("Failed to release pool block {:?}: {}", block, e);
            }
        }
    }
}
