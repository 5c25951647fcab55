//! A heap integrity layer.
//!
//! Every block handed out by a [`SafeAllocator`] is framed with canaries,
//! a header and a checksummed footer, and tracked in a registry. Frees are
//! checked for double-free and overflow; freed memory is poisoned and
//! remembered so later access through a dangling pointer can be caught.
//! Detected violations are logged through the [`log`] facade, counted, and
//! returned as [`SafetyError`]s. Only a smashed [`StackGuard`] aborts.
//!
//! The free functions at the crate root work on a process-wide allocator,
//! configured once with [`init`] or lazily from the environment (see
//! [`SafetyConfig::from_env`]). Independent allocators can be built with
//! [`SafeAllocator::with_config`].
//!
//! [`log`]: https://docs.rs/log

use core::ptr::NonNull;

use spin::Once;

pub mod allocator;
pub mod checksum;
pub mod config;
pub mod error;
pub mod freed;
pub mod host;
pub mod pool;
pub mod registry;
pub mod stack;
pub mod stats;
pub mod strings;

pub use crate::allocator::SafeAllocator;
pub use crate::config::SafetyConfig;
pub use crate::error::{Result, SafetyError};
#[cfg(feature = "use_libc")]
pub use crate::host::LibcHost;
pub use crate::host::{BudgetHost, HostAllocator, SystemHost};
pub use crate::pool::SafePool;
pub use crate::registry::{AllocFlags, Validity};
pub use crate::stack::StackGuard;
pub use crate::stats::StatsSnapshot;
pub use crate::strings::{c_str_len, safe_string_concat, safe_string_copy};

static CONTEXT: Once<SafeAllocator> = Once::new();

/// Install the process-wide allocator with `config`.
///
/// Fails with `AlreadyInitialized` if the context exists already, whether
/// from an earlier `init` or a lazy [`context`] call.
pub fn init(config: SafetyConfig) -> Result<&'static SafeAllocator> {
    config.validate()?;
    let mut installed = false;
    let allocator = CONTEXT.call_once(|| {
        installed = true;
        SafeAllocator::from_valid_config(SystemHost, config)
    });
    if !installed {
        return Err(SafetyError::AlreadyInitialized);
    }
    log::debug!("Installed safety context: {:?}", allocator.config());
    Ok(allocator)
}

/// The process-wide allocator, configured from the environment on first
/// use.
pub fn context() -> &'static SafeAllocator {
    CONTEXT.call_once(|| {
        let config = SafetyConfig::from_env();
        match SafeAllocator::with_config(SystemHost, config) {
            Ok(allocator) => allocator,
            Err(e) => {
                log::warn!("Ignoring environment configuration: {}", e);
                SafeAllocator::new()
            }
        }
    })
}

pub fn allocate(size: usize) -> Result<Option<NonNull<u8>>> {
    context().allocate(size)
}

pub fn allocate_zeroed(count: usize, elem_size: usize) -> Result<Option<NonNull<u8>>> {
    context().allocate_zeroed(count, elem_size)
}

pub fn reallocate(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
    context().reallocate(ptr, new_size)
}

pub fn free(ptr: *mut u8) -> Result<()> {
    context().free(ptr)
}

pub fn validate(ptr: *const u8) -> bool {
    context().validate(ptr)
}

pub fn validate_buffer(ptr: *const u8, len: usize) -> bool {
    context().validate_buffer(ptr, len)
}

pub fn detect_corruption(ptr: *const u8) -> bool {
    context().detect_corruption(ptr)
}

pub fn check_canaries(ptr: *const u8) -> bool {
    context().check_canaries(ptr)
}

pub fn bounds_check(ptr: *const u8, index: usize, elem_size: usize) -> bool {
    context().bounds_check(ptr, index, elem_size)
}

/// See [`SafeAllocator::safe_copy`].
///
/// # Safety
///
/// `src` must be valid for reads of `size` bytes.
pub unsafe fn safe_copy(dest: *mut u8, src: *const u8, size: usize) -> Result<()> {
    context().safe_copy(dest, src, size)
}

pub fn is_freed_pointer(ptr: *const u8) -> bool {
    context().is_freed_pointer(ptr)
}

pub fn stats() -> StatsSnapshot {
    context().stats()
}

pub fn report() -> String {
    context().report()
}

pub fn dump_active_allocations() -> String {
    context().dump_active_allocations()
}

pub fn check_all_allocations() -> usize {
    context().check_all_allocations()
}

/// A pool backed by the process-wide allocator.
pub fn create_pool(size: usize) -> Result<SafePool<'static>> {
    SafePool::create(context(), size)
}
