//! The safe allocator facade.
//!
//! ## Frame layout
//!
//! Every block handed out is framed inside a larger host allocation:
//!
//! ```text
//!   original                       user pointer (16-byte aligned)
//!   │                              │
//!   ▼                              ▼
//!   ┌──────────────┬──────────────┬──────────────────┬─────────────┬─────────┬─────────┐
//!   │ Allocation-  │ front canary │ user data        │ rear canary │ footer  │ padding │
//!   │ Header (32B) │ zone         │ (size bytes)     │ zone        │ trailer │         │
//!   └──────────────┴──────────────┴──────────────────┴─────────────┴─────────┴─────────┘
//!                                                                            ▲
//!                                           block rounded up to guard_page_size
//! ```
//!
//! The header and trailer are invisible to the caller. The registry keeps an
//! out-of-band copy of everything needed to find them again, so nothing read
//! from the frame is trusted for lookup.

use core::fmt;
use core::mem;
use core::panic::Location;
use core::ptr::{self, NonNull};
use core::slice;
use std::collections::HashSet;
use std::fmt::Write;

use log::{debug, error, info, trace, warn};
use spin::Mutex;
use static_assertions::const_assert;

use crate::checksum::{self, FOOTER_MAGIC, FRONT_CANARY, HEADER_MAGIC, REAR_CANARY};
use crate::config::SafetyConfig;
use crate::error::{Result, SafetyError};
use crate::freed::FreedCache;
use crate::host::{round_up, HostAllocator, SystemHost};
use crate::registry::{AllocFlags, AllocationRecord, Registry, SlotId, Ticket, Validity};
use crate::stats::{SafetyStats, StatsSnapshot};

/// In-band header at the start of every host block.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(16))]
struct AllocationHeader {
    size: usize,
    original: usize,
    block_size: usize,
    magic: u32,
    flags: u32,
    // Explicit, so no byte of the header is uninitialized.
    _pad: [u8; HEADER_PAD],
}

const HEADER_FIELDS: usize = 3 * mem::size_of::<usize>() + 8;
const HEADER_PAD: usize = (16 - HEADER_FIELDS % 16) % 16;

/// Trailer after the rear canary zone. It usually lands unaligned, so it
/// is only ever accessed with unaligned reads and writes.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct FooterTrailer {
    magic: u32,
    checksum: u32,
}

/// Alignment of host blocks and of user pointers.
const HEADER_ALIGN: usize = 16;
const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();
const TRAILER_SIZE: usize = mem::size_of::<FooterTrailer>();

// The header must keep the user pointer aligned, and must have no padding
// since its bytes are digested.
const_assert!(HEADER_SIZE % HEADER_ALIGN == 0);
const_assert!(HEADER_SIZE == HEADER_FIELDS + HEADER_PAD);
const_assert!(TRAILER_SIZE == 8);

// Passthrough blocks keep their size in a prefix word.
const PASSTHROUGH_PREFIX: usize = 16;
const_assert!(PASSTHROUGH_PREFIX >= mem::size_of::<usize>());

/// Offsets of each part of a frame, relative to the host block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Frame {
    data_offset: usize,
    size: usize,
    canary_width: usize,
    block_size: usize,
}

impl Frame {
    /// Lay out a frame for `size` user bytes, or `None` if the sizes
    /// overflow.
    fn plan(size: usize, canary_width: usize, guard_page_size: usize) -> Option<Frame> {
        let data_offset = round_up(HEADER_SIZE.checked_add(canary_width)?, HEADER_ALIGN)?;
        let total = data_offset
            .checked_add(size)?
            .checked_add(canary_width)?
            .checked_add(TRAILER_SIZE)?;
        let block_size = round_up(total, guard_page_size)?;
        Some(Frame {
            data_offset,
            size,
            canary_width,
            block_size,
        })
    }

    /// The frame of an existing allocation, from its out-of-band record.
    fn of(record: &AllocationRecord, canary_width: usize) -> Frame {
        Frame {
            data_offset: record.user - record.original,
            size: record.size,
            canary_width,
            block_size: record.block_size,
        }
    }

    fn rear_offset(&self) -> usize {
        self.data_offset + self.size
    }

    fn trailer_offset(&self) -> usize {
        self.rear_offset() + self.canary_width
    }

    /// Write header, canaries and trailer, and zero the user region.
    ///
    /// # Safety
    ///
    /// `base` must point to `block_size` writable bytes aligned to
    /// `HEADER_ALIGN`.
    unsafe fn write(&self, base: *mut u8, flags: AllocFlags) {
        let header = AllocationHeader {
            size: self.size,
            original: base as usize,
            block_size: self.block_size,
            magic: HEADER_MAGIC,
            flags: flags.bits(),
            _pad: [0; HEADER_PAD],
        };
        ptr::write(base as *mut AllocationHeader, header);

        let front = slice::from_raw_parts_mut(base.add(HEADER_SIZE), self.data_offset - HEADER_SIZE);
        checksum::fill_canary(front, FRONT_CANARY);

        ptr::write_bytes(base.add(self.data_offset), 0, self.size);

        let rear = slice::from_raw_parts_mut(base.add(self.rear_offset()), self.canary_width);
        checksum::fill_canary(rear, REAR_CANARY);

        let trailer = FooterTrailer {
            magic: FOOTER_MAGIC,
            checksum: checksum::digest(slice::from_raw_parts(base, HEADER_SIZE)),
        };
        ptr::write_unaligned(base.add(self.trailer_offset()) as *mut FooterTrailer, trailer);
    }

    /// Check canaries, footer magic and the header checksum.
    ///
    /// # Safety
    ///
    /// `base` must be the live host block this frame was written into.
    unsafe fn check(&self, base: *const u8) -> core::result::Result<(), FrameFault> {
        let front = slice::from_raw_parts(base.add(HEADER_SIZE), self.data_offset - HEADER_SIZE);
        if let Some(offset) = checksum::find_canary_mismatch(front, FRONT_CANARY) {
            return Err(FrameFault::FrontCanary {
                distance: front.len() - offset,
            });
        }

        let rear = slice::from_raw_parts(base.add(self.rear_offset()), self.canary_width);
        if let Some(offset) = checksum::find_canary_mismatch(rear, REAR_CANARY) {
            return Err(FrameFault::RearCanary { offset });
        }

        let trailer = ptr::read_unaligned(base.add(self.trailer_offset()) as *const FooterTrailer);
        if trailer.magic != FOOTER_MAGIC {
            return Err(FrameFault::FooterMagic);
        }
        if trailer.checksum != checksum::digest(slice::from_raw_parts(base, HEADER_SIZE)) {
            return Err(FrameFault::Checksum);
        }
        Ok(())
    }
}

/// Which part of a frame failed its check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameFault {
    /// `distance` bytes before the user pointer.
    FrontCanary { distance: usize },
    /// `offset` bytes past the end of user data.
    RearCanary { offset: usize },
    FooterMagic,
    Checksum,
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FrameFault::FrontCanary { distance } => {
                write!(f, "front canary smashed {} bytes before the block", distance)
            }
            FrameFault::RearCanary { offset } => {
                write!(f, "rear canary smashed {} bytes past the end", offset)
            }
            FrameFault::FooterMagic => write!(f, "footer magic overwritten"),
            FrameFault::Checksum => write!(f, "header checksum mismatch"),
        }
    }
}

/// A host block waiting to be released once the lock is dropped.
struct HostBlock {
    ptr: NonNull<u8>,
    size: usize,
}

/// A framed block that is written but not yet registered.
struct FreshBlock {
    base: NonNull<u8>,
    frame: Frame,
}

impl FreshBlock {
    fn user(&self) -> NonNull<u8> {
        // SAFETY: data_offset lies inside the block.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.frame.data_offset)) }
    }

    fn record(&self) -> AllocationRecord {
        AllocationRecord {
            user: self.user().as_ptr() as usize,
            original: self.base.as_ptr() as usize,
            size: self.frame.size,
            block_size: self.frame.block_size,
            flags: fresh_flags(),
        }
    }
}

fn fresh_flags() -> AllocFlags {
    AllocFlags::ACTIVE | AllocFlags::TRACKED | AllocFlags::ZEROED
}

/// Registry and freed cache, guarded together by one lock.
struct TrackerState {
    registry: Registry,
    freed: FreedCache,
    /// User addresses handed out while the safety layer is disabled.
    passthrough: HashSet<usize>,
}

/// A safety layer over a host allocator.
///
/// Every block is framed with canaries and registered; frees are checked
/// for double-free and overflow, poisoned, and remembered for use-after-free
/// detection. Detected violations are logged through `log::error!`,
/// counted, and returned as [`SafetyError`](../error/enum.SafetyError.html);
/// nothing here panics or aborts.
///
/// Dropping a `SafeAllocator` reports any blocks still live as leaks and
/// leaves them allocated.
pub struct SafeAllocator<H = SystemHost> {
    host: H,
    config: SafetyConfig,
    state: Mutex<TrackerState>,
    stats: SafetyStats,
}

impl SafeAllocator<SystemHost> {
    /// A safety layer over the Rust global allocator with default settings.
    pub fn new() -> Self {
        SafeAllocator::from_valid_config(SystemHost, SafetyConfig::default())
    }
}

impl Default for SafeAllocator<SystemHost> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HostAllocator> SafeAllocator<H> {
    /// A safety layer over `host` with default settings.
    pub fn with_host(host: H) -> Self {
        SafeAllocator::from_valid_config(host, SafetyConfig::default())
    }

    /// A safety layer over `host`, checking `config` first.
    pub fn with_config(host: H, config: SafetyConfig) -> Result<Self> {
        config.validate()?;
        Ok(SafeAllocator::from_valid_config(host, config))
    }

    pub(crate) fn from_valid_config(host: H, config: SafetyConfig) -> Self {
        SafeAllocator {
            state: Mutex::new(TrackerState {
                registry: Registry::new(config.retired_capacity),
                freed: FreedCache::new(config.freed_cache_capacity),
                passthrough: HashSet::new(),
            }),
            host,
            config,
            stats: SafetyStats::new(),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate `size` zeroed bytes.
    ///
    /// Returns `Ok(None)` for a zero size. A host failure is
    /// `Err(OutOfMemory)` and leaves nothing registered.
    pub fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        if !self.config.enabled {
            return self.passthrough_allocate(size).map(Some);
        }

        let fresh = self.acquire_frame(size)?;
        let user = self.register(&mut self.state.lock(), &fresh);
        trace!(
            "Allocated {} bytes at {:?} (block {:?}:{})",
            size,
            user,
            fresh.base,
            fresh.frame.block_size
        );
        Ok(Some(user))
    }

    // Get a block from the host and write its frame. Nothing is registered,
    // so a failure leaves no state behind.
    fn acquire_frame(&self, size: usize) -> Result<FreshBlock> {
        let frame = match Frame::plan(size, self.config.canary_width, self.config.guard_page_size)
        {
            Some(f) => f,
            None => {
                error!("allocation of {} bytes overflows the frame size", size);
                return Err(SafetyError::OutOfMemory { size });
            }
        };

        let base = match unsafe { self.host.acquire(frame.block_size, HEADER_ALIGN) } {
            Ok(base) => base,
            Err(e) => {
                error!("host allocator failed to provide {} bytes: {:?}", frame.block_size, e);
                return Err(SafetyError::OutOfMemory { size });
            }
        };

        // SAFETY: the host just gave us block_size bytes aligned to HEADER_ALIGN.
        unsafe { frame.write(base.as_ptr(), fresh_flags()) };
        Ok(FreshBlock { base, frame })
    }

    fn register(&self, state: &mut TrackerState, fresh: &FreshBlock) -> NonNull<u8> {
        state.registry.insert(fresh.record());
        self.stats.record_allocation(fresh.frame.size);
        fresh.user()
    }

    /// Allocate `count` zeroed elements of `elem_size` bytes each.
    ///
    /// A product that overflows `usize` is `Err(OutOfMemory)` and never
    /// reaches the host.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<Option<NonNull<u8>>> {
        match count.checked_mul(elem_size) {
            Some(size) => self.allocate(size),
            None => {
                error!("allocation of {} x {} bytes overflows", count, elem_size);
                Err(SafetyError::OutOfMemory { size: usize::MAX })
            }
        }
    }

    /// Resize a block by moving it.
    ///
    /// A null `ptr` allocates; a zero `new_size` frees and returns
    /// `Ok(None)`. Otherwise a new block is always allocated, the first
    /// `min(old, new)` bytes copied and the old block freed: blocks never
    /// grow or shrink in place, so every resize gets a fresh frame.
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }
        if !self.config.enabled {
            return self.passthrough_reallocate(ptr, new_size).map(Some);
        }

        let addr = ptr as usize;
        let ticket = {
            let state = self.state.lock();
            self.reallocation_ticket(&state.registry, addr)?
        };

        let fresh = self.acquire_frame(new_size)?;

        // Another thread may free the old block, and the host may even hand
        // its address out again, while the lock is released. The ticket only
        // redeems for the record checked above.
        let outcome = {
            let mut state = self.state.lock();
            self.move_locked(&mut state, ticket, addr, &fresh)
        };

        match outcome {
            Ok(old) => {
                unsafe { self.host.release(old.ptr, old.size, HEADER_ALIGN) };
                let new = fresh.user();
                debug!("Moved {:#x} to {:?} ({} bytes)", addr, new, new_size);
                Ok(Some(new))
            }
            Err(e) => {
                // SAFETY: the fresh block was never registered.
                unsafe {
                    self.host
                        .release(fresh.base, fresh.frame.block_size, HEADER_ALIGN)
                };
                Err(e)
            }
        }
    }

    // Check that `addr` is a live, intact block that may be moved.
    fn reallocation_ticket(&self, registry: &Registry, addr: usize) -> Result<Ticket> {
        let id = match registry.find_by_user(addr) {
            Some(id) => id,
            None => {
                error!("reallocate() called on invalid pointer {:#x}", addr);
                self.stats.record_corruption();
                return Err(SafetyError::InvalidPointer { addr });
            }
        };
        let record = registry
            .get(id)
            .ok_or(SafetyError::InvalidPointer { addr })?;
        if record.flags.contains(AllocFlags::FREED) {
            error!("reallocate() called on freed pointer {:#x}", addr);
            self.stats.record_use_after_free();
            return Err(SafetyError::UseAfterFree { addr });
        }
        if !self.validate_record(record) {
            error!("reallocate() called on corrupted pointer {:#x}", addr);
            return Err(SafetyError::Corruption { addr });
        }
        registry
            .ticket(id)
            .ok_or(SafetyError::InvalidPointer { addr })
    }

    // Copy into the fresh block, retire the old one and register the fresh
    // one, all under a single lock acquisition.
    fn move_locked(
        &self,
        state: &mut TrackerState,
        ticket: Ticket,
        addr: usize,
        fresh: &FreshBlock,
    ) -> Result<HostBlock> {
        let old = match state.registry.redeem(ticket) {
            Some(record) => *record,
            None => {
                error!("Block {:#x} was freed while being reallocated", addr);
                self.stats.record_double_free();
                return Err(SafetyError::DoubleFree { addr });
            }
        };

        // SAFETY: the old block is live; the fresh block is ours alone.
        unsafe {
            ptr::copy_nonoverlapping(
                addr as *const u8,
                fresh.user().as_ptr(),
                old.size.min(fresh.frame.size),
            );
        }
        let block = self.retire_locked(state, ticket.id, old)?;
        self.register(state, fresh);
        Ok(block)
    }

    /// Free a block.
    ///
    /// Null is a no-op. An unknown pointer, a double-free or a damaged
    /// frame is reported and returned as an error without touching the
    /// block; a damaged block is deliberately leaked rather than handed back
    /// to the host.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        if !self.config.enabled {
            return self.passthrough_free(ptr);
        }

        let block = {
            let mut state = self.state.lock();
            self.free_locked(&mut state, ptr as usize)?
        };
        // SAFETY: the record is retired; nothing refers to this block now.
        unsafe { self.host.release(block.ptr, block.size, HEADER_ALIGN) };
        Ok(())
    }

    // Lookup, checks, poisoning and retirement, all under one lock. The host
    // block is returned for release after the lock is dropped.
    fn free_locked(&self, state: &mut TrackerState, addr: usize) -> Result<HostBlock> {
        let found = state
            .registry
            .find_by_user(addr)
            .and_then(|id| state.registry.get(id).map(|r| (id, *r)));
        match found {
            Some((id, record)) => self.retire_locked(state, id, record),
            None => {
                error!("free() called on invalid pointer {:#x}", addr);
                self.stats.record_corruption();
                Err(SafetyError::InvalidPointer { addr })
            }
        }
    }

    // Checks, poisoning and retirement of a registered block.
    fn retire_locked(
        &self,
        state: &mut TrackerState,
        id: SlotId,
        record: AllocationRecord,
    ) -> Result<HostBlock> {
        let addr = record.user;
        if record.flags.contains(AllocFlags::FREED) {
            error!("Double-free detected at {:#x}", addr);
            self.stats.record_double_free();
            return Err(SafetyError::DoubleFree { addr });
        }

        let frame = Frame::of(&record, self.config.canary_width);
        // SAFETY: the record is live, so its host block is too.
        if let Err(fault) = unsafe { frame.check(record.original as *const u8) } {
            error!(
                "Buffer overflow detected at {:#x} ({} bytes): {}; block leaked",
                addr, record.size, fault
            );
            self.stats.record_overflow();
            return Err(SafetyError::BufferOverflow {
                addr,
                size: record.size,
            });
        }

        if let Some(r) = state.registry.get_mut(id) {
            r.flags.remove(AllocFlags::ACTIVE);
            r.flags.insert(AllocFlags::FREED);
        }
        state.freed.record(addr);
        // SAFETY: the user region is live and record.size bytes long.
        unsafe { checksum::poison(slice::from_raw_parts_mut(addr as *mut u8, record.size)) };
        state.registry.retire(id);
        self.stats.record_free(record.size);

        trace!("Freed {} bytes at {:#x}", record.size, addr);
        Ok(HostBlock {
            // SAFETY: original came from a successful acquire.
            ptr: unsafe { NonNull::new_unchecked(record.original as *mut u8) },
            size: record.block_size,
        })
    }

    ////////////////////////////////////////////////////////////
    // Validation

    /// Check that `ptr` is a live, intact block.
    ///
    /// This is not read-only: a freed pointer bumps the use-after-free
    /// counter and a bad header magic bumps the corruption counter.
    pub fn validate(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        if !self.config.enabled {
            return true;
        }
        let state = self.state.lock();
        self.validate_in(&state.registry, ptr as usize)
    }

    fn validate_in(&self, registry: &Registry, addr: usize) -> bool {
        match registry.find_by_user(addr).and_then(|id| registry.get(id)) {
            Some(record) => self.validate_record(record),
            None => false,
        }
    }

    fn validate_record(&self, record: &AllocationRecord) -> bool {
        // A freed block's memory is gone, so this is checked before anything
        // in-band.
        if record.flags.contains(AllocFlags::FREED) {
            warn!("Use-after-free detected at {:#x}", record.user);
            self.stats.record_use_after_free();
            return false;
        }

        // SAFETY: the record is live, so its header is readable.
        let header = unsafe { ptr::read(record.original as *const AllocationHeader) };
        if header.magic != HEADER_MAGIC {
            error!("header magic of {:#x} is {:#x}", record.user, header.magic);
            self.stats.record_corruption();
            return false;
        }

        self.frame_intact(record)
    }

    fn frame_intact(&self, record: &AllocationRecord) -> bool {
        let frame = Frame::of(record, self.config.canary_width);
        // SAFETY: callers only pass live records.
        match unsafe { frame.check(record.original as *const u8) } {
            Ok(()) => true,
            Err(fault) => {
                debug!("Block {:#x} failed its frame check: {}", record.user, fault);
                false
            }
        }
    }

    /// `validate(ptr)`, and the block holds at least `len` bytes.
    pub fn validate_buffer(&self, ptr: *const u8, len: usize) -> bool {
        if !self.validate(ptr) {
            return false;
        }
        if !self.config.enabled {
            return true;
        }
        self.live_size(ptr).map_or(false, |size| len <= size)
    }

    /// `!validate(ptr)`.
    pub fn detect_corruption(&self, ptr: *const u8) -> bool {
        !self.validate(ptr)
    }

    /// Check both canary zones, the footer magic and the header checksum.
    ///
    /// Pure read: no counters change. False for unknown or freed pointers.
    pub fn check_canaries(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        if !self.config.enabled {
            return true;
        }
        let state = self.state.lock();
        match state
            .registry
            .find_by_user(ptr as usize)
            .and_then(|id| state.registry.get(id))
        {
            Some(record) if !record.flags.contains(AllocFlags::FREED) => self.frame_intact(record),
            _ => false,
        }
    }

    // Size of a live block, if `ptr` is one.
    fn live_size(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        let id = state.registry.find_by_user(ptr as usize)?;
        state
            .registry
            .get(id)
            .filter(|r| !r.flags.contains(AllocFlags::FREED))
            .map(|r| r.size)
    }

    /// `true` iff element `index` of `elem_size` bytes starts inside the
    /// block. Unknown or freed pointers are simply `false`; nothing is
    /// reported or counted.
    pub fn bounds_check(&self, ptr: *const u8, index: usize, elem_size: usize) -> bool {
        if ptr.is_null() {
            return false;
        }
        if !self.config.enabled {
            return true;
        }
        match (self.live_size(ptr), index.checked_mul(elem_size)) {
            (Some(size), Some(offset)) => offset < size,
            _ => false,
        }
    }

    /// Report an out-of-bounds access at the caller's location.
    #[track_caller]
    pub fn report_bounds_violation(&self, index: usize) {
        let location = Location::caller();
        error!(
            "BOUNDS VIOLATION: Array access at index {} in {}:{}",
            index,
            location.file(),
            location.line()
        );
        self.stats.record_overflow();
    }

    /// Read element `index` of a block holding `T`s, with bounds checking.
    ///
    /// An out-of-bounds index is reported at the caller's location and
    /// returned as `Err(BufferOverflow)`.
    ///
    /// # Safety
    ///
    /// The bytes of the element must be a valid `T`. With the safety layer
    /// disabled no bounds are known, and the caller must guarantee them.
    #[track_caller]
    pub unsafe fn read_element<T: Copy>(&self, ptr: *const T, index: usize) -> Result<T> {
        let elem = mem::size_of::<T>();
        if ptr.is_null() {
            return Err(SafetyError::NullArgument);
        }
        if !self.config.enabled {
            return Ok(ptr.add(index).read_unaligned());
        }

        let size = self.live_size(ptr as *const u8);
        let fits = match (size, index.checked_mul(elem)) {
            (Some(size), Some(offset)) => offset.checked_add(elem).map_or(false, |end| end <= size),
            _ => false,
        };
        if !fits {
            self.report_bounds_violation(index);
            return Err(SafetyError::BufferOverflow {
                addr: ptr as usize,
                size: size.unwrap_or(0),
            });
        }
        Ok(ptr.add(index).read_unaligned())
    }

    /// Copy `size` bytes from `src` into the block at `dest`.
    ///
    /// `dest` must be a valid block of at least `size` bytes, otherwise
    /// nothing is copied and `Err(Overflow)` is returned. Overlapping ranges
    /// are copied with move semantics.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `size` bytes.
    pub unsafe fn safe_copy(&self, dest: *mut u8, src: *const u8, size: usize) -> Result<()> {
        if dest.is_null() || src.is_null() {
            error!("safe_copy() called with a null pointer");
            return Err(SafetyError::NullArgument);
        }
        if size == 0 {
            return Ok(());
        }
        if !self.validate_buffer(dest, size) {
            let capacity = self.live_size(dest).unwrap_or(0);
            error!(
                "copy destination {:#x} invalid or too small ({} bytes into {})",
                dest as usize, size, capacity
            );
            return Err(SafetyError::Overflow {
                needed: size,
                capacity,
            });
        }

        let (d, s) = (dest as usize, src as usize);
        if d < s.saturating_add(size) && s < d.saturating_add(size) {
            ptr::copy(src, dest, size);
        } else {
            ptr::copy_nonoverlapping(src, dest, size);
        }
        Ok(())
    }

    /// Whether `ptr` is in the freed-pointer cache. A hint only: the host
    /// may have reused the address since.
    pub fn is_freed_pointer(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        self.state.lock().freed.contains(ptr as usize)
    }

    ////////////////////////////////////////////////////////////
    // Statistics and reporting

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset()
    }

    /// The statistics rendered as a fixed-format report.
    pub fn report(&self) -> String {
        self.stats().to_string()
    }

    /// Number of live (registered, not freed) blocks.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Check the registry's internal links.
    pub fn validity(&self) -> Validity {
        self.state.lock().registry.validity()
    }

    /// List every active block.
    pub fn dump_active_allocations(&self) -> String {
        let mut out = String::from("=== ACTIVE ALLOCATIONS ===\n");
        let state = self.state.lock();
        let mut count = 0;
        for (_, record) in &state.registry {
            if record.flags.contains(AllocFlags::ACTIVE) {
                count += 1;
                let _ = writeln!(
                    out,
                    "Allocation {}: {:#x} (size: {} bytes)",
                    count, record.user, record.size
                );
            }
        }
        drop(state);
        let _ = writeln!(out, "Total active: {} allocations", count);
        out.push_str("==========================\n");
        out
    }

    /// Validate every active block and return how many are corrupted.
    pub fn check_all_allocations(&self) -> usize {
        let state = self.state.lock();
        let mut corrupted = 0;
        for (_, record) in &state.registry {
            if record.flags.contains(AllocFlags::ACTIVE) && !self.validate_record(record) {
                corrupted += 1;
                error!("CORRUPTION: Block at {:#x} is corrupted", record.user);
            }
        }
        drop(state);

        if corrupted == 0 {
            info!("All active allocations are valid.");
        } else {
            error!("Found {} corrupted allocations!", corrupted);
        }
        corrupted
    }

    ////////////////////////////////////////////////////////////
    // Passthrough, used when the safety layer is disabled

    fn passthrough_allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let total = size
            .checked_add(PASSTHROUGH_PREFIX)
            .ok_or(SafetyError::OutOfMemory { size })?;
        let base = unsafe { self.host.acquire(total, HEADER_ALIGN) }.map_err(|e| {
            error!("host allocator failed to provide {} bytes: {:?}", total, e);
            SafetyError::OutOfMemory { size }
        })?;
        // SAFETY: base holds total bytes, the prefix is aligned for a usize.
        let user = unsafe {
            ptr::write(base.as_ptr() as *mut usize, size);
            let user = base.as_ptr().add(PASSTHROUGH_PREFIX);
            ptr::write_bytes(user, 0, size);
            NonNull::new_unchecked(user)
        };
        self.state.lock().passthrough.insert(user.as_ptr() as usize);
        Ok(user)
    }

    // Take `ptr` out of the passthrough set. Only the caller that succeeds
    // may touch the block afterwards.
    fn claim_passthrough(&self, ptr: *mut u8, op: &str) -> Result<()> {
        let addr = ptr as usize;
        if self.state.lock().passthrough.remove(&addr) {
            Ok(())
        } else {
            error!("{}() called on unknown pointer {:#x}", op, addr);
            Err(SafetyError::InvalidPointer { addr })
        }
    }

    // Safety: `ptr` came from passthrough_allocate and has been claimed.
    unsafe fn release_passthrough(&self, ptr: *mut u8) {
        let base = ptr.sub(PASSTHROUGH_PREFIX);
        let size = ptr::read(base as *const usize);
        self.host.release(
            NonNull::new_unchecked(base),
            size + PASSTHROUGH_PREFIX,
            HEADER_ALIGN,
        );
    }

    fn passthrough_free(&self, ptr: *mut u8) -> Result<()> {
        self.claim_passthrough(ptr, "free")?;
        unsafe { self.release_passthrough(ptr) };
        Ok(())
    }

    fn passthrough_reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>> {
        self.claim_passthrough(ptr, "reallocate")?;
        let new = match self.passthrough_allocate(new_size) {
            Ok(new) => new,
            Err(e) => {
                // Still the caller's block
                self.state.lock().passthrough.insert(ptr as usize);
                return Err(e);
            }
        };
        // SAFETY: ptr is claimed, so no one else frees it under us.
        unsafe {
            let old_size = ptr::read(ptr.sub(PASSTHROUGH_PREFIX) as *const usize);
            ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_size.min(new_size));
            self.release_passthrough(ptr);
        }
        Ok(new)
    }
}

impl<H> Drop for SafeAllocator<H> {
    fn drop(&mut self) {
        let state = self.state.lock();
        if !state.passthrough.is_empty() {
            warn!(
                "{} passthrough allocations still live at shutdown; leaking them",
                state.passthrough.len()
            );
        }
        let live = state.registry.len();
        if live == 0 {
            return;
        }
        // When we drop the allocator, we lose track of these; leaking them
        // is safer than releasing memory someone may still use.
        warn!("{} allocations still live at shutdown; leaking them", live);
        for (_, record) in &state.registry {
            warn!("  LEAK: {:#x} size={}", record.user, record.size);
        }
    }
}
