//! Canary values and the integrity digest used by the frame checks.
//!
//! Everything here is a pure function over byte ranges; none of it knows
//! about the registry or the statistics.

/// Sentinel repeated in the zone just before user data.
pub const FRONT_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Sentinel repeated in the zone just after user data. Distinct from the
/// front canary so a block copied over its neighbour is still caught.
pub const REAR_CANARY: u64 = 0xBADC_0FFE_E0DD_F00D;

/// Tag stored in every allocation header.
pub const HEADER_MAGIC: u32 = 0x1234_5678;

/// Tag stored in every footer trailer.
pub const FOOTER_MAGIC: u32 = 0x8765_4321;

/// Byte written over user data when a block is freed.
pub const POISON_BYTE: u8 = 0xDD;

/// Rotating xor digest over `bytes`.
///
/// Each byte is folded in and the accumulator rotated by one bit, so both
/// the value and the position of a changed byte affect the result.
pub fn digest(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| (acc ^ u32::from(b)).rotate_left(1))
}

/// Fill `zone` with the little-endian bytes of `canary`, repeated.
pub fn fill_canary(zone: &mut [u8], canary: u64) {
    let pattern = canary.to_le_bytes();
    for (i, byte) in zone.iter_mut().enumerate() {
        *byte = pattern[i % 8];
    }
}

/// Check that `zone` still holds the repeated bytes of `canary`.
///
/// Returns the offset of the first mismatching byte, if any.
pub fn find_canary_mismatch(zone: &[u8], canary: u64) -> Option<usize> {
    let pattern = canary.to_le_bytes();
    zone.iter()
        .enumerate()
        .position(|(i, &b)| b != pattern[i % 8])
}

/// Fill `region` with [`POISON_BYTE`].
pub fn poison(region: &mut [u8]) {
    for byte in region.iter_mut() {
        *byte = POISON_BYTE;
    }
}
