//! Bounded copies of NUL-terminated byte strings.
//!
//! The destination's capacity is its slice length, terminator included. On
//! failure the destination is left exactly as it was.

use log::warn;

use crate::error::{Result, SafetyError};

/// Length of a NUL-terminated string, or the whole slice if it has no NUL.
pub fn c_str_len(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == 0).unwrap_or_else(|| buf.len())
}

/// Copy the string in `src` into `dest`, with its terminator.
///
/// Fails with `Overflow` unless `strlen(src) < dest.len()`.
pub fn safe_string_copy(dest: &mut [u8], src: &[u8]) -> Result<()> {
    let capacity = dest.len();
    let len = c_str_len(src);
    if len >= capacity {
        warn!(
            "String copy of {} bytes refused: destination holds {}",
            len + 1,
            capacity
        );
        return Err(SafetyError::Overflow {
            needed: len + 1,
            capacity,
        });
    }

    dest[..len].copy_from_slice(&src[..len]);
    dest[len] = 0;
    Ok(())
}

/// Append the string in `src` to the string already in `dest`.
///
/// Fails with `Overflow` unless both strings and the terminator fit. A
/// destination with no terminator is already over capacity.
pub fn safe_string_concat(dest: &mut [u8], src: &[u8]) -> Result<()> {
    let capacity = dest.len();
    let start = c_str_len(dest);
    let len = c_str_len(src);
    let needed = start + len + 1;
    if needed > capacity {
        warn!(
            "String concatenation to {} bytes refused: destination holds {}",
            needed, capacity
        );
        return Err(SafetyError::Overflow { needed, capacity });
    }

    dest[start..start + len].copy_from_slice(&src[..len]);
    dest[start + len] = 0;
    Ok(())
}
