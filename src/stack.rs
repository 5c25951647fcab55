use core::panic::Location;
use core::ptr;

use log::error;

use crate::checksum::FRONT_CANARY;

/// A canary word placed in a stack frame.
///
/// Create one at the top of a function and call [`check`](#method.check)
/// before returning. A smashed canary means the frame is no longer
/// trustworthy, so the check aborts the process instead of unwinding
/// through it.
#[derive(Debug)]
pub struct StackGuard {
    canary: u64,
}

impl StackGuard {
    #[inline(never)]
    pub fn new() -> Self {
        StackGuard {
            canary: FRONT_CANARY,
        }
    }

    /// Abort if the canary has been overwritten.
    #[track_caller]
    pub fn check(&self) {
        // Volatile, so the compiler cannot assume the value it stored.
        let canary = unsafe { ptr::read_volatile(&self.canary) };
        if canary != FRONT_CANARY {
            stack_corruption_detected(Location::caller());
        }
    }
}

impl Default for StackGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn stack_corruption_detected(location: &Location<'_>) -> ! {
    error!(
        "STACK CORRUPTION: Stack canary violated in {}:{}",
        location.file(),
        location.line()
    );
    // The logger may not be set up; stderr always is.
    eprintln!(
        "STACK CORRUPTION: Stack canary violated in {}:{}",
        location.file(),
        location.line()
    );
    std::process::abort()
}
