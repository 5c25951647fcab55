use core::fmt;

/// Every violation or failure the safety layer can report.
///
/// None of these unwind; callers get one back from the operation that
/// detected it, after the matching counter has been bumped and a diagnostic
/// has been logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyError {
    /// The pointer has no registry record.
    InvalidPointer { addr: usize },
    /// The pointer was already freed.
    DoubleFree { addr: usize },
    /// A canary, the footer magic or the header checksum does not match.
    BufferOverflow { addr: usize, size: usize },
    /// The header magic was wrong, or a block failed validation.
    Corruption { addr: usize },
    /// The pointer refers to a freed block.
    UseAfterFree { addr: usize },
    /// The host allocator could not provide `size` bytes.
    OutOfMemory { size: usize },
    /// A copy or string write of `needed` bytes does not fit in `capacity`.
    Overflow { needed: usize, capacity: usize },
    /// A required pointer argument was null.
    NullArgument,
    /// A zero size was given where a non-empty region is required.
    InvalidSize,
    /// A pool cannot satisfy the request.
    PoolExhausted { requested: usize, available: usize },
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
    /// The process-wide context was already set up.
    AlreadyInitialized,
}

pub type Result<T> = core::result::Result<T, SafetyError>;

impl fmt::Display for SafetyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SafetyError::InvalidPointer { addr } => write!(f, "invalid pointer {:#x}", addr),
            SafetyError::DoubleFree { addr } => write!(f, "double-free detected at {:#x}", addr),
            SafetyError::BufferOverflow { addr, size } => write!(
                f,
                "buffer overflow detected at {:#x} ({} byte block)",
                addr, size
            ),
            SafetyError::Corruption { addr } => write!(f, "corrupted block at {:#x}", addr),
            SafetyError::UseAfterFree { addr } => {
                write!(f, "use-after-free detected at {:#x}", addr)
            }
            SafetyError::OutOfMemory { size } => {
                write!(f, "host allocator failed to provide {} bytes", size)
            }
            SafetyError::Overflow { needed, capacity } => write!(
                f,
                "write of {} bytes does not fit in {} bytes",
                needed, capacity
            ),
            SafetyError::NullArgument => write!(f, "null pointer argument"),
            SafetyError::InvalidSize => write!(f, "size must be non-zero"),
            SafetyError::PoolExhausted {
                requested,
                available,
            } => write!(
                f,
                "pool exhausted: {} bytes requested, {} available",
                requested, available
            ),
            SafetyError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
            SafetyError::AlreadyInitialized => write!(f, "safety context already initialized"),
        }
    }
}

impl std::error::Error for SafetyError {}
