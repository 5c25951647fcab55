//! Runtime configuration for the safety layer.
//!
//! Defaults can be overridden from the environment with
//! [`SafetyConfig::from_env`]:
//!
//! - `GUARDED_ALLOC_DISABLE`: any value turns the layer into a passthrough
//! - `GUARDED_ALLOC_GUARD_PAGE_SIZE`: frame rounding size in bytes
//! - `GUARDED_ALLOC_CANARY_WIDTH`: bytes in each canary zone
//! - `GUARDED_ALLOC_FREED_CACHE`: entries in the freed-pointer cache
//! - `GUARDED_ALLOC_RETIRED`: freed records kept for double-free detection

use crate::error::{Result, SafetyError};

pub const DEFAULT_CANARY_WIDTH: usize = 8;
pub const MAX_CANARY_WIDTH: usize = 64;
pub const DEFAULT_FREED_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_RETIRED_CAPACITY: usize = 1024;

/// Smallest accepted guard page size; the frame header alignment.
pub const MIN_GUARD_PAGE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyConfig {
    /// When false, allocations go straight to the host and validation
    /// always succeeds.
    pub enabled: bool,
    /// Framed blocks are rounded up to a multiple of this. No page
    /// protection is applied; this reserves the room real guard pages
    /// would need.
    pub guard_page_size: usize,
    /// Bytes in each of the front and rear canary zones.
    pub canary_width: usize,
    /// Capacity of the freed-pointer ring.
    pub freed_cache_capacity: usize,
    /// How many freed records the registry keeps to recognise double-free
    /// and use-after-free.
    pub retired_capacity: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            enabled: true,
            guard_page_size: page_size(),
            canary_width: DEFAULT_CANARY_WIDTH,
            freed_cache_capacity: DEFAULT_FREED_CACHE_CAPACITY,
            retired_capacity: DEFAULT_RETIRED_CAPACITY,
        }
    }
}

impl SafetyConfig {
    /// A configuration with the safety layer switched off.
    pub fn disabled() -> Self {
        SafetyConfig {
            enabled: false,
            ..SafetyConfig::default()
        }
    }

    /// Defaults, overridden by any `GUARDED_ALLOC_*` variables that are set.
    /// Values that fail to parse are ignored and logged.
    pub fn from_env() -> Self {
        let mut config = SafetyConfig::default();
        if std::env::var_os("GUARDED_ALLOC_DISABLE").is_some() {
            config.enabled = false;
        }
        if let Some(v) = env_usize("GUARDED_ALLOC_GUARD_PAGE_SIZE") {
            config.guard_page_size = v;
        }
        if let Some(v) = env_usize("GUARDED_ALLOC_CANARY_WIDTH") {
            config.canary_width = v;
        }
        if let Some(v) = env_usize("GUARDED_ALLOC_FREED_CACHE") {
            config.freed_cache_capacity = v;
        }
        if let Some(v) = env_usize("GUARDED_ALLOC_RETIRED") {
            config.retired_capacity = v;
        }
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_guard_page_size(mut self, size: usize) -> Self {
        self.guard_page_size = size;
        self
    }

    pub fn with_canary_width(mut self, width: usize) -> Self {
        self.canary_width = width;
        self
    }

    pub fn with_freed_cache_capacity(mut self, capacity: usize) -> Self {
        self.freed_cache_capacity = capacity;
        self
    }

    pub fn with_retired_capacity(mut self, capacity: usize) -> Self {
        self.retired_capacity = capacity;
        self
    }

    /// Check every knob is in range.
    pub fn validate(&self) -> Result<()> {
        if !self.guard_page_size.is_power_of_two() {
            return Err(SafetyError::InvalidConfig(
                "guard_page_size must be a power of two",
            ));
        }
        if self.guard_page_size < MIN_GUARD_PAGE_SIZE {
            return Err(SafetyError::InvalidConfig(
                "guard_page_size must be at least 16",
            ));
        }
        if self.canary_width == 0 || self.canary_width > MAX_CANARY_WIDTH {
            return Err(SafetyError::InvalidConfig(
                "canary_width must be between 1 and 64",
            ));
        }
        if self.freed_cache_capacity == 0 {
            return Err(SafetyError::InvalidConfig(
                "freed_cache_capacity must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "use_libc")]
fn page_size() -> usize {
    sysconf::page::pagesize()
}

#[cfg(not(feature = "use_libc"))]
fn page_size() -> usize {
    // Page size is 4 kb "on most architectures"
    4096
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn default_is_valid() {
        let config = SafetyConfig::default();
        assert!(config.enabled);
        assert_eq!(config.canary_width, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_knobs() {
        let base = SafetyConfig::default();
        assert!(base.clone().with_guard_page_size(3000).validate().is_err());
        assert!(base.clone().with_guard_page_size(8).validate().is_err());
        assert!(base.clone().with_canary_width(0).validate().is_err());
        assert!(base.clone().with_canary_width(65).validate().is_err());
        assert!(base.clone().with_freed_cache_capacity(0).validate().is_err());
        assert!(base.with_retired_capacity(0).validate().is_ok());
    }
}
