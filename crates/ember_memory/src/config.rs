//! # Memory Configuration
//!
//! Settings consumed once at initialization. Loaded from TOML:
//!
//! ```toml
//! heap_size = 67108864
//! zone_size = 4194304
//! max_segments = 8
//! paranoid = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::hunk::HUNK_HEADER_SIZE;

/// Default size of the initial hunk segment (64 MiB).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Default bytes reserved for the zone (4 MiB).
pub const DEFAULT_ZONE_SIZE: usize = 4 * 1024 * 1024;

/// Default segment count limit.
pub const DEFAULT_MAX_SEGMENTS: usize = 8;

/// Hard upper bound for `max_segments`.
const SEGMENT_LIMIT: usize = 64;

/// Memory subsystem configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of the initial hunk segment in bytes.
    pub heap_size: usize,
    /// Bytes reserved for the zone allocator.
    pub zone_size: usize,
    /// Maximum number of hunk segments.
    pub max_segments: usize,
    /// Run consistency checks before every hunk and zone allocation.
    pub paranoid: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            zone_size: DEFAULT_ZONE_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            paranoid: false,
        }
    }
}

impl MemoryConfig {
    /// Creates a configuration with the given heap size and default zone.
    #[must_use]
    pub fn with_heap_size(heap_size: usize) -> Self {
        Self {
            heap_size,
            ..Self::default()
        }
    }

    /// Overrides the zone size, given in KiB.
    #[must_use]
    pub const fn with_zone_kib(mut self, kib: usize) -> Self {
        self.zone_size = kib * 1024;
        self
    }

    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] on malformed TOML or bad values.
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks that the values describe a usable memory layout.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.heap_size == 0 {
            return Err(MemoryError::InvalidConfig("heap_size must be non-zero".into()));
        }
        if self.zone_size == 0 {
            return Err(MemoryError::InvalidConfig("zone_size must be non-zero".into()));
        }
        if u32::try_from(self.zone_size).is_err() {
            return Err(MemoryError::InvalidConfig(format!(
                "zone_size {} does not fit in 32 bits",
                self.zone_size
            )));
        }
        if self.zone_size.saturating_add(HUNK_HEADER_SIZE + 15) > self.heap_size {
            return Err(MemoryError::InvalidConfig(format!(
                "zone_size {} does not fit in heap_size {}",
                self.zone_size, self.heap_size
            )));
        }
        if self.max_segments == 0 || self.max_segments > SEGMENT_LIMIT {
            return Err(MemoryError::InvalidConfig(format!(
                "max_segments must be between 1 and {SEGMENT_LIMIT}, got {}",
                self.max_segments
            )));
        }
        Ok(())
    }
}
