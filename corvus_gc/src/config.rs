//! GC configuration parameters.

use thiserror::Error;

/// Configuration for the heap and collector.
///
/// # Example
///
/// ```ignore
/// use corvus_gc::GcConfig;
///
/// // Collect often, useful when hunting missing roots.
/// let config = GcConfig {
///     allocation_trigger: 4 * 1024,
///     verify_roots: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bytes allocated since the last cycle before `needs_collection`
    /// starts reporting `true`.
    ///
    /// Default: 8MB
    pub allocation_trigger: usize,

    /// Number of object slots reserved up front.
    ///
    /// Default: 4096
    pub initial_capacity: usize,

    /// Check that every root handed to the marker names a live object.
    /// A violation is a fatal runtime inconsistency.
    ///
    /// Default: enabled in debug builds
    pub verify_roots: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            allocation_trigger: 8 * 1024 * 1024,
            initial_capacity: 4096,
            verify_roots: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Smallest accepted allocation trigger.
    pub const MIN_TRIGGER: usize = 256;

    /// Configuration that collects very frequently.
    pub fn stress() -> Self {
        Self {
            allocation_trigger: Self::MIN_TRIGGER,
            initial_capacity: 256,
            verify_roots: true,
        }
    }

    /// Configuration for long-running, allocation-heavy workloads.
    pub fn throughput() -> Self {
        Self {
            allocation_trigger: 64 * 1024 * 1024,
            initial_capacity: 64 * 1024,
            verify_roots: false,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocation_trigger < Self::MIN_TRIGGER {
            return Err(ConfigError::TriggerTooSmall(self.allocation_trigger));
        }
        if self.initial_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("allocation trigger {0} is below the minimum of 256 bytes")]
    TriggerTooSmall(usize),
    #[error("initial capacity must be non-zero")]
    ZeroCapacity,
}
