//! Runtime configuration.
//!
//! Collects the knobs of every layer in one place: native stack sizing for
//! mutator threads, compiler options and heap configuration. Values can be
//! overridden from the environment:
//!
//! | variable              | field                      |
//! |-----------------------|----------------------------|
//! | `CORVUS_STACK_WORDS`  | `stack_words`              |
//! | `CORVUS_TAIL_CALLS`   | `jit.tail_calls`           |
//! | `CORVUS_GC_TRIGGER`   | `gc.allocation_trigger`    |
//! | `CORVUS_VERIFY_ROOTS` | `gc.verify_roots`          |

use corvus_gc::GcConfig;
use corvus_jit::JitOptions;
use thiserror::Error;

/// Environment variable overriding [`RuntimeConfig::stack_words`].
pub const ENV_STACK_WORDS: &str = "CORVUS_STACK_WORDS";
/// Environment variable overriding [`JitOptions::tail_calls`].
pub const ENV_TAIL_CALLS: &str = "CORVUS_TAIL_CALLS";
/// Environment variable overriding [`GcConfig::allocation_trigger`].
pub const ENV_GC_TRIGGER: &str = "CORVUS_GC_TRIGGER";
/// Environment variable overriding [`GcConfig::verify_roots`].
pub const ENV_VERIFY_ROOTS: &str = "CORVUS_VERIFY_ROOTS";

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```ignore
/// use corvus_vm::RuntimeConfig;
///
/// // Small stacks and an eager collector for tests.
/// let config = RuntimeConfig {
///     stack_words: 16 * 1024,
///     gc: corvus_gc::GcConfig::stress(),
///     ..Default::default()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Words of native stack given to each attached thread.
    ///
    /// Default: 256K words
    pub stack_words: usize,

    /// Words at the low end of every stack that frames may never occupy.
    /// A frame that would reach into the reserve raises a stack overflow.
    ///
    /// Default: 1024
    pub stack_reserve: usize,

    /// Compiler options.
    pub jit: JitOptions,

    /// Heap configuration.
    pub gc: GcConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_words: 256 * 1024,
            stack_reserve: 1024,
            jit: JitOptions::default(),
            gc: GcConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Smallest accepted stack.
    pub const MIN_STACK_WORDS: usize = 4 * 1024;

    /// Default configuration with overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Default configuration with overrides from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(words) = parse_var(&lookup, ENV_STACK_WORDS, |v| v.parse::<usize>().ok())? {
            config.stack_words = words;
        }
        if let Some(enabled) = parse_var(&lookup, ENV_TAIL_CALLS, parse_flag)? {
            config.jit.tail_calls = enabled;
        }
        if let Some(trigger) = parse_var(&lookup, ENV_GC_TRIGGER, |v| v.parse::<usize>().ok())? {
            config.gc.allocation_trigger = trigger;
        }
        if let Some(verify) = parse_var(&lookup, ENV_VERIFY_ROOTS, parse_flag)? {
            config.gc.verify_roots = verify;
        }
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_words < Self::MIN_STACK_WORDS {
            return Err(ConfigError::StackTooSmall(self.stack_words));
        }
        if self.stack_reserve == 0 || self.stack_reserve * 2 > self.stack_words {
            return Err(ConfigError::BadReserve {
                reserve: self.stack_reserve,
                stack: self.stack_words,
            });
        }
        self.gc.validate()?;
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match parse(value.trim()) {
            Some(parsed) => Ok(Some(parsed)),
            None => Err(ConfigError::InvalidVar { var, value }),
        },
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("stack of {0} words is below the minimum of 4096")]
    StackTooSmall(usize),
    #[error("stack reserve of {reserve} words does not fit a {stack}-word stack")]
    BadReserve { reserve: usize, stack: usize },
    #[error("invalid value {value:?} for {var}")]
    InvalidVar { var: &'static str, value: String },
    #[error(transparent)]
    Gc(#[from] corvus_gc::ConfigError),
}

// =============================================================================
// Tests
// =============================================================================
