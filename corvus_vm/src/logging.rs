//! Log subscriber setup.
//!
//! Everything in the runtime reports through `tracing`. Embedders that do
//! not install their own subscriber can call [`init`], which filters by the
//! `CORVUS_LOG` environment variable using `EnvFilter` directives:
//!
//! ```text
//! CORVUS_LOG=warn                                  # default
//! CORVUS_LOG=corvus_jit=debug                      # every compilation
//! CORVUS_LOG=corvus_jit=trace,corvus_vm=debug      # patching, GC cycles
//! ```

use tracing_subscriber::EnvFilter;

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "CORVUS_LOG";

const DEFAULT_DIRECTIVES: &str = "warn";

/// Install a formatting subscriber filtered by `CORVUS_LOG`.
///
/// Does nothing if a global subscriber is already set.
pub fn init() {
    let _ = try_init();
}

/// Like [`init`], reporting whether the subscriber was installed.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .try_init()
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
