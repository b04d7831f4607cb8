//! Compiler statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by compilation and call-site patching.
#[derive(Debug)]
pub struct JitStats {
    /// Methods compiled.
    pub methods_compiled: AtomicU64,
    /// Compilations that failed.
    pub compile_failures: AtomicU64,
    /// Instructions placed in the code space.
    pub code_units: AtomicU64,
    /// Call nodes created.
    pub call_sites: AtomicU64,
    /// Root maps recorded.
    pub root_maps: AtomicU64,
    /// Frame-map replay passes across all methods.
    pub frame_map_passes: AtomicU64,
    /// Call sites and vtable slots patched away from a thunk.
    pub patches: AtomicU64,
    /// Time spent compiling (nanoseconds).
    pub compile_time_ns: AtomicU64,
}

impl JitStats {
    pub const fn new() -> Self {
        Self {
            methods_compiled: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            code_units: AtomicU64::new(0),
            call_sites: AtomicU64::new(0),
            root_maps: AtomicU64::new(0),
            frame_map_passes: AtomicU64::new(0),
            patches: AtomicU64::new(0),
            compile_time_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_compile(
        &self,
        code_units: usize,
        call_sites: usize,
        root_maps: usize,
        passes: u32,
        elapsed: Duration,
    ) {
        self.methods_compiled.fetch_add(1, Ordering::Relaxed);
        self.code_units
            .fetch_add(code_units as u64, Ordering::Relaxed);
        self.call_sites
            .fetch_add(call_sites as u64, Ordering::Relaxed);
        self.root_maps.fetch_add(root_maps as u64, Ordering::Relaxed);
        self.frame_map_passes
            .fetch_add(u64::from(passes), Ordering::Relaxed);
        self.compile_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failure(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_patch(&self) {
        self.patches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JitStatsSnapshot {
        JitStatsSnapshot {
            methods_compiled: self.methods_compiled.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            code_units: self.code_units.load(Ordering::Relaxed),
            call_sites: self.call_sites.load(Ordering::Relaxed),
            root_maps: self.root_maps.load(Ordering::Relaxed),
            frame_map_passes: self.frame_map_passes.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            compile_time: Duration::from_nanos(self.compile_time_ns.load(Ordering::Relaxed)),
        }
    }
}

impl Default for JitStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`JitStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitStatsSnapshot {
    pub methods_compiled: u64,
    pub compile_failures: u64,
    pub code_units: u64,
    pub call_sites: u64,
    pub root_maps: u64,
    pub frame_map_passes: u64,
    pub patches: u64,
    pub compile_time: Duration,
}
