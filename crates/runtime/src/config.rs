//! Runtime configuration (SPEC_FULL §12).
//!
//! Tracing verbosity is controlled the ordinary way, via
//! `tracing_subscriber::EnvFilter::from_default_env()` in the CLI; this
//! struct only carries the knobs that are specific to `rlox-vm` itself.

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Overrides the GC's initial collection threshold (§4.H "initially
    /// ~1 MiB"). Mainly useful for tests that want to force early cycles.
    pub gc_threshold_override: Option<usize>,
    /// Mirrors clox's `DEBUG_STRESS_GC`: collect before every allocation
    /// rather than waiting for `bytesAllocated > nextGC` (feature
    /// `gc-stress-test`).
    pub gc_stress_test: bool,
}
