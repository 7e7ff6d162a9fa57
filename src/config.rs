//! Bridge-wide configuration.

use std::time::Duration;

/// Tunables shared by every instance of one [`crate::bridge::Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Suppress uncaught script exceptions raised during dispatched
    /// calls instead of propagating them to the caller. Suppressed
    /// errors are still surfaced through the engine's discard hook.
    pub discard_uncaught_exceptions: bool,
    /// Allow dispatching into an instance from any thread without
    /// posting to its affinity thread.
    pub multithreaded_scripting: bool,
    /// How often the GC bridge drains collected handles.
    pub gc_interval: Duration,
    /// How often the memory watcher samples the probe. `None` disables
    /// pressure-triggered sweeps even when a probe is installed.
    pub memory_check_interval: Option<Duration>,
    /// Free-memory fraction below which a full sweep is requested.
    pub free_memory_ratio: f64,
    /// Capacity of each instance's resolved-signature cache.
    pub signature_cache_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            discard_uncaught_exceptions: false,
            multithreaded_scripting: false,
            gc_interval: Duration::from_millis(100),
            memory_check_interval: None,
            free_memory_ratio: 0.1,
            signature_cache_size: 256,
        }
    }
}
