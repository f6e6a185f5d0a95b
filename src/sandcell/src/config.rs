//! Runtime configuration.

use sandcell_common::Engine;

use crate::binding::FunctionBinding;

/// Configuration for a [`RuntimeService`](crate::RuntimeService).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of sandboxed workers. Zero selects the machine's available
    /// parallelism.
    pub worker_count: usize,
    /// Cap on requests admitted but not yet completed.
    pub max_pending_requests: usize,
    /// Bound of the executor's work queue.
    pub worker_queue_cap: usize,
    /// Engine each worker constructs; only V8 is defined.
    pub engine: Engine,
    /// When set, executing a version that was never broadcast fails with a
    /// missing-context error instead of compiling on the fly.
    pub require_preload: bool,
    /// Per-worker compilation-context cache capacity. Zero selects the
    /// default of five.
    pub context_cache_capacity: usize,
    /// Initial engine heap size in MiB per worker. Zero leaves the engine
    /// default.
    pub initial_heap_mib: u64,
    /// Maximum engine heap size in MiB per worker. Zero leaves the engine
    /// default.
    pub max_heap_mib: u64,
    /// Process-wide cap on wasm memory pages, at most 65536. Zero leaves
    /// the engine default.
    pub max_wasm_memory_pages: u64,
    /// Host functions exposed to sandboxed code.
    pub function_bindings: Vec<FunctionBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_pending_requests: 100,
            worker_queue_cap: 100,
            engine: Engine::V8,
            require_preload: true,
            context_cache_capacity: 0,
            initial_heap_mib: 0,
            max_heap_mib: 0,
            max_wasm_memory_pages: 0,
            function_bindings: Vec::new(),
        }
    }
}
