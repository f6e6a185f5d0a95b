//! Request tag names and limits recognised by the worker.
//!
//! Tags travel in the metadata map of a [`WorkerRunRequest`](crate::WorkerRunRequest)
//! and steer how the worker treats the request.

/// Selects the engine request type; value is [`REQUEST_TYPE_JS`] or
/// [`REQUEST_TYPE_WASM`].
pub const REQUEST_TYPE: &str = "RequestType";
/// Request type value for JavaScript code (including JS that instantiates
/// an attached wasm module).
pub const REQUEST_TYPE_JS: &str = "JS";
/// Request type value for a bare wasm module.
pub const REQUEST_TYPE_WASM: &str = "WASM";

/// Selects the action; value is [`REQUEST_ACTION_LOAD`] or
/// [`REQUEST_ACTION_EXECUTE`].
pub const REQUEST_ACTION: &str = "RequestAction";
/// Compile the code, run its top level and cache the compilation context.
pub const REQUEST_ACTION_LOAD: &str = "Load";
/// Invoke a handler against a previously loaded version.
pub const REQUEST_ACTION_EXECUTE: &str = "Execute";

/// The code version string; used as the compilation-context cache key.
pub const CODE_VERSION: &str = "CodeVersion";
/// The exported function to invoke. Required for execute, optional for load.
pub const HANDLER_NAME: &str = "HandlerName";
/// Per-execution timeout in milliseconds, as a decimal integer string.
pub const TIMEOUT_MS: &str = "TimeoutMs";
/// Name of the global `Uint8Array` under which attached wasm bytes are
/// exposed to a JavaScript code object.
pub const WASM_CODE_ARRAY_NAME: &str = "WasmCodeArrayName";

/// Timeout applied when a request carries no [`TIMEOUT_MS`] tag.
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5000;
/// Upper bound on the per-execution timeout; larger requested values are
/// clamped.
pub const MAX_EXECUTION_TIMEOUT_MS: u64 = 120_000;

/// Default number of compilation contexts a worker keeps per engine.
pub const DEFAULT_CONTEXT_CACHE_CAPACITY: usize = 5;

/// Hard cap on the wasm memory page flag accepted at engine setup.
pub const MAX_WASM_MEMORY_PAGES: u64 = 65536;
