//! Wire messages exchanged between the host and a sandboxed worker.
//!
//! Messages are hand-tagged prost structs rather than generated from
//! `.proto` files; the field numbers are the wire contract and must not be
//! reused. Every message travels as one length-prefixed frame (see
//! [`crate::framing`]).

use std::collections::HashMap;

/// The engine a worker should construct. Only V8 is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Engine {
    /// The V8 JavaScript/WebAssembly engine.
    V8 = 0,
}

/// Declared type of a wasm handler's return value, read back from linear
/// memory at the offset the handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum WasmReturnType {
    /// No declared type; executing a bare wasm handler with this value fails.
    Unspecified = 0,
    /// The returned `i32` is the value itself.
    Uint32 = 1,
    /// The returned offset points at a length-prefixed UTF-8 string.
    String = 2,
    /// The returned offset points at a list of offsets to strings.
    ListOfString = 3,
}

/// Parameters for initializing a freshly spawned worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInitParams {
    /// Engine selection, see [`Engine`].
    #[prost(enumeration = "Engine", tag = "1")]
    pub engine: i32,
    /// When set, executing a version that has no cached compilation context
    /// fails instead of compiling on the fly.
    #[prost(bool, tag = "2")]
    pub require_code_preload: bool,
    /// File descriptor number, as visible inside the sandbox, of the
    /// function-binding channel. Negative when no bindings are configured.
    #[prost(int32, tag = "3")]
    pub binding_channel_fd: i32,
    /// Names of the host functions to expose on the script's global object.
    #[prost(string, repeated, tag = "4")]
    pub binding_names: Vec<String>,
    /// Capacity of the worker's compilation-context cache. Zero selects the
    /// default.
    #[prost(uint64, tag = "5")]
    pub context_cache_capacity: u64,
    /// Initial engine heap size in MiB. Zero leaves the engine default.
    #[prost(uint64, tag = "6")]
    pub initial_heap_mib: u64,
    /// Maximum engine heap size in MiB. Zero leaves the engine default.
    #[prost(uint64, tag = "7")]
    pub max_heap_mib: u64,
    /// Process-wide cap on wasm memory pages. Zero leaves the engine default.
    #[prost(uint64, tag = "8")]
    pub max_wasm_memory_pages: u64,
}

/// A single code-load or handler-invocation request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRunRequest {
    /// JavaScript source, empty when the request targets a bare wasm module.
    #[prost(string, tag = "1")]
    pub code: String,
    /// Wasm module bytes, empty for pure JavaScript.
    #[prost(bytes = "vec", tag = "2")]
    pub wasm: Vec<u8>,
    /// JSON-encoded handler arguments, one per parameter.
    #[prost(string, repeated, tag = "3")]
    pub inputs: Vec<String>,
    /// Request tags, see [`crate::tags`].
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
    /// Declared wasm return type; meaningful only for wasm loads.
    #[prost(enumeration = "WasmReturnType", tag = "5")]
    pub wasm_return_type: i32,
}

/// Reply to any [`HostToWorker`] call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRunReply {
    /// A [`crate::StatusKind`] discriminant.
    #[prost(int32, tag = "1")]
    pub status: i32,
    /// Failure detail when `status` is non-zero.
    #[prost(string, tag = "2")]
    pub message: String,
    /// JSON-encoded handler return value; empty for loads and for handlers
    /// without a return value.
    #[prost(string, tag = "3")]
    pub response: String,
    /// Time spent inside the engine call, excluding transport overhead.
    #[prost(uint64, tag = "4")]
    pub engine_elapsed_ns: u64,
}

/// Marker payload for the run call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunWorker {}

/// Marker payload for the stop call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopWorker {}

/// Envelope for every call the host makes into the sandbox.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostToWorker {
    /// The call payload.
    #[prost(oneof = "host_to_worker::Call", tags = "1, 2, 3, 4")]
    pub call: Option<host_to_worker::Call>,
}

/// Oneof payloads for [`HostToWorker`].
pub mod host_to_worker {
    /// The concrete call carried by a [`super::HostToWorker`] frame.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Call {
        /// Initialize the worker; first call after spawn.
        #[prost(message, tag = "1")]
        Init(super::WorkerInitParams),
        /// Start serving requests.
        #[prost(message, tag = "2")]
        Run(super::RunWorker),
        /// Load code or invoke a handler.
        #[prost(message, tag = "3")]
        RunCode(super::WorkerRunRequest),
        /// Stop serving and exit.
        #[prost(message, tag = "4")]
        Stop(super::StopWorker),
    }
}

/// A list of strings crossing the binding channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListOfString {
    /// The list elements.
    #[prost(string, repeated, tag = "1")]
    pub data: Vec<String>,
}

/// A string-to-string map crossing the binding channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapOfString {
    /// The map entries.
    #[prost(map = "string, string", tag = "1")]
    pub data: HashMap<String, String>,
}

/// One host-function invocation crossing the binding channel.
///
/// The sandboxed callback fills in the function name and exactly one input
/// field; the host-side handler fills in one output field or appends to
/// `errors`, and the same message travels back.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionBindingIo {
    /// Name the script called, used to route to a registered host function.
    #[prost(string, tag = "1")]
    pub function_name: String,
    /// String argument, when the script passed a string.
    #[prost(string, optional, tag = "2")]
    pub input_string: Option<String>,
    /// List-of-strings argument.
    #[prost(message, optional, tag = "3")]
    pub input_list_of_string: Option<ListOfString>,
    /// Map-of-string-to-string argument.
    #[prost(message, optional, tag = "4")]
    pub input_map_of_string: Option<MapOfString>,
    /// String result.
    #[prost(string, optional, tag = "5")]
    pub output_string: Option<String>,
    /// List-of-strings result.
    #[prost(message, optional, tag = "6")]
    pub output_list_of_string: Option<ListOfString>,
    /// Map result.
    #[prost(message, optional, tag = "7")]
    pub output_map_of_string: Option<MapOfString>,
    /// Failure messages; any entry makes the sandboxed callback throw.
    #[prost(string, repeated, tag = "8")]
    pub errors: Vec<String>,
}
