//! Shared wire messages, framing and status taxonomy for sandcell.
//!
//! The host process and its sandboxed worker children exchange
//! length-prefixed protobuf frames over unix socket pairs. Everything that
//! crosses that boundary (request/reply messages, the function-binding IO
//! proto, and the numeric status taxonomy) lives here so the two sides
//! cannot drift apart.
#![deny(dead_code, missing_docs, unused_mut)]

mod framing;
mod proto;
mod status;

/// Request tag names and runtime limits shared by host and worker.
pub mod tags;

pub use framing::{MAX_FRAME_LEN, recv_frame, recv_message, send_frame, send_message};
pub use proto::{
    Engine, FunctionBindingIo, HostToWorker, ListOfString, MapOfString, RunWorker, StopWorker,
    WasmReturnType, WorkerInitParams, WorkerRunReply, WorkerRunRequest, host_to_worker,
};
pub use status::{Error, Result, StatusKind};
