//! An embeddable runtime for untrusted JavaScript and WebAssembly handlers.
//!
//! Callers load code objects into a pool of sandboxed worker processes and
//! invoke named handler functions against them at high rates. Each worker
//! runs in its own address space under a syscall allow-list; requests are
//! round-robined across the pool, bounded by an in-flight cap, and workers
//! that crash are restarted transparently.
//!
//! The entry point is [`RuntimeService`]: configure it with a [`Config`],
//! [`broadcast`](RuntimeService::broadcast) a [`CodeObject`] to every
//! worker, then [`dispatch`](RuntimeService::dispatch)
//! [`InvocationRequest`]s against the loaded version.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod binding;
mod config;
mod dispatcher;
mod executor;
mod metrics;
mod pool;
mod request;
mod sandbox;
mod service;

pub use binding::FunctionBinding;
pub use config::Config;
pub use dispatcher::{BatchCallback, Callback, DispatchRequest, Dispatcher};
pub use pool::WorkerPool;
pub use request::{
    CodeObject, InvocationRequest, InvocationRequestOwned, InvocationRequestShared, ResponseObject,
};
pub use sandcell_common::{
    Engine, Error, FunctionBindingIo, ListOfString, MapOfString, Result, StatusKind,
    WasmReturnType, tags,
};
pub use service::RuntimeService;
