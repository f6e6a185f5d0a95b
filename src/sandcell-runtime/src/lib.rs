//! The in-sandbox half of sandcell.
//!
//! A worker child process runs [`sandbox_main`] as its only activity: it
//! installs the syscall allow-list, then serves init/run/run-code/stop
//! calls from the host over a framed unix socket. The [`Worker`] owns one
//! [`engine::V8JsEngine`] and a bounded cache of compilation contexts keyed
//! by code version.
//!
//! Everything here is also callable in-process (no fork, no seccomp),
//! which is how the engine and worker tests run.
#![deny(unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

pub mod engine;
mod entrypoint;
mod policy;
mod worker;

pub use entrypoint::sandbox_main;
pub use worker::Worker;
