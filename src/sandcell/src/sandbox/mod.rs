//! Host-side stub for one sandboxed worker process.

mod worker_api;

pub(crate) use worker_api::{WorkerSandboxApi, WorkerSandboxOptions};
