//! Entrypoint loop of a sandboxed worker child.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Instant;

use sandcell_common::{
    Engine, HostToWorker, StatusKind, WorkerInitParams, WorkerRunReply, WorkerRunRequest,
    host_to_worker::Call, recv_message, send_message,
};

use crate::engine::{ChannelInvoker, EngineOptions, FunctionBindingVisitor, SetupOptions, V8JsEngine};
use crate::policy;
use crate::worker::Worker;

/// Exit code used when the syscall filter cannot be installed.
const EXIT_NO_SANDBOX: i32 = 70;

/// Serve host calls over `control` until the host stops us or goes away.
///
/// This is the first and only thing a worker child runs after the fork.
/// Inherited descriptors other than the two channels are closed and the
/// syscall filter is installed before the first frame is read, so no
/// untrusted code ever executes unconfined or with a view of the parent's
/// descriptor table.
pub fn sandbox_main(control: OwnedFd, binding: Option<OwnedFd>) -> ! {
    close_inherited_descriptors(&[
        control.as_raw_fd(),
        binding.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1),
    ]);
    if let Err(error) = policy::install() {
        tracing::error!(%error, "could not install the syscall filter");
        std::process::exit(EXIT_NO_SANDBOX);
    }

    let mut channel = UnixStream::from(control);
    let mut binding = binding;
    let mut worker: Option<Worker> = None;
    loop {
        let envelope: HostToWorker = match recv_message(&mut channel) {
            Ok(envelope) => envelope,
            // The host dropped its end; nothing left to serve.
            Err(_) => std::process::exit(0),
        };
        let (reply, exit_after_reply) = handle_call(&mut worker, &mut binding, envelope.call);
        if send_message(&mut channel, &reply).is_err() {
            std::process::exit(0);
        }
        if exit_after_reply {
            std::process::exit(0);
        }
    }
}

#[cfg(target_os = "linux")]
fn close_inherited_descriptors(keep: &[std::os::fd::RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    let mut stale = Vec::new();
    for entry in entries.flatten() {
        if let Some(fd) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<std::os::fd::RawFd>().ok())
        {
            if fd > 2 && !keep.contains(&fd) {
                stale.push(fd);
            }
        }
    }
    for fd in stale {
        // The directory descriptor itself is in the list; by now it is
        // already closed and the call just reports EBADF.
        unsafe { libc::close(fd) };
    }
}

#[cfg(not(target_os = "linux"))]
fn close_inherited_descriptors(_keep: &[std::os::fd::RawFd]) {}

fn handle_call(
    worker: &mut Option<Worker>,
    binding: &mut Option<OwnedFd>,
    call: Option<Call>,
) -> (WorkerRunReply, bool) {
    match call {
        Some(Call::Init(params)) => (init_worker(worker, binding, params), false),
        Some(Call::Run(_)) => match worker {
            Some(_) => (ok_reply(), false),
            None => (
                error_reply(StatusKind::SandboxNotInitialized, "run before init"),
                false,
            ),
        },
        Some(Call::RunCode(request)) => (run_code(worker, &request), false),
        Some(Call::Stop(_)) => (ok_reply(), true),
        None => (
            error_reply(StatusKind::InvalidArgument, "empty call envelope"),
            false,
        ),
    }
}

fn init_worker(
    worker: &mut Option<Worker>,
    binding: &mut Option<OwnedFd>,
    params: WorkerInitParams,
) -> WorkerRunReply {
    if params.engine != Engine::V8 as i32 {
        return error_reply(
            StatusKind::InvalidArgument,
            format!("unsupported engine selection {}", params.engine),
        );
    }
    crate::engine::one_time_setup(&SetupOptions {
        max_wasm_memory_pages: params.max_wasm_memory_pages,
    });

    let visitors = match (params.binding_names.is_empty(), binding.take()) {
        (false, Some(channel)) => {
            if params.binding_channel_fd != channel.as_raw_fd() {
                return error_reply(
                    StatusKind::SandboxInitFailed,
                    "binding channel descriptor does not match the inherited one",
                );
            }
            vec![FunctionBindingVisitor::new(
                params.binding_names.clone(),
                Arc::new(ChannelInvoker::new(UnixStream::from(channel))),
            )]
        }
        (false, None) => {
            return error_reply(
                StatusKind::SandboxInitFailed,
                "binding names configured without a binding channel",
            );
        }
        (true, _) => Vec::new(),
    };

    let engine = V8JsEngine::new(EngineOptions {
        initial_heap_mib: params.initial_heap_mib,
        max_heap_mib: params.max_heap_mib,
        visitors,
    });
    *worker = Some(Worker::new(
        engine,
        params.require_code_preload,
        params.context_cache_capacity as usize,
    ));
    ok_reply()
}

fn run_code(worker: &mut Option<Worker>, request: &WorkerRunRequest) -> WorkerRunReply {
    let Some(worker) = worker.as_mut() else {
        return error_reply(StatusKind::SandboxNotInitialized, "run_code before init");
    };
    let started = Instant::now();
    match worker.run_code(request) {
        Ok(response) => WorkerRunReply {
            status: StatusKind::Ok as i32,
            message: String::new(),
            response,
            engine_elapsed_ns: started.elapsed().as_nanos() as u64,
        },
        Err(error) => WorkerRunReply {
            status: error.kind as i32,
            message: error.message,
            response: String::new(),
            engine_elapsed_ns: started.elapsed().as_nanos() as u64,
        },
    }
}

fn ok_reply() -> WorkerRunReply {
    WorkerRunReply {
        status: StatusKind::Ok as i32,
        ..Default::default()
    }
}

fn error_reply(kind: StatusKind, message: impl Into<String>) -> WorkerRunReply {
    WorkerRunReply {
        status: kind as i32,
        message: message.into(),
        ..Default::default()
    }
}
