//! The host-side API to one worker running in a separate address space.
//!
//! Each stub owns exactly one child process. The child is forked with a
//! fresh control socket, installs its syscall allow-list before reading
//! the first frame, and then serves framed init/run/run-code/stop calls.
//! If the transport fails mid-call the child is considered crashed: the
//! stub reaps it, spawns a replacement, re-sends init and run, and reports
//! the interrupted request with a retry disposition; it is never
//! resubmitted on the caller's behalf.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::time::Instant;

use nix::sys::signal::{Signal, kill};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork};
use sandcell_common::{
    Engine, Error, HostToWorker, Result, RunWorker, StatusKind, StopWorker, WorkerInitParams,
    WorkerRunReply, WorkerRunRequest, host_to_worker::Call, recv_message, send_message,
};
use tracing::{Level, instrument};

use crate::metrics::{
    METRIC_ENGINE_RUN_DURATION, METRIC_SANDBOXED_RUN_DURATION, METRIC_WORKER_RESTARTS,
    WorkerMetricsGuard,
};

pub(crate) struct WorkerSandboxOptions {
    pub(crate) engine: Engine,
    pub(crate) require_preload: bool,
    pub(crate) context_cache_capacity: usize,
    pub(crate) initial_heap_mib: u64,
    pub(crate) max_heap_mib: u64,
    pub(crate) max_wasm_memory_pages: u64,
    pub(crate) binding_names: Vec<String>,
    /// Sandbox end of the binding channel; kept for the life of the stub
    /// so replacement children inherit the same descriptor.
    pub(crate) binding_channel: Option<OwnedFd>,
}

struct ChildProcess {
    pid: Pid,
    channel: UnixStream,
}

struct SandboxState {
    child: Option<ChildProcess>,
    binding_channel: Option<OwnedFd>,
}

/// Host-side stub owning one sandboxed worker child.
pub(crate) struct WorkerSandboxApi {
    engine: Engine,
    require_preload: bool,
    context_cache_capacity: usize,
    initial_heap_mib: u64,
    max_heap_mib: u64,
    max_wasm_memory_pages: u64,
    binding_names: Vec<String>,
    // One call in flight per sandbox; concurrency lives above, in the
    // dispatcher and its thread pool.
    state: Mutex<SandboxState>,
    _metrics: Option<WorkerMetricsGuard>,
}

impl WorkerSandboxApi {
    pub(crate) fn new(options: WorkerSandboxOptions) -> Self {
        Self {
            engine: options.engine,
            require_preload: options.require_preload,
            context_cache_capacity: options.context_cache_capacity,
            initial_heap_mib: options.initial_heap_mib,
            max_heap_mib: options.max_heap_mib,
            max_wasm_memory_pages: options.max_wasm_memory_pages,
            binding_names: options.binding_names,
            state: Mutex::new(SandboxState {
                child: None,
                binding_channel: options.binding_channel,
            }),
            _metrics: None,
        }
    }

    /// Record this stub in the worker gauges once it joins a pool.
    pub(crate) fn with_metrics(mut self) -> Self {
        self._metrics = Some(WorkerMetricsGuard::new());
        self
    }

    /// Terminate any previous child, spawn a replacement and initialize it.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub(crate) fn init(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.init_locked(&mut state)
    }

    /// Tell the worker to start serving.
    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    pub(crate) fn run(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.child.is_none() {
            return Err(Error::new(
                StatusKind::SandboxNotInitialized,
                "run before init",
            ));
        }
        Self::exchange(&mut state, &Call::Run(RunWorker {}))
            .map_err(|_| Error::new(StatusKind::SandboxIpcFailed, "run call failed"))
            .and_then(reply_to_result)
            .map(|_| ())
    }

    /// Run one load or execute request inside the sandbox.
    #[instrument(err(Debug), skip(self, request), level = Level::TRACE)]
    pub(crate) fn run_code(&self, request: &WorkerRunRequest) -> Result<WorkerRunReply> {
        let mut state = self.lock_state()?;
        if state.child.is_none() {
            return Err(Error::new(
                StatusKind::SandboxNotInitialized,
                "run_code before init",
            ));
        }
        let started = Instant::now();
        match Self::exchange(&mut state, &Call::RunCode(request.clone())) {
            Ok(reply) => {
                metrics::histogram!(METRIC_SANDBOXED_RUN_DURATION)
                    .record(started.elapsed().as_micros() as f64);
                metrics::histogram!(METRIC_ENGINE_RUN_DURATION)
                    .record(reply.engine_elapsed_ns as f64 / 1_000.0);
                reply_to_result(reply)
            }
            // The child died mid-call. Restart it and hand the decision to
            // retry back to the caller.
            Err(transport_error) => {
                tracing::warn!(%transport_error, "worker crashed; restarting");
                metrics::counter!(METRIC_WORKER_RESTARTS).increment(1);
                self.init_locked(&mut state)?;
                Self::exchange(&mut state, &Call::Run(RunWorker {}))
                    .map_err(|_| {
                        Error::new(StatusKind::SandboxInitFailed, "restarted worker did not run")
                    })
                    .and_then(reply_to_result)?;
                Err(Error::new(
                    StatusKind::WorkerCrashed,
                    "the worker crashed while handling the request; it has been restarted",
                ))
            }
        }
    }

    /// Stop and terminate the child. Idempotent; also closes the binding
    /// channel so its host-side reader drains out.
    #[instrument(skip(self), level = Level::INFO)]
    pub(crate) fn stop(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.child.is_some() {
            // Best effort: a healthy child exits on its own, a wedged one
            // is killed below.
            let _ = Self::exchange(&mut state, &Call::Stop(StopWorker {}));
        }
        terminate_child(&mut state);
        state.binding_channel = None;
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, SandboxState>> {
        self.state
            .lock()
            .map_err(|_| Error::new(StatusKind::Internal, "sandbox state lock poisoned"))
    }

    fn init_locked(&self, state: &mut SandboxState) -> Result<()> {
        terminate_child(state);

        let (parent_end, child_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|errno| {
            Error::new(
                StatusKind::SandboxInitFailed,
                format!("could not create the control channel: {errno}"),
            )
        })?;

        // The child inherits the binding channel descriptor along with the
        // rest of the descriptor table; its number is what we announce in
        // the init message.
        let binding_channel_fd = state
            .binding_channel
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or(-1);

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(parent_end);
                // The child's copy of the binding descriptor; the parent
                // keeps its own for later respawns.
                let binding = state.binding_channel.take();
                sandcell_runtime::sandbox_main(child_end, binding)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                state.child = Some(ChildProcess {
                    pid: child,
                    channel: UnixStream::from(parent_end),
                });
            }
            Err(errno) => {
                return Err(Error::new(
                    StatusKind::SandboxInitFailed,
                    format!("could not fork the worker: {errno}"),
                ));
            }
        }

        let params = WorkerInitParams {
            engine: self.engine as i32,
            require_code_preload: self.require_preload,
            binding_channel_fd,
            binding_names: self.binding_names.clone(),
            context_cache_capacity: self.context_cache_capacity as u64,
            initial_heap_mib: self.initial_heap_mib,
            max_heap_mib: self.max_heap_mib,
            max_wasm_memory_pages: self.max_wasm_memory_pages,
        };
        // The init reply doubles as the child's "active" signal.
        let reply = Self::exchange(state, &Call::Init(params)).map_err(|error| {
            terminate_child(state);
            Error::new(
                StatusKind::SandboxInitFailed,
                format!("worker did not become active: {error}"),
            )
        })?;
        reply_to_result(reply).map(|_| ())
    }

    fn exchange(state: &mut SandboxState, call: &Call) -> std::io::Result<WorkerRunReply> {
        let Some(child) = state.child.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no child process",
            ));
        };
        let envelope = HostToWorker {
            call: Some(call.clone()),
        };
        send_message(&mut child.channel, &envelope)?;
        recv_message(&mut child.channel)
    }
}

impl Drop for WorkerSandboxApi {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            terminate_child(&mut state);
        }
    }
}

fn terminate_child(state: &mut SandboxState) {
    if let Some(child) = state.child.take() {
        drop(child.channel);
        let _ = kill(child.pid, Signal::SIGKILL);
        // Reap; this also doubles as the wait-until-inactive barrier.
        let _ = waitpid(child.pid, None);
    }
}

fn reply_to_result(reply: WorkerRunReply) -> Result<WorkerRunReply> {
    match StatusKind::from_i32(reply.status) {
        StatusKind::Ok => Ok(reply),
        kind => Err(Error::new(kind, reply.message)),
    }
}
