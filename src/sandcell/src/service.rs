//! The top-level service owning the dispatcher, the pool and the binding
//! readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use sandcell_common::Result;
use tracing::{Level, instrument};

use crate::binding::{self, BindingFn};
use crate::config::Config;
use crate::dispatcher::{BatchCallback, Callback, DispatchRequest, Dispatcher};
use crate::executor::Executor;
use crate::pool::WorkerPool;
use crate::request::CodeObject;
use crate::sandbox::{WorkerSandboxApi, WorkerSandboxOptions};

/// An initialized runtime: a pool of sandboxed workers behind one
/// dispatcher.
///
/// ```no_run
/// use sandcell::{CodeObject, Config, InvocationRequestOwned, RuntimeService};
///
/// let mut service = RuntimeService::new(Config::default())?;
/// service.init()?;
/// service.run()?;
///
/// let code = CodeObject {
///     id: "greeter".to_string(),
///     version: 1,
///     js: r#"function Handler(name) { return "Hello " + name; }"#.to_string(),
///     ..Default::default()
/// };
/// service.broadcast(code, Box::new(|result| {
///     assert!(result.is_ok());
/// }))?;
///
/// let request = InvocationRequestOwned {
///     id: "req-1".to_string(),
///     version: 1,
///     handler_name: "Handler".to_string(),
///     input: vec!["\"world\"".to_string()],
///     ..Default::default()
/// };
/// service.dispatch(request, Box::new(|result| {
///     println!("{:?}", result);
/// }))?;
///
/// service.stop()?;
/// # Ok::<(), sandcell::Error>(())
/// ```
pub struct RuntimeService {
    dispatcher: Dispatcher,
    pool: Arc<WorkerPool>,
    binding_readers: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl RuntimeService {
    /// Build the pool and dispatcher described by `config`. Workers are
    /// not spawned until [`init`](Self::init).
    #[instrument(err(Debug), skip(config), level = Level::INFO)]
    pub fn new(config: Config) -> Result<Self> {
        let worker_count = if config.worker_count == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            config.worker_count
        };

        let binding_names: Vec<String> = config
            .function_bindings
            .iter()
            .map(|binding| binding.name.clone())
            .collect();
        // Same-name registrations overwrite earlier ones.
        let bindings: Arc<HashMap<String, BindingFn>> = Arc::new(
            config
                .function_bindings
                .iter()
                .map(|binding| (binding.name.clone(), Arc::clone(&binding.function)))
                .collect(),
        );

        let mut workers = Vec::with_capacity(worker_count);
        let mut binding_readers = Vec::new();
        for index in 0..worker_count {
            let binding_channel = if bindings.is_empty() {
                None
            } else {
                let (host_end, sandbox_end) = binding::channel_pair()?;
                binding_readers.push(binding::spawn_reader(
                    index,
                    host_end,
                    Arc::clone(&bindings),
                )?);
                Some(sandbox_end)
            };
            workers.push(
                WorkerSandboxApi::new(WorkerSandboxOptions {
                    engine: config.engine,
                    require_preload: config.require_preload,
                    context_cache_capacity: config.context_cache_capacity,
                    initial_heap_mib: config.initial_heap_mib,
                    max_heap_mib: config.max_heap_mib,
                    max_wasm_memory_pages: config.max_wasm_memory_pages,
                    binding_names: binding_names.clone(),
                    binding_channel,
                })
                .with_metrics(),
            );
        }

        let pool = Arc::new(WorkerPool::new(workers));
        let executor = Executor::new(worker_count, config.worker_queue_cap);
        let dispatcher = Dispatcher::new(Arc::clone(&pool), executor, config.max_pending_requests);
        Ok(Self {
            dispatcher,
            pool,
            binding_readers,
            stopped: false,
        })
    }

    /// Spawn and initialize every worker.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn init(&self) -> Result<()> {
        self.pool.init()
    }

    /// Start serving; workers accept run-code calls afterwards.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn run(&self) -> Result<()> {
        self.pool.run()
    }

    /// Stop dispatching, drain in-flight work, terminate the workers and
    /// join the binding readers. Idempotent.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.dispatcher.stop();
        let result = self.pool.stop();
        for reader in self.binding_readers.drain(..) {
            let _ = reader.join();
        }
        result
    }

    /// See [`Dispatcher::dispatch`].
    pub fn dispatch<R: DispatchRequest>(&self, request: R, callback: Callback) -> Result<()> {
        self.dispatcher.dispatch(request, callback)
    }

    /// See [`Dispatcher::dispatch_batch`].
    pub fn dispatch_batch<R: DispatchRequest>(
        &self,
        batch: Vec<R>,
        batch_callback: BatchCallback,
    ) -> Result<()> {
        self.dispatcher.dispatch_batch(batch, batch_callback)
    }

    /// See [`Dispatcher::broadcast`].
    pub fn broadcast(&self, code_object: CodeObject, callback: Callback) -> Result<()> {
        self.dispatcher.broadcast(code_object, callback)
    }

    /// The dispatcher, for callers that hold it directly.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The worker pool, mainly for its size.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl Drop for RuntimeService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
