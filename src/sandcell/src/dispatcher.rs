//! Round-robin dispatch across the worker pool.
//!
//! Admission control is two atomics on the hot path: an in-flight counter
//! against the configured cap and a dispatch-allowed flag that broadcasts
//! flip while they quiesce the pool. No locks are taken to admit a
//! request.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sandcell_common::{Error, Result, StatusKind, WorkerRunRequest};
use tracing::{Level, instrument};

use crate::executor::Executor;
use crate::metrics::METRIC_BROADCASTS;
use crate::pool::WorkerPool;
use crate::request::{
    CodeObject, InvocationRequest, ResponseObject, code_object_worker_request,
    invocation_worker_request, validate_code_object, validate_invocation,
};

/// Per-request completion callback; invoked exactly once.
pub type Callback = Box<dyn FnOnce(Result<ResponseObject>) + Send + 'static>;
/// Batch completion callback; invoked exactly once with per-item results
/// in submission order.
pub type BatchCallback = Box<dyn FnOnce(Vec<Result<ResponseObject>>) + Send + 'static>;

/// A request the dispatcher can admit: validated up front, then converted
/// into the wire form a worker executes.
pub trait DispatchRequest: Clone + Send + 'static {
    /// Identifier echoed into the response object.
    fn id(&self) -> &str;
    /// Shape check run before admission.
    fn validate(&self) -> Result<()>;
    /// The wire form sent to a worker.
    fn to_worker_request(&self) -> WorkerRunRequest;
}

impl DispatchRequest for CodeObject {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        validate_code_object(self)
    }

    fn to_worker_request(&self) -> WorkerRunRequest {
        code_object_worker_request(self)
    }
}

impl<Input> DispatchRequest for InvocationRequest<Input>
where
    Input: AsRef<str> + Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        validate_invocation(self)
    }

    fn to_worker_request(&self) -> WorkerRunRequest {
        invocation_worker_request(self)
    }
}

/// The thread-safe front door: round-robins requests over the pool,
/// bounds the number in flight, and serializes broadcasts against all
/// other dispatch activity.
pub struct Dispatcher {
    executor: Executor,
    pool: Arc<WorkerPool>,
    worker_index: AtomicUsize,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    allow_dispatch: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(pool: Arc<WorkerPool>, executor: Executor, max_pending: usize) -> Self {
        Self {
            executor,
            pool,
            worker_index: AtomicUsize::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            allow_dispatch: AtomicBool::new(true),
        }
    }

    /// Enqueue one request for asynchronous execution.
    ///
    /// Admission fails with [`StatusKind::DispatchDisallowed`] while a
    /// broadcast is in flight and with [`StatusKind::CapacityExhausted`]
    /// at the in-flight cap. Once admitted, `callback` fires exactly once.
    pub fn dispatch<R: DispatchRequest>(&self, request: R, callback: Callback) -> Result<()> {
        if !self.allow_dispatch.load(Ordering::Acquire) {
            return Err(Error::new(
                StatusKind::DispatchDisallowed,
                "a code broadcast is in progress",
            ));
        }
        self.internal_dispatch(request, callback)
    }

    /// Enqueue every request of a batch, retrying transient admission
    /// failures per item, and fire `batch_callback` once all items have
    /// completed. Response order matches submission order.
    pub fn dispatch_batch<R: DispatchRequest>(
        &self,
        batch: Vec<R>,
        batch_callback: BatchCallback,
    ) -> Result<()> {
        if !self.allow_dispatch.load(Ordering::Acquire) {
            return Err(Error::new(
                StatusKind::DispatchDisallowed,
                "a code broadcast is in progress",
            ));
        }
        if batch.is_empty() {
            batch_callback(Vec::new());
            return Ok(());
        }

        let outcome = BatchOutcome::new(batch.len(), batch_callback);
        for (index, request) in batch.into_iter().enumerate() {
            loop {
                let outcome = Arc::clone(&outcome);
                let item_callback: Callback = Box::new(move |result| {
                    outcome.record(index, result);
                });
                match self.dispatch(request.clone(), item_callback) {
                    Ok(()) => break,
                    // Capacity and broadcast windows pass; everything else
                    // is a real failure for the whole batch call.
                    Err(error)
                        if matches!(
                            error.kind,
                            StatusKind::CapacityExhausted | StatusKind::DispatchDisallowed
                        ) =>
                    {
                        std::thread::yield_now();
                    }
                    Err(error) => return Err(error),
                }
            }
        }
        Ok(())
    }

    /// Queue one load of `code_object` on every worker in the pool.
    ///
    /// Serialized against all other dispatch activity: new dispatches are
    /// refused while the broadcast is queued, and the broadcast waits for
    /// the in-flight count to reach zero before touching any worker.
    /// `callback` fires exactly once, with the first failure if any
    /// worker failed, otherwise with the first success.
    #[instrument(err(Debug), skip(self, code_object, callback), level = Level::INFO)]
    pub fn broadcast(&self, code_object: CodeObject, callback: Callback) -> Result<()> {
        self.allow_dispatch.store(false, Ordering::Release);
        // Quiesce: nothing may be in flight while workers change code.
        while self.pending.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        // Start from index zero so each worker is hit exactly once before
        // any worker is hit twice.
        self.worker_index.store(0, Ordering::Release);

        let worker_count = self.pool.size();
        let outcome = BroadcastOutcome::new(worker_count, callback);
        for _ in 0..worker_count {
            let outcome = Arc::clone(&outcome);
            let per_worker: Callback = Box::new(move |result| {
                outcome.record(result);
            });
            if let Err(error) = self.internal_dispatch(code_object.clone(), per_worker) {
                self.allow_dispatch.store(true, Ordering::Release);
                return Err(error);
            }
        }
        self.allow_dispatch.store(true, Ordering::Release);
        metrics::counter!(METRIC_BROADCASTS).increment(1);
        Ok(())
    }

    fn internal_dispatch<R: DispatchRequest>(&self, request: R, callback: Callback) -> Result<()> {
        request.validate()?;

        // Reserve a slot; the counter can never overshoot the cap.
        let max_pending = self.max_pending;
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < max_pending).then_some(pending + 1)
            })
            .is_err()
        {
            return Err(Error::new(
                StatusKind::CapacityExhausted,
                "too many requests in flight",
            ));
        }

        let index = self.worker_index.fetch_add(1, Ordering::Relaxed) % self.pool.size();
        let pool = Arc::clone(&self.pool);
        let pending = Arc::clone(&self.pending);
        let id = request.id().to_string();
        let worker_request = request.to_worker_request();

        let job = Box::new(move || {
            let result = pool.worker(index).and_then(|worker| {
                worker.run_code(&worker_request).map(|reply| ResponseObject {
                    id,
                    resp: reply.response,
                })
            });
            callback(result);
            pending.fetch_sub(1, Ordering::AcqRel);
        });
        if let Err(error) = self.executor.schedule(job) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(error);
        }
        Ok(())
    }

    /// Refuse new work and drain the executor.
    pub(crate) fn stop(&mut self) {
        self.allow_dispatch.store(false, Ordering::Release);
        self.executor.stop();
    }
}

/// Collects per-item results and fires the batch callback exactly once.
struct BatchOutcome {
    slots: Vec<Mutex<Option<Result<ResponseObject>>>>,
    remaining: AtomicUsize,
    callback: Mutex<Option<BatchCallback>>,
}

impl BatchOutcome {
    fn new(size: usize, callback: BatchCallback) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            remaining: AtomicUsize::new(size),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn record(&self, index: usize, result: Result<ResponseObject>) {
        if let Ok(mut slot) = self.slots[index].lock() {
            *slot = Some(result);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let responses = self
            .slots
            .iter()
            .map(|slot| {
                slot.lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(|| {
                        Err(Error::new(StatusKind::Internal, "missing batch response"))
                    })
            })
            .collect();
        if let Ok(mut callback) = self.callback.lock() {
            if let Some(callback) = callback.take() {
                callback(responses);
            }
        }
    }
}

/// Collects per-worker load results and fires the broadcast callback
/// exactly once: first failure wins, otherwise the first success.
struct BroadcastOutcome {
    slots: Vec<Mutex<Option<Result<ResponseObject>>>>,
    remaining: AtomicUsize,
    callback: Mutex<Option<Callback>>,
}

impl BroadcastOutcome {
    fn new(size: usize, callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            remaining: AtomicUsize::new(size),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn record(&self, result: Result<ResponseObject>) {
        // Any free slot will do; completion order is not meaningful here.
        let mut result = Some(result);
        for slot in &self.slots {
            if let Ok(mut slot) = slot.lock() {
                if slot.is_none() {
                    *slot = result.take();
                    break;
                }
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut first_success = None;
        let mut first_failure = None;
        for slot in &self.slots {
            let Ok(mut slot) = slot.lock() else { continue };
            match slot.take() {
                Some(Err(error)) if first_failure.is_none() => first_failure = Some(error),
                Some(Ok(response)) if first_success.is_none() => first_success = Some(response),
                _ => {}
            }
        }
        let outcome = match (first_failure, first_success) {
            (Some(error), _) => Err(error),
            (None, Some(response)) => Ok(response),
            (None, None) => Err(Error::new(StatusKind::Internal, "broadcast lost its results")),
        };
        if let Ok(mut callback) = self.callback.lock() {
            if let Some(callback) = callback.take() {
                callback(outcome);
            }
        }
    }
}
