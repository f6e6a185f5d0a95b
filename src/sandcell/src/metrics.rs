/*!
Metric names and guards used by the host-side runtime.
*/

// Gauge, workers currently alive; counter, workers spawned over the
// process lifetime.
pub(crate) static METRIC_ACTIVE_WORKERS: &str = "active_sandbox_workers";
pub(crate) static METRIC_TOTAL_WORKERS: &str = "sandbox_workers_total";

// Counter, transparent restarts after a detected crash.
pub(crate) static METRIC_WORKER_RESTARTS: &str = "sandbox_worker_restarts_total";

// Counter, broadcasts that were queued across the whole pool.
pub(crate) static METRIC_BROADCASTS: &str = "code_broadcasts_total";

// Histograms, one run-code call timed from outside the sandbox (includes
// serialization overhead) and from inside the engine.
pub(crate) static METRIC_SANDBOXED_RUN_DURATION: &str = "sandboxed_code_run_duration_us";
pub(crate) static METRIC_ENGINE_RUN_DURATION: &str = "code_run_duration_us";

/// Drop guard tracking one worker's slot in the active-workers gauge.
pub(crate) struct WorkerMetricsGuard(());

impl WorkerMetricsGuard {
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_WORKERS).increment(1);
        metrics::counter!(METRIC_TOTAL_WORKERS).increment(1);
        Self(())
    }
}

impl Drop for WorkerMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_WORKERS).decrement(1);
    }
}
