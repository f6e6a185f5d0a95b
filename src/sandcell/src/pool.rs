//! Fixed-size pool of worker sandbox stubs.
//!
//! The pool owns the stubs and guarantees stable indices for its lifetime;
//! it does no load balancing, since worker selection is the dispatcher's job.

use sandcell_common::{Error, Result};
use tracing::{Level, instrument};

use crate::sandbox::WorkerSandboxApi;

/// A fixed collection of sandboxed workers addressed by index.
pub struct WorkerPool {
    workers: Vec<WorkerSandboxApi>,
}

impl WorkerPool {
    pub(crate) fn new(workers: Vec<WorkerSandboxApi>) -> Self {
        Self { workers }
    }

    /// Number of workers; indices `0..size()` are valid for the pool's
    /// whole lifetime.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker(&self, index: usize) -> Result<&WorkerSandboxApi> {
        self.workers.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "worker index {index} out of range for a pool of {}",
                self.workers.len()
            ))
        })
    }

    /// Initialize every member; the first failure aborts the sequence.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub(crate) fn init(&self) -> Result<()> {
        for worker in &self.workers {
            worker.init()?;
        }
        Ok(())
    }

    /// Start every member; the first failure aborts the sequence.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub(crate) fn run(&self) -> Result<()> {
        for worker in &self.workers {
            worker.run()?;
        }
        Ok(())
    }

    /// Stop every member; the first failure aborts the sequence (remaining
    /// children are still reaped when the pool drops).
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub(crate) fn stop(&self) -> Result<()> {
        for worker in &self.workers {
            worker.stop()?;
        }
        Ok(())
    }
}
