//! Bounded thread pool driving all host-side work.
//!
//! Dispatch admission happens before a job reaches the queue, so the queue
//! bound is a second line of defense; a full queue surfaces as
//! [`StatusKind::CapacityExhausted`] just like the in-flight cap.

use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError, bounded};
use sandcell_common::{Error, Result, StatusKind};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Executor {
    queue: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    pub(crate) fn new(thread_count: usize, queue_cap: usize) -> Self {
        let (queue, jobs) = bounded::<Job>(queue_cap.max(1));
        let mut threads = Vec::with_capacity(thread_count.max(1));
        for index in 0..thread_count.max(1) {
            let jobs = jobs.clone();
            let builder = std::thread::Builder::new().name(format!("sandcell-exec-{index}"));
            match builder.spawn(move || {
                while let Ok(job) = jobs.recv() {
                    job();
                }
            }) {
                Ok(handle) => threads.push(handle),
                Err(error) => {
                    tracing::error!(%error, index, "could not spawn an executor thread");
                }
            }
        }
        Self {
            queue: Some(queue),
            threads,
        }
    }

    pub(crate) fn schedule(&self, job: Job) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Err(Error::new(StatusKind::Internal, "executor is stopped"));
        };
        queue.try_send(job).map_err(|error| match error {
            TrySendError::Full(_) => {
                Error::new(StatusKind::CapacityExhausted, "executor queue is full")
            }
            TrySendError::Disconnected(_) => Error::new(StatusKind::Internal, "executor is stopped"),
        })
    }

    /// Stop accepting work, drain the queue and join the threads.
    pub(crate) fn stop(&mut self) {
        self.queue = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn jobs_run_and_stop_drains() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut executor = Executor::new(2, 16);
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            executor
                .schedule(Box::new(move || {
                    ran.fetch_add(1, Ordering::AcqRel);
                }))
                .unwrap();
        }
        executor.stop();
        assert_eq!(ran.load(Ordering::Acquire), 8);
    }

    #[test]
    fn full_queue_reports_capacity_exhausted() {
        let executor = Executor::new(1, 1);
        // Park the only thread, then fill the one queue slot.
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        executor
            .schedule(Box::new(move || {
                let _ = block_rx.recv();
            }))
            .unwrap();
        while executor.schedule(Box::new(|| {})).is_ok() {}
        let error = executor.schedule(Box::new(|| {})).unwrap_err();
        assert_eq!(error.kind, StatusKind::CapacityExhausted);
        drop(block_tx);
    }
}
