//! Per-isolate execution watchdog.
//!
//! One dedicated thread per engine. While armed it sleeps until the
//! deadline; if the deadline passes before [`ExecutionWatchdog::disarm`]
//! is called it requests termination through the isolate's thread-safe
//! handle, which interrupts script execution at the next safepoint. The
//! timer can be armed and disarmed repeatedly over the life of the
//! isolate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
enum TimerState {
    Idle,
    Armed { deadline: Instant },
    Stopping,
}

struct Shared {
    state: Mutex<TimerState>,
    signal: Condvar,
    fired: AtomicBool,
}

/// Watchdog thread bound to a single isolate.
///
/// Holds only the isolate's thread-safe handle, never the isolate itself;
/// the engine stops the watchdog before disposing the isolate.
pub struct ExecutionWatchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionWatchdog {
    /// Spawn the watchdog thread for the isolate behind `handle`.
    pub fn new(handle: v8::IsolateHandle) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::Idle),
            signal: Condvar::new(),
            fired: AtomicBool::new(false),
        });
        let thread = std::thread::Builder::new()
            .name("sandcell-watchdog".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || watch(&shared, &handle)
            })
            .ok();
        if thread.is_none() {
            tracing::error!("failed to spawn watchdog thread; executions will not time out");
        }
        Self { shared, thread }
    }

    /// Arm the deadline for the execution that is about to start.
    pub fn arm(&self, timeout: Duration) {
        self.shared.fired.store(false, Ordering::Release);
        if let Ok(mut state) = self.shared.state.lock() {
            *state = TimerState::Armed {
                deadline: Instant::now() + timeout,
            };
        }
        self.shared.signal.notify_one();
    }

    /// Disarm the deadline; called when the execution finished on its own.
    pub fn disarm(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if !matches!(*state, TimerState::Stopping) {
                *state = TimerState::Idle;
            }
        }
        self.shared.signal.notify_one();
    }

    /// Whether the watchdog terminated the last armed execution. Clears the
    /// flag so the next execution starts clean.
    pub fn take_fired(&self) -> bool {
        self.shared.fired.swap(false, Ordering::AcqRel)
    }

    fn stop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            *state = TimerState::Stopping;
        }
        self.shared.signal.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ExecutionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(shared: &Shared, handle: &v8::IsolateHandle) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    loop {
        match *state {
            TimerState::Stopping => return,
            TimerState::Idle => {
                state = match shared.signal.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
            TimerState::Armed { deadline } => {
                let now = Instant::now();
                if now >= deadline {
                    shared.fired.store(true, Ordering::Release);
                    handle.terminate_execution();
                    *state = TimerState::Idle;
                    continue;
                }
                state = match shared.signal.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(_) => return,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;

    fn test_isolate() -> v8::OwnedIsolate {
        engine::one_time_setup(&engine::SetupOptions::default());
        v8::Isolate::new(v8::CreateParams::default())
    }

    #[test]
    fn disarm_before_deadline_does_not_fire() {
        let isolate = test_isolate();
        let watchdog = ExecutionWatchdog::new(isolate.thread_safe_handle());
        watchdog.arm(Duration::from_millis(200));
        watchdog.disarm();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!watchdog.take_fired());
    }

    #[test]
    fn deadline_fires_and_flag_is_cleared_on_read() {
        let isolate = test_isolate();
        let watchdog = ExecutionWatchdog::new(isolate.thread_safe_handle());
        watchdog.arm(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(200));
        assert!(watchdog.take_fired());
        assert!(!watchdog.take_fired());
    }

    #[test]
    fn watchdog_is_rearmable() {
        let isolate = test_isolate();
        let watchdog = ExecutionWatchdog::new(isolate.thread_safe_handle());
        for _ in 0..3 {
            watchdog.arm(Duration::from_millis(10));
            std::thread::sleep(Duration::from_millis(100));
            assert!(watchdog.take_fired());
        }
    }
}
