//! Driver: the single scheduling thread
//!
//! Alternates one ExecutionCore pass with one LoadPipeline pass and sleeps on
//! the shared work signal when neither has anything to do.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, trace};

use crate::clock::SharedClock;
use crate::error::{panic_message, EngineError};
use crate::loader::LoadPipeline;
use crate::scheduler::ExecutionCore;
use crate::signal::WorkSignal;

/// Longest single idle wait, so a stop request is never missed for long
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Outcome of one pass of a scheduling component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkStatus {
    pub work_was_done: bool,
    pub work_is_pending: bool,
    /// Earliest timed wakeup, or `u64::MAX` for none
    pub next_wakeup: u64,
}

impl WorkStatus {
    pub fn idle() -> Self {
        Self {
            work_was_done: false,
            work_is_pending: false,
            next_wakeup: u64::MAX,
        }
    }

    pub fn merge(self, other: WorkStatus) -> Self {
        Self {
            work_was_done: self.work_was_done || other.work_was_done,
            work_is_pending: self.work_is_pending || other.work_is_pending,
            next_wakeup: self.next_wakeup.min(other.next_wakeup),
        }
    }

    /// Whether the driver may sleep after this pass
    pub fn is_idle(&self) -> bool {
        !self.work_was_done && !self.work_is_pending
    }
}

/// The scheduling components, handed back when the driver stops cleanly
pub struct Components {
    pub core: ExecutionCore,
    pub pipeline: LoadPipeline,
}

pub struct Driver {
    components: Components,
    signal: Arc<WorkSignal>,
    clock: SharedClock,
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(core: ExecutionCore, pipeline: LoadPipeline) -> Self {
        let signal = core.inbox().signal().clone();
        let clock = core.inbox().clock().clone();
        Self {
            components: Components { core, pipeline },
            signal,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One scheduler pass followed by one loader pass
    pub fn run_once(&mut self) -> WorkStatus {
        let Components { core, pipeline } = &mut self.components;
        let status = core.do_work();
        status.merge(pipeline.do_work(core))
    }

    fn wait(&self, status: WorkStatus) {
        if !status.is_idle() {
            return;
        }
        if status.next_wakeup == u64::MAX {
            self.signal.wait_timeout(MAX_IDLE_WAIT);
            return;
        }
        let now = self.clock.now_ms();
        if status.next_wakeup > now {
            let delay = Duration::from_millis(status.next_wakeup - now).min(MAX_IDLE_WAIT);
            trace!(target: "driver", "Idle for {:?}", delay);
            self.signal.wait_timeout(delay);
        }
    }

    /// Start the scheduling thread
    pub fn spawn(mut self) -> Result<DriverHandle, EngineError> {
        let stop = self.stop.clone();
        let terminated = self.terminated.clone();
        let signal = self.signal.clone();

        let thread = thread::Builder::new()
            .name("lumen-driver".into())
            .spawn(move || {
                info!(target: "driver", "Scheduling thread started");
                while !self.stop.load(Ordering::Acquire) {
                    match catch_unwind(AssertUnwindSafe(|| self.run_once())) {
                        Ok(status) => self.wait(status),
                        Err(payload) => {
                            error!(
                                target: "driver",
                                "Scheduling thread terminated: {}",
                                panic_message(payload.as_ref())
                            );
                            self.terminated.store(true, Ordering::Release);
                            return None;
                        }
                    }
                }
                info!(target: "driver", "Scheduling thread stopped");
                Some(self.components)
            })
            .map_err(|source| EngineError::Spawn {
                what: "scheduling thread",
                source,
            })?;

        Ok(DriverHandle {
            stop,
            terminated,
            signal,
            thread,
        })
    }
}

pub struct DriverHandle {
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    signal: Arc<WorkSignal>,
    thread: JoinHandle<Option<Components>>,
}

impl DriverHandle {
    /// True once the thread has died on a scheduler fault
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Ask the thread to finish its current pass and wait for it.
    /// A terminated driver has nothing to hand back.
    pub fn stop(self) -> Result<Components, EngineError> {
        self.stop.store(true, Ordering::Release);
        self.signal.notify();
        match self.thread.join() {
            Ok(Some(components)) => Ok(components),
            Ok(None) => Err(EngineError::Terminated),
            Err(payload) => Err(EngineError::SchedulerFault(panic_message(payload.as_ref()))),
        }
    }
}
