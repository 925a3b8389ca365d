use super::{Dispatch, Executor};
use crate::errors::VipError;
use crate::task::{CancelOutcome, Completion, Task, TaskId, Tcb, TcbStatus};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// The only control block of one device.
struct Lane {
    tcb: Tcb,

    /// Held for the whole submission of a range so two callers don't
    /// interleave their subtasks.
    submit: Mutex<()>,

    /// Only one thread at a time waits on the hardware.
    waiting: Mutex<()>,
}

/// Synchronous dispatch: no queue and no thread, the submitting and waiting
/// callers drive the hardware themselves.
pub(crate) struct Single {
    executor: Arc<Executor>,
    lanes: Vec<Lane>,
}

impl fmt::Debug for Single {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single")
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

impl Single {
    pub(crate) fn new(executor: Arc<Executor>) -> Self {
        let lanes = executor
            .devices()
            .iter()
            .map(|_| Lane {
                tcb: Tcb::new(),
                submit: Mutex::new(()),
                waiting: Mutex::new(()),
            })
            .collect();

        Self { executor, lanes }
    }

    fn lane(&self, device: usize) -> Result<&Lane, VipError> {
        self.lanes
            .get(device)
            .ok_or_else(|| VipError::invalid(format!("device {} does not exist", device)))
    }

    fn lane_of(&self, id: TaskId) -> Result<&Lane, VipError> {
        self.lanes
            .iter()
            .find(|lane| lane.tcb.task().is_some_and(|task| task.id == id))
            .ok_or_else(|| VipError::invalid(format!("task {} was not submitted", id)))
    }

    /// Drives the hardware of `lane` until the job completes or `timeout`
    /// passes, whichever comes first. A caller giving up leaves the job
    /// running on its own budget for the next waiter to pick up.
    fn drive(&self, lane: &Lane, timeout: Option<Duration>) -> Result<Completion, VipError> {
        let until = timeout.map(|t| Instant::now() + t);

        {
            let waiting = match until {
                Some(until) => lane.waiting.try_lock_until(until),
                None => Some(lane.waiting.lock()),
            };

            if waiting.is_some() && lane.tcb.job().is_some() {
                self.executor.finish_until(&lane.tcb, until);
            }
        }

        lane.tcb
            .wait(until.map(|until| until.saturating_duration_since(Instant::now())))
    }
}

impl Dispatch for Single {
    /// Every subtask but the last is waited inline. A canceled subtask ends
    /// the range early.
    fn submit(&self, tasks: &[Task], time_out: Duration, _priority: u32) -> Result<(), VipError> {
        let Some(first) = tasks.first() else {
            return Ok(());
        };

        let lane = self.lane(first.device)?;
        let _submit = lane.submit.lock();

        for (i, task) in tasks.iter().enumerate() {
            lane.tcb.prepare(*task, time_out)?;
            self.executor.start(&lane.tcb);

            if i + 1 == tasks.len() {
                break;
            }

            if self.drive(lane, None)? == Completion::Canceled {
                debug!(task = %task.id, "range canceled, remaining subtasks dropped");
                break;
            }
        }

        Ok(())
    }

    fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<Completion, VipError> {
        self.drive(self.lane_of(id)?, timeout)
    }

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, VipError> {
        self.executor.cancel(&self.lane_of(id)?.tcb)
    }

    fn status(&self, id: TaskId) -> Option<TcbStatus> {
        self.lane_of(id).ok().map(|lane| lane.tcb.status())
    }

    fn release(&self, id: TaskId, force: bool) {
        if let Ok(lane) = self.lane_of(id) {
            lane.tcb.retire(force);
        }
    }

    fn shutdown(&self) {}
}
