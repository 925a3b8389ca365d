use crate::context::ContextConfig;
use crate::errors::VipError;
use crate::queue::QueueEntry;
use crate::table::{Handle, HandleTable, TableRef};
use crate::task::{CancelOutcome, Completion, Task, TaskId, Tcb, TcbStatus};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

// Exports
pub(crate) mod executor;
pub(crate) use executor::Executor;

mod parallel;
mod serial;
mod single;


/// Threading topology used to drive the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// One TCB per device, the submitting thread drives the hardware.
    Single,

    /// One worker thread per device drains the device queue in order.
    #[default]
    Serial,

    /// One daemon per device hands jobs to one thread per core, so cores of
    /// the same device run different tasks concurrently.
    Parallel,
}

/// Contract shared by every strategy. Submissions are validated by the
/// context before they reach this layer.
pub(crate) trait Dispatch {
    /// Submits consecutive subtasks of one descriptor. Fails without side
    /// effect when the first one is rejected.
    fn submit(&self, tasks: &[Task], time_out: Duration, priority: u32) -> Result<(), VipError>;

    fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<Completion, VipError>;

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, VipError>;

    /// `None` once no control block is reachable under `id`.
    fn status(&self, id: TaskId) -> Option<TcbStatus>;

    /// Forgets the control block of `id`. With `force`, even while running.
    fn release(&self, id: TaskId, force: bool);

    /// Cancels queued work and joins the dispatch threads.
    fn shutdown(&self);
}

#[derive(Debug)]
pub(crate) enum Dispatcher {
    Single(single::Single),
    Serial(serial::Serial),
    Parallel(parallel::Parallel),
}

impl Dispatcher {
    pub(crate) fn new(cfg: &ContextConfig, executor: Arc<Executor>) -> Result<Self> {
        let dispatcher = match cfg.strategy {
            Strategy::Single => Dispatcher::Single(single::Single::new(executor)),
            Strategy::Serial => Dispatcher::Serial(serial::Serial::new(cfg, executor)?),
            Strategy::Parallel => Dispatcher::Parallel(parallel::Parallel::new(cfg, executor)?),
        };

        Ok(dispatcher)
    }
}

impl Dispatch for Dispatcher {
    fn submit(&self, tasks: &[Task], time_out: Duration, priority: u32) -> Result<(), VipError> {
        match self {
            Dispatcher::Single(s) => s.submit(tasks, time_out, priority),
            Dispatcher::Serial(s) => s.submit(tasks, time_out, priority),
            Dispatcher::Parallel(s) => s.submit(tasks, time_out, priority),
        }
    }

    fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<Completion, VipError> {
        match self {
            Dispatcher::Single(s) => s.wait(id, timeout),
            Dispatcher::Serial(s) => s.wait(id, timeout),
            Dispatcher::Parallel(s) => s.wait(id, timeout),
        }
    }

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, VipError> {
        match self {
            Dispatcher::Single(s) => s.cancel(id),
            Dispatcher::Serial(s) => s.cancel(id),
            Dispatcher::Parallel(s) => s.cancel(id),
        }
    }

    fn status(&self, id: TaskId) -> Option<TcbStatus> {
        match self {
            Dispatcher::Single(s) => s.status(id),
            Dispatcher::Serial(s) => s.status(id),
            Dispatcher::Parallel(s) => s.status(id),
        }
    }

    fn release(&self, id: TaskId, force: bool) {
        match self {
            Dispatcher::Single(s) => s.release(id, force),
            Dispatcher::Serial(s) => s.release(id, force),
            Dispatcher::Parallel(s) => s.release(id, force),
        }
    }

    fn shutdown(&self) {
        match self {
            Dispatcher::Single(s) => s.shutdown(),
            Dispatcher::Serial(s) => s.shutdown(),
            Dispatcher::Parallel(s) => s.shutdown(),
        }
    }
}

/// Control blocks of queued and finished submissions, keyed by subtask id.
/// Used by the queued strategies.
#[derive(Debug)]
pub(crate) struct TcbTable {
    table: HandleTable<Tcb>,
}

impl TcbTable {
    pub(crate) fn new(capacity: usize) -> Result<Self, VipError> {
        Ok(Self {
            table: HandleTable::new("tcb", capacity)?,
        })
    }

    fn handle(id: TaskId) -> Handle {
        id.as_u32() as Handle
    }

    /// Moves the control block of `task` to `Ready`, creating it on the first
    /// submission of that id.
    pub(crate) fn prepare(&self, task: &Task, time_out: Duration) -> Result<(), VipError> {
        let handle = Self::handle(task.id);

        loop {
            if let Ok(tcb) = self.table.use_handle(handle) {
                return tcb.prepare(*task, time_out);
            }

            let tcb = Tcb::new();
            tcb.prepare(*task, time_out)?;

            match self.table.insert_or_expand(Some(handle), tcb) {
                Ok(_) => return Ok(()),
                // Lost a race against a concurrent first submission.
                Err(VipError::InvalidArguments(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Result<TableRef<'_, Tcb>, VipError> {
        self.table
            .use_handle(Self::handle(id))
            .map_err(|_| VipError::invalid(format!("task {} was not submitted", id)))
    }

    pub(crate) fn remove(&self, id: TaskId, force: bool) {
        // Nothing to do when the id never reached the table.
        let _ = self.table.remove_handle(Self::handle(id), force);
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}

impl QueueEntry {
    pub(crate) fn new(task: &Task, priority: u32, estimated_time: Option<Duration>) -> Self {
        QueueEntry {
            task_id: task.id,
            cores: task.cores,
            priority,
            estimated_time,
        }
    }
}
