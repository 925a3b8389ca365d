use super::{Dispatch, Executor, TcbTable};
use crate::context::ContextConfig;
use crate::errors::VipError;
use crate::platform::{CoreMask, MAX_CORES};
use crate::queue::{CleanFilter, QueueEntry, SubmitQueue};
use crate::task::{CancelOutcome, Completion, Task, TaskId, TcbStatus};
use crate::utils::thread::{join_all, spawn_worker};
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

struct Shared {
    executor: Arc<Executor>,
    tcbs: TcbTable,
    queues: Vec<SubmitQueue>,
}

impl Shared {
    fn queue(&self, device: usize) -> Result<&SubmitQueue, VipError> {
        self.queues
            .get(device)
            .ok_or_else(|| VipError::invalid(format!("device {} does not exist", device)))
    }

    /// Undoes the submissions of a range that could not be fully queued.
    fn rollback(&self, tasks: &[Task]) {
        for task in tasks {
            if let Ok(queue) = self.queue(task.device) {
                queue.clean(CleanFilter::Entry(task.id));
            }
            if let Ok(tcb) = self.tcbs.get(task.id) {
                tcb.abandon();
            }
        }
    }
}

/// One worker thread per device runs the device queue in order, so jobs of a
/// device never overlap while devices proceed independently.
pub(crate) struct Serial {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serial")
            .field("devices", &self.shared.queues.len())
            .field("tcbs", &self.shared.tcbs.len())
            .finish()
    }
}

impl Serial {
    pub(crate) fn new(cfg: &ContextConfig, executor: Arc<Executor>) -> Result<Self> {
        let queues = executor
            .devices()
            .iter()
            .map(|_| SubmitQueue::new(cfg.queue_kind))
            .collect();

        let serial = Serial {
            shared: Arc::new(Shared {
                executor,
                tcbs: TcbTable::new(cfg.tcb_capacity)?,
                queues,
            }),
            workers: Mutex::new(Vec::new()),
        };

        // On error `serial` is dropped, which stops and joins the workers
        // already running.
        for device in 0..serial.shared.queues.len() {
            let shared = Arc::clone(&serial.shared);
            let handle = spawn_worker(cfg, &format!("s{}", device), move || {
                worker_loop(&shared, device)
            })?;
            serial.workers.lock().push(handle);
        }

        Ok(serial)
    }
}

fn worker_loop(shared: &Shared, device: usize) {
    let Ok(queue) = shared.queue(device) else {
        return;
    };

    debug!(device, "serial worker started");

    loop {
        // Jobs run one at a time, every core of the device is free here.
        match queue.read(CoreMask::all(MAX_CORES)) {
            Some(entry) => match shared.tcbs.get(entry.task_id) {
                Ok(tcb) => shared.executor.run(&tcb),
                Err(_) => debug!(task = %entry.task_id, "dropping entry of a released task"),
            },
            None if queue.is_stopped() => break,
            None => {
                queue.wait(None);
            }
        }
    }

    debug!(device, "serial worker stopped");
}

impl Dispatch for Serial {
    fn submit(&self, tasks: &[Task], time_out: Duration, priority: u32) -> Result<(), VipError> {
        for (i, task) in tasks.iter().enumerate() {
            let queued = self.shared.queue(task.device).and_then(|queue| {
                self.shared.tcbs.prepare(task, time_out)?;

                let estimate = self.shared.executor.estimated_time(task);
                queue
                    .write(QueueEntry::new(task, priority, estimate))
                    .inspect_err(|_| {
                        if let Ok(tcb) = self.shared.tcbs.get(task.id) {
                            tcb.abandon();
                        }
                    })
            });

            if let Err(e) = queued {
                self.shared.rollback(&tasks[..i]);
                return Err(e);
            }
        }

        Ok(())
    }

    fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<Completion, VipError> {
        let tcb = self.shared.tcbs.get(id)?;
        tcb.wait(timeout)
    }

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, VipError> {
        let tcb = self.shared.tcbs.get(id)?;
        let outcome = self.shared.executor.cancel(&tcb)?;

        if outcome == CancelOutcome::Dequeued
            && let Some(task) = tcb.task()
            && let Ok(queue) = self.shared.queue(task.device)
        {
            queue.clean(CleanFilter::Entry(id));
        }

        Ok(outcome)
    }

    fn status(&self, id: TaskId) -> Option<TcbStatus> {
        self.shared.tcbs.get(id).ok().map(|tcb| tcb.status())
    }

    fn release(&self, id: TaskId, force: bool) {
        if let Ok(tcb) = self.shared.tcbs.get(id)
            && let Some(task) = tcb.task()
            && let Ok(queue) = self.shared.queue(task.device)
        {
            queue.clean(CleanFilter::Entry(id));
        }

        self.shared.tcbs.remove(id, force);
    }

    fn shutdown(&self) {
        for queue in &self.shared.queues {
            queue.stop();

            for entry in queue.clean(CleanFilter::All) {
                if let Ok(tcb) = self.shared.tcbs.get(entry.task_id)
                    && let Err(e) = self.shared.executor.cancel(&tcb)
                {
                    warn!(task = %entry.task_id, error = %e, "failed to cancel queued task");
                }
            }
        }

        let panicked = join_all(self.workers.lock().drain(..));
        if panicked > 0 {
            error!(panicked, "serial workers panicked");
        }
    }
}

impl Drop for Serial {
    fn drop(&mut self) {
        self.shutdown();
    }
}
