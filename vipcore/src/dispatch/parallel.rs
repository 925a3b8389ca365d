use super::{Dispatch, Executor, TcbTable};
use crate::context::ContextConfig;
use crate::device::Device;
use crate::errors::VipError;
use crate::queue::{CleanFilter, QueueEntry, SubmitQueue};
use crate::task::{CancelOutcome, Completion, Task, TaskId, TcbStatus};
use crate::utils::thread::{join_all, spawn_worker};
use crate::utils::{ScopeGuard, Signal};
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Mailbox of one core thread.
struct CoreSlot {
    entry: Mutex<Option<QueueEntry>>,
    run: Signal,
}

/// Queue, daemon state and core mailboxes of one device.
struct Lane {
    device: usize,
    queue: SubmitQueue,
    cores: Vec<CoreSlot>,

    /// Set by the daemon on its way out, tells idle core threads to exit.
    exiting: AtomicBool,
}

struct Shared {
    executor: Arc<Executor>,
    tcbs: TcbTable,
    lanes: Vec<Lane>,
    poll_interval: Duration,
}

impl Shared {
    fn lane(&self, device: usize) -> Result<&Lane, VipError> {
        self.lanes
            .get(device)
            .ok_or_else(|| VipError::invalid(format!("device {} does not exist", device)))
    }

    fn rollback(&self, tasks: &[Task]) {
        for task in tasks {
            if let Ok(lane) = self.lane(task.device) {
                lane.queue.clean(CleanFilter::Entry(task.id));
            }
            if let Ok(tcb) = self.tcbs.get(task.id) {
                tcb.abandon();
            }
        }
    }
}

/// A daemon per device hands each queued job to the thread of the first core
/// of its range once every core of the range is free. Different cores of one
/// device run different jobs concurrently.
pub(crate) struct Parallel {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("devices", &self.shared.lanes.len())
            .field("tcbs", &self.shared.tcbs.len())
            .finish()
    }
}

impl Parallel {
    pub(crate) fn new(cfg: &ContextConfig, executor: Arc<Executor>) -> Result<Self> {
        let lanes = executor
            .devices()
            .iter()
            .map(|device| Lane {
                device: device.index,
                queue: SubmitQueue::new(cfg.queue_kind),
                cores: (0..device.core_count())
                    .map(|_| CoreSlot {
                        entry: Mutex::new(None),
                        run: Signal::auto_reset(),
                    })
                    .collect(),
                exiting: AtomicBool::new(false),
            })
            .collect();

        let parallel = Parallel {
            shared: Arc::new(Shared {
                executor,
                tcbs: TcbTable::new(cfg.tcb_capacity)?,
                lanes,
                poll_interval: cfg.poll_interval,
            }),
            workers: Mutex::new(Vec::new()),
        };

        // Core threads first so the daemon never signals a missing thread. On
        // error `parallel` is dropped, which stops and joins what was spawned.
        for (device, lane) in parallel.shared.lanes.iter().enumerate() {
            for core in 0..lane.cores.len() {
                let shared = Arc::clone(&parallel.shared);
                let handle = spawn_worker(cfg, &format!("d{}c{}", device, core), move || {
                    core_loop(&shared, device, core)
                })?;
                parallel.workers.lock().push(handle);
            }

            let shared = Arc::clone(&parallel.shared);
            let handle = spawn_worker(cfg, &format!("d{}", device), move || {
                daemon_loop(&shared, device)
            })?;
            parallel.workers.lock().push(handle);
        }

        Ok(parallel)
    }
}

fn daemon_loop(shared: &Shared, device_index: usize) {
    let (Ok(lane), Ok(device)) = (
        shared.lane(device_index),
        shared.executor.device(device_index),
    ) else {
        return;
    };

    debug!(device = lane.device, "parallel daemon started");

    loop {
        if let Some(entry) = lane.queue.read(device.free_mask()) {
            dispatch(lane, device, entry);
            continue;
        }

        if lane.queue.is_stopped() && lane.queue.is_empty() {
            break;
        }

        // Bounded poll: freed cores also notify, but a missed wakeup only
        // costs one interval.
        lane.queue.wait(Some(shared.poll_interval));
    }

    lane.exiting.store(true, Ordering::Release);
    for slot in &lane.cores {
        slot.run.set();
    }

    debug!(device = lane.device, "parallel daemon stopped");
}

/// Claims the cores of `entry` and wakes the thread of its first core.
fn dispatch(lane: &Lane, device: &Device, entry: QueueEntry) {
    let slot = entry.cores.first().and_then(|core| lane.cores.get(core));

    match slot {
        // Only the daemon claims cores, and `read` checked they are free.
        Some(slot) if device.claim(entry.cores) => {
            *slot.entry.lock() = Some(entry);
            slot.run.set();
        }
        _ => {
            warn!(task = %entry.task_id, cores = ?entry.cores, "could not claim cores, requeueing");
            if let Err(e) = lane.queue.write(entry) {
                error!(task = %entry.task_id, error = %e, "dropped queued task");
            }
        }
    }
}

fn core_loop(shared: &Shared, device_index: usize, core: usize) {
    let (Ok(lane), Ok(device)) = (
        shared.lane(device_index),
        shared.executor.device(device_index),
    ) else {
        return;
    };
    let Some(slot) = lane.cores.get(core) else {
        return;
    };

    loop {
        slot.run.wait(None);

        let Some(entry) = slot.entry.lock().take() else {
            if lane.exiting.load(Ordering::Acquire) {
                break;
            }
            continue;
        };

        // Hand the cores back and poke the daemon on every exit path.
        let _release = ScopeGuard::new(|| {
            device.release(entry.cores);
            lane.queue.notify();
        });

        match shared.tcbs.get(entry.task_id) {
            Ok(tcb) => shared.executor.run(&tcb),
            Err(_) => debug!(task = %entry.task_id, "dropping entry of a released task"),
        }
    }
}

impl Dispatch for Parallel {
    fn submit(&self, tasks: &[Task], time_out: Duration, priority: u32) -> Result<(), VipError> {
        for (i, task) in tasks.iter().enumerate() {
            let queued = self.shared.lane(task.device).and_then(|lane| {
                self.shared.tcbs.prepare(task, time_out)?;

                let estimate = self.shared.executor.estimated_time(task);
                lane.queue
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
            && let Ok(lane) = self.shared.lane(task.device)
        {
            lane.queue.clean(CleanFilter::Entry(id));
        }

        Ok(outcome)
    }

    fn status(&self, id: TaskId) -> Option<TcbStatus> {
        self.shared.tcbs.get(id).ok().map(|tcb| tcb.status())
    }

    fn release(&self, id: TaskId, force: bool) {
        if let Ok(tcb) = self.shared.tcbs.get(id)
            && let Some(task) = tcb.task()
            && let Ok(lane) = self.shared.lane(task.device)
        {
            lane.queue.clean(CleanFilter::Entry(id));
        }

        self.shared.tcbs.remove(id, force);
    }

    fn shutdown(&self) {
        for lane in &self.shared.lanes {
            lane.queue.stop();

            for entry in lane.queue.clean(CleanFilter::All) {
                if let Ok(tcb) = self.shared.tcbs.get(entry.task_id)
                    && let Err(e) = self.shared.executor.cancel(&tcb)
                {
                    warn!(task = %entry.task_id, error = %e, "failed to cancel queued task");
                }
            }
        }

        let panicked = join_all(self.workers.lock().drain(..));
        if panicked > 0 {
            error!(panicked, "parallel workers panicked");
        }
    }
}

impl Drop for Parallel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
