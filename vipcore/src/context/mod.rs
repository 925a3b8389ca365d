use crate::device::Device;
use crate::dispatch::{Dispatch, Dispatcher, Executor};
use crate::errors::VipError;
use crate::platform::{ChipInfo, CoreMask, HardwareId, MAX_CORES, Platform};
use crate::task::{
    CancelOutcome, Completion, DescriptorStore, Pid, SubtaskProfile, Task, TaskId,
    TaskProperty, TcbStatus,
};
use anyhow::{Context as _, Result, ensure};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// Exports
mod builder;
pub use builder::Builder;
pub(crate) use builder::ContextConfig;

pub mod features;
pub use features::Features;

/// Arguments of `Context::task_desc_submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitArgs {
    pub device: usize,

    /// Descriptor to run. A subtask encoded in the id is ignored.
    pub task_id: TaskId,

    pub subtasks: Range<usize>,

    /// First core of the contiguous core range the subtasks run on.
    pub core_index: usize,
    pub core_cnt: usize,

    /// Hardware budget of every subtask. Falls back to the configured default.
    pub timeout: Option<Duration>,

    /// Only meaningful with `QueueKind::Priority`. Higher runs first.
    pub priority: u32,
}

impl SubmitArgs {
    /// Runs `subtasks` of `task_id` on core 0 of `device`.
    pub fn new(device: usize, task_id: TaskId, subtasks: Range<usize>) -> Self {
        Self {
            device,
            task_id,
            subtasks,
            core_index: 0,
            core_cnt: 1,
            timeout: None,
            priority: 0,
        }
    }

    pub fn cores(mut self, core_index: usize, core_cnt: usize) -> Self {
        self.core_index = core_index;
        self.core_cnt = core_cnt;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Point-in-time bookkeeping of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareStatus {
    pub id: HardwareId,
    pub idle: bool,
    pub irq_count: u64,
    pub recovery_times: u32,

    /// Out of recovery attempts. The core rejects every job from now on.
    pub faulted: bool,
}

/// The dispatch core of one chip.
///
/// Owns the descriptor store, the per-device bookkeeping and the dispatch
/// threads. Every operation is safe to call concurrently from any thread.
/// Dropping the context cancels queued work and joins the dispatch threads.
pub struct Context {
    cfg: ContextConfig,
    chip: ChipInfo,
    chip_name: &'static str,
    features: Features,

    /// Open count of every process that opened the context.
    processes: DashMap<Pid, usize>,

    descriptors: Arc<DescriptorStore>,
    executor: Arc<Executor>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("chip", &self.chip_name)
            .field("features", &self.features)
            .field("strategy", &self.cfg.strategy)
            .field("processes", &self.processes.len())
            .field("descriptors", &self.descriptors.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Context {
    pub(crate) fn new(cfg: ContextConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        let chip = platform.describe();

        ensure!(!chip.devices.is_empty(), "chip {:#x} exposes no device", chip.chip_id);
        for (index, cores) in chip.devices.iter().enumerate() {
            ensure!(
                (1..=MAX_CORES).contains(cores),
                "device {} has {} cores, expected 1 to {}",
                index,
                cores,
                MAX_CORES
            );
        }

        let row = features::lookup(chip.chip_id).context("failed to select chip features")?;
        let features = row.features;

        let shared_power = (cfg.one_power_domain || features.contains(Features::SHARED_POWER))
            .then(|| Arc::new(Mutex::new(())));

        let devices: Arc<[Device]> = chip
            .devices
            .iter()
            .enumerate()
            .map(|(index, cores)| {
                let power = shared_power
                    .clone()
                    .unwrap_or_else(|| Arc::new(Mutex::new(())));
                Device::new(index, *cores, power, cfg.max_recovery_times)
            })
            .collect::<Vec<_>>()
            .into();

        for hw in devices.iter().flat_map(Device::iter) {
            platform
                .hw_init(hw.id)
                .with_context(|| format!("failed to init {:?}", hw.id))?;
            hw.reset_recovery(cfg.max_recovery_times);
        }

        let descriptors = Arc::new(DescriptorStore::new(
            cfg.descriptor_capacity,
            Arc::clone(&platform),
            cfg.task_schedule,
        )?);

        let executor = Arc::new(Executor::new(
            platform,
            devices,
            Arc::clone(&descriptors),
            features,
            cfg.recovery,
            cfg.poll_interval,
        ));

        let dispatcher = Dispatcher::new(&cfg, Arc::clone(&executor))
            .context("failed to start dispatch threads")?;

        info!(
            chip = row.name,
            devices = chip.devices.len(),
            strategy = ?cfg.strategy,
            ?features,
            "context started"
        );

        Ok(Self {
            cfg,
            chip,
            chip_name: row.name,
            features,
            processes: DashMap::new(),
            descriptors,
            executor,
            dispatcher,
        })
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    /// Registers one more open of the context by `pid`. Returns the open
    /// count.
    pub fn open(&self, pid: Pid) -> usize {
        let mut count = self.processes.entry(pid).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one open of `pid`. The last close destroys every descriptor the
    /// process still owns. Returns how many were destroyed.
    ///
    /// The entry stays locked until the process is reclaimed, so a concurrent
    /// `open` of the same pid starts from a clean slate.
    pub fn close(&self, pid: Pid) -> Result<usize, VipError> {
        let Entry::Occupied(mut count) = self.processes.entry(pid) else {
            return Err(VipError::invalid(format!(
                "process {} did not open the context",
                pid
            )));
        };

        *count.get_mut() -= 1;
        if *count.get() > 0 {
            return Ok(0);
        }

        let destroyed = self.task_desc_force_destroy(pid);
        count.remove();
        Ok(destroyed)
    }

    pub fn task_desc_create(
        &self,
        pid: Pid,
        name: &str,
        subtask_count: usize,
    ) -> Result<TaskId, VipError> {
        let id = self.descriptors.create(pid, name, subtask_count)?;
        debug!(pid, task = %id, name, subtask_count, "descriptor created");
        Ok(id)
    }

    pub fn task_desc_set_property(
        &self,
        pid: Pid,
        task_id: TaskId,
        property: TaskProperty,
    ) -> Result<(), VipError> {
        self.descriptors
            .set_property(pid, task_id.descriptor(), property)
    }

    /// Queues, or with `Strategy::Single` runs, a range of subtasks on a
    /// core range. Every argument is validated before anything is queued.
    pub fn task_desc_submit(&self, pid: Pid, args: SubmitArgs) -> Result<(), VipError> {
        let id = args.task_id.descriptor();
        let desc = self.descriptors.get(pid, id)?;

        if args.subtasks.is_empty() || args.subtasks.end > desc.subtask_count() {
            return Err(VipError::invalid(format!(
                "subtasks {:?} out of range, task {} has {}",
                args.subtasks,
                id,
                desc.subtask_count()
            )));
        }

        let device = self.executor.device(args.device)?;
        let cores = CoreMask::from_range(args.core_index, args.core_cnt)?;
        if !cores.is_subset_of(device.all_cores()) {
            return Err(VipError::invalid(format!(
                "cores {:?} out of range, device {} has {}",
                cores,
                args.device,
                device.core_count()
            )));
        }

        if !desc.is_skipped()
            && let Some(missing) = args.subtasks.clone().find(|s| !desc.has_command(*s))
        {
            return Err(VipError::invalid(format!(
                "subtask {} of task {} has no command buffer",
                missing, id
            )));
        }

        let tasks = args
            .subtasks
            .clone()
            .map(|subtask| {
                Ok(Task {
                    id: id.with_subtask(subtask)?,
                    pid,
                    device: args.device,
                    cores,
                })
            })
            .collect::<Result<Vec<_>, VipError>>()?;

        let time_out = args.timeout.unwrap_or(self.cfg.default_timeout);

        if let Err(e) = self.dispatcher.submit(&tasks, time_out, args.priority) {
            debug!(pid, task = %id, subtasks = ?args.subtasks, error = %e, "submission rejected");
            return Err(e);
        }

        for subtask in args.subtasks {
            desc.record_submit(subtask);
        }

        Ok(())
    }

    /// Blocks until the subtask completes. `timeout` bounds the wait of the
    /// caller, the hardware budget was given on submit.
    pub fn task_desc_wait(
        &self,
        pid: Pid,
        task_id: TaskId,
        subtask: usize,
        timeout: Option<Duration>,
    ) -> Result<Completion, VipError> {
        let id = self.owned_subtask(pid, task_id, subtask)?;
        self.dispatcher.wait(id, timeout)
    }

    pub fn task_cancel(
        &self,
        pid: Pid,
        task_id: TaskId,
        subtask: usize,
    ) -> Result<CancelOutcome, VipError> {
        if !self.cfg.task_cancel {
            return Err(VipError::not_supported("task cancel is disabled"));
        }

        let id = self.owned_subtask(pid, task_id, subtask)?;
        let outcome = self.dispatcher.cancel(id)?;

        info!(pid, task = %id, ?outcome, "task canceled");
        Ok(outcome)
    }

    /// Status of the control block of a subtask, `TcbStatus::None` when it
    /// was never submitted.
    pub fn task_status(
        &self,
        pid: Pid,
        task_id: TaskId,
        subtask: usize,
    ) -> Result<TcbStatus, VipError> {
        let id = self.owned_subtask(pid, task_id, subtask)?;
        Ok(self.dispatcher.status(id).unwrap_or(TcbStatus::None))
    }

    /// Destroys a descriptor none of whose subtasks is queued or running.
    /// The descriptor is freed once the last in-progress lookup releases it.
    pub fn task_desc_destroy(&self, pid: Pid, task_id: TaskId) -> Result<(), VipError> {
        let id = task_id.descriptor();
        let count = self.descriptors.get(pid, id)?.subtask_count();

        let subtasks = (0..count)
            .map(|s| id.with_subtask(s))
            .collect::<Result<Vec<_>, VipError>>()?;

        if let Some(busy) = subtasks.iter().find(|sub| {
            self.dispatcher
                .status(**sub)
                .is_some_and(|status| status.is_in_flight())
        }) {
            return Err(VipError::AlreadySubmitted(*busy));
        }

        for sub in subtasks {
            self.dispatcher.release(sub, false);
        }

        self.descriptors.destroy(pid, id)?;
        debug!(pid, task = %id, "descriptor destroyed");
        Ok(())
    }

    /// Process exit hook. Cancels and forgets everything `pid` owns. A failed
    /// cancel is logged and does not stop the cleanup. Returns the number of
    /// descriptors destroyed.
    pub fn task_desc_force_destroy(&self, pid: Pid) -> usize {
        let owned = self.descriptors.owned_by(pid);

        for id in &owned {
            let count = self
                .descriptors
                .lookup(*id)
                .map_or(0, |desc| desc.subtask_count());

            for sub in (0..count).filter_map(|s| id.with_subtask(s).ok()) {
                if self
                    .dispatcher
                    .status(sub)
                    .is_some_and(|status| status.is_in_flight())
                {
                    match self.dispatcher.cancel(sub) {
                        Ok(outcome) => debug!(pid, task = %sub, ?outcome, "canceled on exit"),
                        Err(e) => warn!(pid, task = %sub, error = %e, "failed to cancel on exit"),
                    }
                }

                self.dispatcher.release(sub, true);
            }

            if let Err(e) = self.descriptors.force_remove(*id) {
                warn!(pid, task = %id, error = %e, "failed to remove descriptor");
            }
        }

        if !owned.is_empty() {
            info!(pid, descriptors = owned.len(), "process resources reclaimed");
        }

        owned.len()
    }

    pub fn task_desc_profile(
        &self,
        pid: Pid,
        task_id: TaskId,
    ) -> Result<Vec<SubtaskProfile>, VipError> {
        Ok(self.descriptors.get(pid, task_id.descriptor())?.profile())
    }

    pub fn hardware_status(&self, device: usize) -> Result<Vec<HardwareStatus>, VipError> {
        Ok(self
            .executor
            .device(device)?
            .iter()
            .map(|hw| HardwareStatus {
                id: hw.id,
                idle: hw.is_idle(),
                irq_count: hw.irq_count(),
                recovery_times: hw.recovery_times(),
                faulted: hw.is_faulted(),
            })
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn device(&self, index: usize) -> Result<&Device, VipError> {
        self.executor.device(index)
    }

    /// Number of live descriptors, every process included.
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Resolves a subtask of a descriptor owned by `pid`.
    fn owned_subtask(&self, pid: Pid, task_id: TaskId, subtask: usize) -> Result<TaskId, VipError> {
        let id = task_id.descriptor();
        let count = self.descriptors.get(pid, id)?.subtask_count();

        if subtask >= count {
            return Err(VipError::invalid(format!(
                "subtask {} out of range, task {} has {}",
                subtask, id, count
            )));
        }

        id.with_subtask(subtask)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        info!(chip = self.chip_name, "context stopped");
    }
}
