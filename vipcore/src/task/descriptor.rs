use super::id::MAX_SUBTASKS;
use super::{Pid, Task, TaskId};
use crate::errors::VipError;
use crate::platform::{
    AllocFlags, CommandBuffer, CommandChain, HardwareJob, MemId, PatchEntry, PatchList, Platform,
    VideoMemory,
};
use crate::table::{HandleTable, TableRef};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-core patch attached to a subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    None,

    /// Allocates a synchronisation buffer of `size` bytes, chained after the
    /// subtask command whenever it runs on more than one core.
    Sync { size: usize },

    /// Register words written to every core before the kick.
    Chip(Vec<PatchEntry>),

    /// Reuses the patch of subtask `source` of another descriptor owned by
    /// the same process.
    Duplicate { source: TaskId },
}

/// Property written by `task_desc_set_property`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProperty {
    /// Command buffer of subtask `index`.
    Subtask { index: usize, cmd: MemId },

    /// Sent once per core after init or recovery, before the first job.
    InitCommand(MemId),

    /// Sent before the first submission of the descriptor.
    PreloadCommand(MemId),

    Patch { index: usize, patch: Patch },

    /// Debug flag: subtasks complete immediately without touching hardware.
    Skip(bool),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtaskProfile {
    pub submit_count: u64,
    pub last_infer_time: Duration,
    pub total_infer_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatchInfo {
    None,
    Sync(VideoMemory),
    Chip(PatchList),
    Duplicate(TaskId),
}

#[derive(Debug)]
struct SubtaskInfo {
    cmd: Option<CommandBuffer>,
    patch: PatchInfo,
    profile: SubtaskProfile,
}

#[derive(Debug)]
struct DescriptorState {
    skip: bool,
    init_cmd: Option<CommandBuffer>,
    preload_cmd: Option<CommandBuffer>,
    preloaded: bool,
    subtasks: Vec<SubtaskInfo>,
}

/// Static metadata of one logical unit of work, e.g. a compiled network.
#[derive(Debug)]
pub(crate) struct TaskDescriptor {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    subtask_count: usize,
    state: Mutex<DescriptorState>,
}

impl TaskDescriptor {
    fn new(pid: Pid, name: String, subtask_count: usize) -> Self {
        let subtasks = (0..subtask_count)
            .map(|_| SubtaskInfo {
                cmd: None,
                patch: PatchInfo::None,
                profile: SubtaskProfile::default(),
            })
            .collect();

        Self {
            pid,
            name,
            subtask_count,
            state: Mutex::new(DescriptorState {
                skip: false,
                init_cmd: None,
                preload_cmd: None,
                preloaded: false,
                subtasks,
            }),
        }
    }

    pub(crate) fn subtask_count(&self) -> usize {
        self.subtask_count
    }

    /// Advisory: the flag may flip before the job starts.
    pub(crate) fn is_skipped(&self) -> bool {
        self.state.lock().skip
    }

    pub(crate) fn has_command(&self, subtask: usize) -> bool {
        self.state
            .lock()
            .subtasks
            .get(subtask)
            .is_some_and(|info| info.cmd.is_some())
    }

    pub(crate) fn profile(&self) -> Vec<SubtaskProfile> {
        self.state
            .lock()
            .subtasks
            .iter()
            .map(|info| info.profile)
            .collect()
    }

    /// Run time of the previous completed run, used as queue estimate.
    pub(crate) fn estimated_time(&self, subtask: usize) -> Option<Duration> {
        self.state
            .lock()
            .subtasks
            .get(subtask)
            .map(|info| info.profile.last_infer_time)
            .filter(|time| !time.is_zero())
    }

    pub(crate) fn record_submit(&self, subtask: usize) {
        if let Some(info) = self.state.lock().subtasks.get_mut(subtask) {
            info.profile.submit_count += 1;
        }
    }

    pub(crate) fn record_infer_time(&self, subtask: usize, elapsed: Duration) {
        if let Some(info) = self.state.lock().subtasks.get_mut(subtask) {
            info.profile.last_infer_time = elapsed;
            info.profile.total_infer_time += elapsed;
        }
    }

    fn patch(&self, subtask: usize) -> Option<PatchInfo> {
        self.state
            .lock()
            .subtasks
            .get(subtask)
            .map(|info| info.patch.clone())
    }

    fn free_memory(&self, platform: &dyn Platform) {
        let state = self.state.lock();

        for info in &state.subtasks {
            if let PatchInfo::Sync(mem) = info.patch
                && let Err(e) = platform.free_video_memory(mem.mem_id)
            {
                warn!(descriptor = %self.name, mem_id = mem.mem_id, error = %e, "failed to free patch memory");
            }
        }
    }
}

/// Handle table of task descriptors, indexed by `TaskId::index`.
pub(crate) struct DescriptorStore {
    table: HandleTable<TaskDescriptor>,
    platform: Arc<dyn Platform>,
    task_schedule: bool,
}

impl DescriptorStore {
    pub(crate) fn new(
        capacity: usize,
        platform: Arc<dyn Platform>,
        task_schedule: bool,
    ) -> Result<Self, VipError> {
        let table = {
            let platform = Arc::clone(&platform);
            HandleTable::new("task-descriptor", capacity)?.with_free_callback(
                move |index, desc: &TaskDescriptor| {
                    debug!(index, descriptor = %desc.name, "descriptor freed");
                    desc.free_memory(&*platform);
                },
            )
        };

        Ok(Self {
            table,
            platform,
            task_schedule,
        })
    }

    pub(crate) fn create(
        &self,
        pid: Pid,
        name: &str,
        subtask_count: usize,
    ) -> Result<TaskId, VipError> {
        if subtask_count == 0 {
            return Err(VipError::invalid("a descriptor needs at least one subtask"));
        }
        if subtask_count > MAX_SUBTASKS {
            return Err(VipError::out_of_resource(format!(
                "{} subtasks requested, at most {} are addressable",
                subtask_count, MAX_SUBTASKS
            )));
        }

        let desc = TaskDescriptor::new(pid, name.to_owned(), subtask_count);
        let index = self.table.insert_or_expand(None, desc)?;

        match TaskId::from_index(index) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.table.remove_index(index, true)?;
                Err(e)
            }
        }
    }

    /// Looks up a descriptor on behalf of `pid`.
    pub(crate) fn get(&self, pid: Pid, id: TaskId) -> Result<TableRef<'_, TaskDescriptor>, VipError> {
        let desc = self.lookup(id)?;

        if desc.pid != pid {
            return Err(VipError::not_supported(format!(
                "task {} belongs to process {}, not {}",
                id, desc.pid, pid
            )));
        }

        Ok(desc)
    }

    /// Looks up a descriptor without an ownership check.
    pub(crate) fn lookup(&self, id: TaskId) -> Result<TableRef<'_, TaskDescriptor>, VipError> {
        self.table
            .use_index(id.index())
            .map_err(|_| VipError::invalid(format!("task {} does not exist", id)))
    }

    pub(crate) fn set_property(
        &self,
        pid: Pid,
        id: TaskId,
        property: TaskProperty,
    ) -> Result<(), VipError> {
        let desc = self.get(pid, id)?;

        match property {
            TaskProperty::Subtask { index, cmd } => {
                check_subtask(&desc, index)?;
                let cmd = self.resolve(pid, cmd)?;
                desc.state.lock().subtasks[index].cmd = Some(cmd);
            }
            TaskProperty::InitCommand(cmd) => {
                let cmd = self.resolve(pid, cmd)?;
                desc.state.lock().init_cmd = Some(cmd);
            }
            TaskProperty::PreloadCommand(cmd) => {
                let cmd = self.resolve(pid, cmd)?;
                let mut state = desc.state.lock();
                state.preload_cmd = Some(cmd);
                state.preloaded = false;
            }
            TaskProperty::Patch { index, patch } => {
                if !self.task_schedule {
                    return Err(VipError::not_supported("task scheduling is disabled"));
                }
                check_subtask(&desc, index)?;

                let patch = self.build_patch(pid, patch)?;
                let old = std::mem::replace(&mut desc.state.lock().subtasks[index].patch, patch);

                if let PatchInfo::Sync(mem) = old
                    && let Err(e) = self.platform.free_video_memory(mem.mem_id)
                {
                    warn!(task = %id, error = %e, "failed to free replaced patch memory");
                }
            }
            TaskProperty::Skip(skip) => desc.state.lock().skip = skip,
        }

        Ok(())
    }

    fn resolve(&self, pid: Pid, mem_id: MemId) -> Result<CommandBuffer, VipError> {
        let info = self.platform.get_info(mem_id)?;

        if info.pid != pid {
            return Err(VipError::not_supported(format!(
                "memory {} belongs to process {}",
                mem_id, info.pid
            )));
        }

        let size = u32::try_from(info.size)
            .map_err(|_| VipError::invalid(format!("command buffer {} is too large", mem_id)))?;

        Ok(CommandBuffer {
            mem_id,
            device_addr: info.device_addr,
            size,
        })
    }

    fn build_patch(&self, pid: Pid, patch: Patch) -> Result<PatchInfo, VipError> {
        match patch {
            Patch::None => Ok(PatchInfo::None),
            Patch::Sync { size } => {
                let mem = self.platform.allocate_video_memory(
                    size,
                    AllocFlags::CONTIGUOUS | AllocFlags::LOW_4G | AllocFlags::ZEROED,
                    u32::MAX,
                )?;
                Ok(PatchInfo::Sync(mem))
            }
            Patch::Chip(entries) => Ok(PatchInfo::Chip(entries.into_iter().collect())),
            Patch::Duplicate { source } => {
                let desc = self.get(pid, source)?;
                check_subtask(&desc, source.subtask())?;

                match desc.patch(source.subtask()) {
                    Some(PatchInfo::Duplicate(_)) => Err(VipError::invalid(format!(
                        "patch of {} is itself a duplicate",
                        source
                    ))),
                    _ => Ok(PatchInfo::Duplicate(source)),
                }
            }
        }
    }

    /// Patch of `subtask`, following a duplicate to its source.
    fn resolve_patch(&self, desc: &TaskDescriptor, subtask: usize) -> Result<PatchInfo, VipError> {
        match desc.patch(subtask) {
            Some(PatchInfo::Duplicate(source)) => {
                let source_desc = self.lookup(source).map_err(|_| {
                    VipError::invalid(format!("patch source {} was destroyed", source))
                })?;
                Ok(source_desc
                    .patch(source.subtask())
                    .unwrap_or(PatchInfo::None))
            }
            Some(patch) => Ok(patch),
            None => Ok(PatchInfo::None),
        }
    }

    /// Builds what has to be programmed for `task`. Returns `None` when the
    /// descriptor is flagged skip.
    pub(crate) fn job(
        &self,
        desc: &TaskDescriptor,
        task: &Task,
    ) -> Result<Option<HardwareJob>, VipError> {
        let subtask = task.id.subtask();
        let patch = self.resolve_patch(desc, subtask)?;

        let mut state = desc.state.lock();
        if state.skip {
            return Ok(None);
        }

        let cmd = state
            .subtasks
            .get(subtask)
            .and_then(|info| info.cmd)
            .ok_or_else(|| VipError::invalid(format!("{} has no command buffer", task.id)))?;

        let mut commands = CommandChain::new();
        if !state.preloaded
            && let Some(preload) = state.preload_cmd
        {
            commands.push(preload);
            state.preloaded = true;
        }
        commands.push(cmd);

        let mut patches = PatchList::new();
        match patch {
            PatchInfo::Sync(mem) if task.cores.count() > 1 => commands.push(CommandBuffer {
                mem_id: mem.mem_id,
                device_addr: mem.device_addr,
                size: u32::try_from(mem.size).unwrap_or(u32::MAX),
            }),
            PatchInfo::Chip(entries) => patches = entries,
            _ => {}
        }

        Ok(Some(HardwareJob {
            device: task.device,
            cores: task.cores,
            init: state.init_cmd,
            patches,
            commands,
        }))
    }

    pub(crate) fn destroy(&self, pid: Pid, id: TaskId) -> Result<(), VipError> {
        let desc = self.get(pid, id)?;
        let index = desc.index();

        // Freed when the last reference, ours included, is released.
        self.table.remove_index(index, false)?;
        Ok(())
    }

    /// Frees the descriptor right away, outstanding references become stale.
    pub(crate) fn force_remove(&self, id: TaskId) -> Result<(), VipError> {
        self.table.remove_index(id.index(), true)?;
        Ok(())
    }

    /// Ids of every live descriptor owned by `pid`.
    pub(crate) fn owned_by(&self, pid: Pid) -> Vec<TaskId> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|(index, _)| {
                self.table
                    .use_index(*index)
                    .is_ok_and(|desc| desc.pid == pid)
            })
            .filter_map(|(index, _)| TaskId::from_index(index).ok())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub(crate) fn expansions(&self) -> usize {
        self.table.expansions()
    }
}

fn check_subtask(desc: &TaskDescriptor, index: usize) -> Result<(), VipError> {
    if index >= desc.subtask_count {
        return Err(VipError::out_of_resource(format!(
            "subtask {} is out of range, {} has {}",
            index, desc.name, desc.subtask_count
        )));
    }
    Ok(())
}
