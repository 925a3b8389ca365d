use crate::errors::VipError;
use std::fmt;

/// Tag carried in the high bits of every task id so stray integers are
/// rejected before they index a table.
pub(crate) const MAGIC: u32 = 0x5600_0000;

/// Low bits reserved for the subtask offset.
pub(crate) const INDEX_SHIFT: u32 = 8;

/// Number of subtasks addressable by the low bits of an id.
pub const MAX_SUBTASKS: usize = 1 << INDEX_SHIFT;

/// Largest descriptor index that still fits below the tag.
pub(crate) const MAX_INDEX: usize = ((u32::MAX - MAGIC) >> INDEX_SHIFT) as usize;

/// Identifier of a task descriptor, or of one of its subtasks.
///
/// Layout: `MAGIC + (descriptor_index << INDEX_SHIFT) + subtask`. The id
/// returned by `task_desc_create` always has subtask 0.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    /// Id of the descriptor stored at `index`.
    pub(crate) fn from_index(index: usize) -> Result<Self, VipError> {
        if index > MAX_INDEX {
            return Err(VipError::out_of_resource(format!(
                "descriptor index {} exceeds the id space",
                index
            )));
        }

        Ok(TaskId(MAGIC + ((index as u32) << INDEX_SHIFT)))
    }

    /// Validates a raw id received from a caller.
    pub fn from_raw(raw: u32) -> Result<Self, VipError> {
        if raw < MAGIC {
            return Err(VipError::invalid(format!("{:#x} is not a task id", raw)));
        }
        Ok(TaskId(raw))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Index of the owning descriptor in the descriptor store.
    pub fn index(&self) -> usize {
        ((self.0 - MAGIC) >> INDEX_SHIFT) as usize
    }

    pub fn subtask(&self) -> usize {
        (self.0 & (MAX_SUBTASKS as u32 - 1)) as usize
    }

    /// The descriptor id, with the subtask bits cleared.
    pub fn descriptor(&self) -> TaskId {
        TaskId(self.0 & !(MAX_SUBTASKS as u32 - 1))
    }

    /// Id of subtask `subtask` of the same descriptor.
    pub fn with_subtask(&self, subtask: usize) -> Result<TaskId, VipError> {
        if subtask >= MAX_SUBTASKS {
            return Err(VipError::invalid(format!(
                "subtask {} is out of range for {}",
                subtask, self
            )));
        }
        Ok(TaskId(self.descriptor().0 + subtask as u32))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskId")
            .field("index", &self.index())
            .field("subtask", &self.subtask())
            .finish()
    }
}
