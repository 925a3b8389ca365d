use crate::platform::CoreMask;

pub(crate) mod descriptor;
pub use self::descriptor::{Patch, SubtaskProfile, TaskProperty};
pub(crate) use self::descriptor::DescriptorStore;

pub mod id;
pub use self::id::{MAX_SUBTASKS, TaskId};

pub(crate) mod tcb;
pub use self::tcb::{CancelOutcome, Completion, TcbStatus};
pub(crate) use self::tcb::{Outcome, Tcb};

/// Process id of the owner of a descriptor.
pub type Pid = u32;

/// One subtask bound to the hardware it runs on. Built by the scheduler on
/// submit and kept in the TCB until the next submission of the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) pid: Pid,
    pub(crate) device: usize,
    pub(crate) cores: CoreMask,
}
