//! Everything the dispatch core needs from the chip and the operating system,
//! expressed as traits so the scheduler never touches a register directly.

use crate::errors::VipError;
use crate::task::Pid;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::time::Duration;

mod mask;
pub use mask::{CoreMask, MAX_CORES};

pub(crate) mod regs;

/// Identifier of a video memory allocation.
pub type MemId = u32;

/// Physical address of one hardware core, `core` being the index inside the
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareId {
    pub device: usize,
    pub core: usize,
}

impl HardwareId {
    pub const fn new(device: usize, core: usize) -> Self {
        Self { device, core }
    }
}

bitflags! {
    /// Allocation flags for video memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        const CONTIGUOUS = 1 << 0;
        const CACHEABLE = 1 << 1;
        const MAP_USER = 1 << 2;
        /// Memory must be visible below 4G to the VIP front end.
        const LOW_4G = 1 << 3;
        const ZEROED = 1 << 4;
    }
}

/// A freshly allocated video memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMemory {
    pub mem_id: MemId,
    /// Kernel/CPU virtual address of the mapping.
    pub cpu_addr: usize,
    /// Address the VIP front end fetches from.
    pub device_addr: u32,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub cpu_addr: usize,
    pub device_addr: u32,
    pub size: usize,
    pub pid: Pid,
}

/// Video memory allocator and bookkeeping.
pub trait MemoryOps: Send + Sync {
    fn allocate_video_memory(
        &self,
        size: usize,
        flags: AllocFlags,
        device_mask: u32,
    ) -> Result<VideoMemory, VipError>;

    fn get_info(&self, mem_id: MemId) -> Result<MemInfo, VipError>;

    fn free_video_memory(&self, mem_id: MemId) -> Result<(), VipError>;
}

/// Register access, interrupt queue and power lifecycle of the hardware.
pub trait HardwareOps: Send + Sync {
    fn read_register(&self, hw: HardwareId, offset: u32) -> u32;

    fn write_register(&self, hw: HardwareId, offset: u32, value: u32);

    /// Brings a core to a state where it accepts command buffers.
    fn hw_init(&self, hw: HardwareId) -> Result<(), VipError>;

    /// Soft reset, used by recovery. Must be followed by `hw_init`.
    fn hw_reset(&self, hw: HardwareId) -> Result<(), VipError>;

    fn hw_idle(&self, hw: HardwareId) -> bool;

    /// Waits until every core in `expected` reports idle. `fast` skips the
    /// settle delay some chips need after the last interrupt.
    fn hw_wait_idle(
        &self,
        device: usize,
        timeout: Duration,
        fast: bool,
        expected: CoreMask,
    ) -> Result<(), VipError>;

    /// Aborts whatever runs on `cores`. Only called when the chip advertises
    /// `Features::JOB_CANCEL`.
    fn hw_cancel(&self, device: usize, cores: CoreMask) -> Result<(), VipError>;

    /// Blocks on the interrupt queue of `hw` for at most `timeout`. Returns
    /// true when an interrupt was raised and consumed.
    fn wait_interrupt(&self, hw: HardwareId, timeout: Duration) -> bool;
}

/// Static description of the chip, returned once when the context starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip_id: u32,
    /// Number of cores of each device, one entry per device.
    pub devices: Vec<usize>,
}

/// The full collaborator surface consumed by the context.
pub trait Platform: HardwareOps + MemoryOps {
    fn describe(&self) -> ChipInfo;
}

/// A command buffer resolved to the address the front end fetches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub mem_id: MemId,
    pub device_addr: u32,
    pub size: u32,
}

/// A register word written to every core of a job before the kick, used by
/// chip specific multi-core patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEntry {
    pub offset: u32,
    pub value: u32,
}

/// Command buffers fed to the front end in one kick.
pub(crate) type CommandChain = SmallVec<[CommandBuffer; 4]>;

pub(crate) type PatchList = SmallVec<[PatchEntry; 4]>;

/// Everything needed to program one subtask on one core range.
#[derive(Debug, Clone)]
pub(crate) struct HardwareJob {
    pub(crate) device: usize,
    pub(crate) cores: CoreMask,

    /// Programmed only when the core has not run a job since init or reset.
    pub(crate) init: Option<CommandBuffer>,

    pub(crate) patches: PatchList,

    pub(crate) commands: CommandChain,
}

impl HardwareJob {
    pub(crate) fn hardware(&self) -> impl Iterator<Item = HardwareId> + '_ {
        self.cores.iter().map(|core| HardwareId::new(self.device, core))
    }
}
