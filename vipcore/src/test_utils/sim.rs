use super::spy::{Call, Method, SpyState};
use crate::errors::VipError;
use crate::platform::regs::*;
use crate::platform::{
    AllocFlags, ChipInfo, CoreMask, HardwareId, HardwareOps, MemId, MemInfo, MemoryOps, Platform,
    VideoMemory,
};
use crate::task::Pid;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Chip advertising hardware job cancel.
pub(crate) const CHIP_WITH_CANCEL: u32 = 0x9000;

/// Chip without job cancel, cancel falls back to waiting idle.
pub(crate) const CHIP_WITHOUT_CANCEL: u32 = 0x8000;

/// How the simulated cores react to a kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HwMode {
    Immediate,
    Delay(Duration),
    /// Hung hardware, only a reset or a cancel stops the job.
    Never,
}

#[derive(Debug, Default)]
struct SimCore {
    /// Completion time of the running job, `None` inside means it never
    /// completes.
    running: Option<Option<Instant>>,
    pending_irq: bool,
    irq_status: u32,
    regs: HashMap<u32, u32>,
}

impl SimCore {
    /// Turns a finished job into a pending interrupt.
    fn settle(&mut self, now: Instant) {
        if let Some(Some(done_at)) = self.running
            && done_at <= now
        {
            self.running = None;
            self.pending_irq = true;
        }
    }

    fn done_at(&self) -> Option<Instant> {
        self.running.flatten()
    }
}

#[derive(Debug, Default)]
struct SimState {
    cores: HashMap<HardwareId, SimCore>,
    memory: HashMap<MemId, MemInfo>,
    next_mem_id: MemId,
    next_addr: u32,
    peak_running: usize,
}

impl SimState {
    fn running(&mut self, now: Instant) -> usize {
        self.cores
            .values_mut()
            .map(|c| {
                c.settle(now);
                c.running.is_some()
            })
            .filter(|running| *running)
            .count()
    }

    fn insert_memory(&mut self, size: usize, pid: Pid) -> VideoMemory {
        self.next_mem_id += 1;
        let mem = VideoMemory {
            mem_id: self.next_mem_id,
            cpu_addr: 0x4000_0000 + self.next_addr as usize,
            device_addr: 0x1000_0000 + self.next_addr,
            size,
        };
        self.next_addr += size.next_multiple_of(0x1000) as u32;

        self.memory.insert(
            mem.mem_id,
            MemInfo {
                cpu_addr: mem.cpu_addr,
                device_addr: mem.device_addr,
                size,
                pid,
            },
        );
        mem
    }
}

/// In-memory chip. Cores run jobs on kick and raise an interrupt when done
/// according to the current `HwMode`.
pub(crate) struct SimPlatform {
    chip_id: u32,
    devices: Vec<usize>,
    mode: Mutex<HwMode>,
    fail_cancel: Mutex<bool>,
    state: Mutex<SimState>,
    cond: Condvar,
    spy: SpyState,
}

impl SimPlatform {
    /// One entry per device, holding its core count.
    pub(crate) fn new(devices: &[usize]) -> Self {
        let cores = devices
            .iter()
            .enumerate()
            .flat_map(|(d, n)| (0..*n).map(move |c| (HardwareId::new(d, c), SimCore::default())))
            .collect();

        Self {
            chip_id: CHIP_WITH_CANCEL,
            devices: devices.to_vec(),
            mode: Mutex::new(HwMode::Immediate),
            fail_cancel: Mutex::new(false),
            state: Mutex::new(SimState {
                cores,
                ..Default::default()
            }),
            cond: Condvar::new(),
            spy: SpyState::new(),
        }
    }

    pub(crate) fn with_chip(mut self, chip_id: u32) -> Self {
        self.chip_id = chip_id;
        self
    }

    pub(crate) fn with_mode(self, mode: HwMode) -> Self {
        self.set_mode(mode);
        self
    }

    /// Applies to jobs kicked from now on.
    pub(crate) fn set_mode(&self, mode: HwMode) {
        *self.mode.lock() = mode;
    }

    pub(crate) fn fail_cancel(&self, fail: bool) {
        *self.fail_cancel.lock() = fail;
    }

    /// Next interrupt of `hw` reports a bus error.
    pub(crate) fn raise_bus_error(&self, hw: HardwareId) {
        if let Some(core) = self.state.lock().cores.get_mut(&hw) {
            core.irq_status |= IRQ_BUS_ERROR;
        }
    }

    /// Registers a user command buffer owned by `pid` without going through
    /// the spied allocator.
    pub(crate) fn command_buffer(&self, pid: Pid, size: usize) -> MemId {
        self.state.lock().insert_memory(size, pid).mem_id
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.spy.num_calls(method)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.spy.get_calls(method)
    }

    pub(crate) fn is_running(&self, hw: HardwareId) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.cores.get_mut(&hw).is_some_and(|core| {
            core.settle(now);
            core.running.is_some()
        })
    }

    /// Highest number of cores seen running at the same time.
    pub(crate) fn peak_running(&self) -> usize {
        self.state.lock().peak_running
    }

    pub(crate) fn live_memory(&self) -> usize {
        self.state.lock().memory.len()
    }
}

impl HardwareOps for SimPlatform {
    fn read_register(&self, hw: HardwareId, offset: u32) -> u32 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let Some(core) = state.cores.get_mut(&hw) else {
            return 0;
        };
        core.settle(now);

        match offset {
            REG_IRQ_ACK => std::mem::take(&mut core.irq_status),
            REG_IDLE_STATE if core.running.is_none() => IDLE_STATE_ALL,
            REG_IDLE_STATE => 0,
            _ => core.regs.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write_register(&self, hw: HardwareId, offset: u32, value: u32) {
        self.spy
            .record(Method::WriteRegister, Call::WriteRegister { hw, offset, value });

        let mode = *self.mode.lock();
        let mut state = self.state.lock();
        let Some(core) = state.cores.get_mut(&hw) else {
            return;
        };
        core.regs.insert(offset, value);

        if offset == REG_CMD_BUFFER_CTRL && value & CMD_BUFFER_ENABLE != 0 {
            let now = Instant::now();
            core.pending_irq = false;
            core.running = Some(match mode {
                HwMode::Immediate => Some(now),
                HwMode::Delay(delay) => Some(now + delay),
                HwMode::Never => None,
            });

            let running = state.running(now);
            state.peak_running = state.peak_running.max(running);
            self.spy.record(Method::Kick, Call::Kick { hw });
            self.cond.notify_all();
        }
    }

    fn hw_init(&self, hw: HardwareId) -> Result<(), VipError> {
        self.spy.record(Method::HwInit, Call::HwInit { hw });
        Ok(())
    }

    fn hw_reset(&self, hw: HardwareId) -> Result<(), VipError> {
        self.spy.record(Method::HwReset, Call::HwReset { hw });

        if let Some(core) = self.state.lock().cores.get_mut(&hw) {
            core.running = None;
            core.pending_irq = false;
            core.irq_status = 0;
        }
        self.cond.notify_all();
        Ok(())
    }

    fn hw_idle(&self, hw: HardwareId) -> bool {
        !self.is_running(hw)
    }

    fn hw_wait_idle(
        &self,
        device: usize,
        timeout: Duration,
        _fast: bool,
        expected: CoreMask,
    ) -> Result<(), VipError> {
        self.spy
            .record(Method::HwWaitIdle, Call::HwWaitIdle { device, expected });

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            let mut busy = false;
            let mut next = deadline;

            for core in expected.iter() {
                if let Some(sim) = state.cores.get_mut(&HardwareId::new(device, core)) {
                    sim.settle(now);
                    busy |= sim.running.is_some();
                    if let Some(done_at) = sim.done_at() {
                        next = next.min(done_at);
                    }
                }
            }

            if !busy {
                return Ok(());
            }
            if now >= deadline {
                return Err(VipError::Timeout);
            }

            self.cond.wait_until(&mut state, next);
        }
    }

    fn hw_cancel(&self, device: usize, cores: CoreMask) -> Result<(), VipError> {
        self.spy
            .record(Method::HwCancel, Call::HwCancel { device, cores });

        if *self.fail_cancel.lock() {
            return Err(VipError::failure("injected cancel failure"));
        }

        let mut state = self.state.lock();
        for core in cores.iter() {
            if let Some(sim) = state.cores.get_mut(&HardwareId::new(device, core)) {
                sim.running = None;
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn wait_interrupt(&self, hw: HardwareId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            let Some(core) = state.cores.get_mut(&hw) else {
                return false;
            };

            core.settle(now);
            if core.pending_irq {
                core.pending_irq = false;
                return true;
            }
            if now >= deadline {
                return false;
            }

            let until = core.done_at().map_or(deadline, |t| t.min(deadline));
            self.cond.wait_until(&mut state, until);
        }
    }
}

impl MemoryOps for SimPlatform {
    fn allocate_video_memory(
        &self,
        size: usize,
        _flags: AllocFlags,
        _device_mask: u32,
    ) -> Result<VideoMemory, VipError> {
        self.spy.record(Method::Allocate, Call::Allocate { size });
        Ok(self.state.lock().insert_memory(size, 0))
    }

    fn get_info(&self, mem_id: MemId) -> Result<MemInfo, VipError> {
        self.state
            .lock()
            .memory
            .get(&mem_id)
            .copied()
            .ok_or_else(|| VipError::invalid(format!("unknown memory {}", mem_id)))
    }

    fn free_video_memory(&self, mem_id: MemId) -> Result<(), VipError> {
        self.spy.record(Method::Free, Call::Free { mem_id });

        self.state
            .lock()
            .memory
            .remove(&mem_id)
            .map(|_| ())
            .ok_or_else(|| VipError::invalid(format!("unknown memory {}", mem_id)))
    }
}

impl Platform for SimPlatform {
    fn describe(&self) -> ChipInfo {
        ChipInfo {
            chip_id: self.chip_id,
            devices: self.devices.clone(),
        }
    }
}
