use crate::platform::{CoreMask, HardwareId};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Bookkeeping of one physical core.
#[derive(Debug)]
pub(crate) struct Hardware {
    pub(crate) id: HardwareId,

    /// Cleared while a job is programmed, set once its interrupt arrived.
    idle: AtomicBool,

    /// Claimed by the parallel daemon for an in-flight job.
    dispatched: AtomicBool,

    irq_count: AtomicU64,

    /// Recovery attempts left. Only replenished by `reset_recovery` at init.
    recovery_times: AtomicU32,

    /// Whether the init command was sent since the last init or reset.
    initialized: AtomicBool,

    /// Set once the recovery budget ran out. Never cleared for the lifetime
    /// of the context.
    faulted: AtomicBool,
}

impl Hardware {
    fn new(id: HardwareId, max_recovery_times: u32) -> Self {
        Self {
            id,
            idle: AtomicBool::new(true),
            dispatched: AtomicBool::new(false),
            irq_count: AtomicU64::new(0),
            recovery_times: AtomicU32::new(max_recovery_times),
            initialized: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub(crate) fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Returns false if the core was already claimed.
    pub(crate) fn claim(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.dispatched.store(false, Ordering::Release);
    }

    pub(crate) fn record_irq(&self) {
        self.irq_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn irq_count(&self) -> u64 {
        self.irq_count.load(Ordering::Relaxed)
    }

    /// Consumes one recovery attempt. Returns false once exhausted.
    pub(crate) fn take_recovery(&self) -> bool {
        self.recovery_times
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn recovery_times(&self) -> u32 {
        self.recovery_times.load(Ordering::Acquire)
    }

    pub(crate) fn reset_recovery(&self, max_recovery_times: u32) {
        self.recovery_times
            .store(max_recovery_times, Ordering::Release);
    }

    /// Returns whether the init command still has to be sent, and marks it
    /// as sent.
    pub(crate) fn needs_init_command(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn invalidate_init(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }
}

/// One device: a set of cores sharing a submission queue and a power domain.
#[derive(Debug)]
pub(crate) struct Device {
    pub(crate) index: usize,
    hardware: Vec<Hardware>,

    /// Serializes register programming against power transitions. Shared by
    /// every device when the chip has a single power domain.
    power: Arc<Mutex<()>>,
}

impl Device {
    pub(crate) fn new(
        index: usize,
        cores: usize,
        power: Arc<Mutex<()>>,
        max_recovery_times: u32,
    ) -> Self {
        Self {
            index,
            hardware: (0..cores)
                .map(|core| Hardware::new(HardwareId::new(index, core), max_recovery_times))
                .collect(),
            power,
        }
    }

    pub(crate) fn core_count(&self) -> usize {
        self.hardware.len()
    }

    pub(crate) fn hardware(&self, core: usize) -> Option<&Hardware> {
        self.hardware.get(core)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Hardware> {
        self.hardware.iter()
    }

    pub(crate) fn all_cores(&self) -> CoreMask {
        CoreMask::all(self.hardware.len())
    }

    /// Cores not claimed by an in-flight job.
    pub(crate) fn free_mask(&self) -> CoreMask {
        self.hardware
            .iter()
            .enumerate()
            .filter(|(_, hw)| !hw.is_dispatched())
            .fold(CoreMask::EMPTY, |mask, (core, _)| {
                mask | CoreMask::single(core)
            })
    }

    /// Claims every core of `cores`. All or nothing.
    pub(crate) fn claim(&self, cores: CoreMask) -> bool {
        let mut claimed = CoreMask::EMPTY;

        for core in cores.iter() {
            match self.hardware(core) {
                Some(hw) if hw.claim() => claimed = claimed | CoreMask::single(core),
                _ => {
                    self.release(claimed);
                    return false;
                }
            }
        }

        true
    }

    pub(crate) fn release(&self, cores: CoreMask) {
        cores
            .iter()
            .filter_map(|core| self.hardware(core))
            .for_each(Hardware::release);
    }

    pub(crate) fn power_lock(&self) -> MutexGuard<'_, ()> {
        self.power.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(cores: usize) -> Device {
        Device::new(0, cores, Arc::new(Mutex::new(())), 2)
    }

    #[test]
    fn test_claim_is_all_or_nothing() {
        let device = device(4);
        assert_eq!(device.free_mask(), CoreMask::all(4));

        assert!(device.claim(CoreMask::single(2)));
        assert!(!device.claim(CoreMask::from_bits(0b0110)));

        // The failed claim must not leak core 1.
        assert_eq!(device.free_mask(), CoreMask::from_bits(0b1011));

        device.release(CoreMask::single(2));
        assert_eq!(device.free_mask(), CoreMask::all(4));
    }

    #[test]
    fn test_claim_rejects_missing_core() {
        let device = device(2);
        assert!(!device.claim(CoreMask::from_bits(0b101)));
        assert_eq!(device.free_mask(), CoreMask::all(2));
    }

    #[test]
    fn test_recovery_budget() {
        let device = device(1);
        let hw = device.hardware(0).unwrap();

        assert!(hw.take_recovery());
        assert!(hw.take_recovery());
        assert!(!hw.take_recovery());
        assert_eq!(hw.recovery_times(), 0);

        hw.reset_recovery(2);
        assert_eq!(hw.recovery_times(), 2);
    }

    #[test]
    fn test_fault_survives_budget_reset() {
        let device = device(2);
        let hw = device.hardware(1).unwrap();
        assert!(!hw.is_faulted());

        hw.mark_faulted();
        hw.reset_recovery(2);

        assert!(hw.is_faulted());
        assert!(!device.hardware(0).unwrap().is_faulted());
    }

    #[test]
    fn test_init_command_sent_once_until_invalidated() {
        let device = device(1);
        let hw = device.hardware(0).unwrap();

        assert!(hw.needs_init_command());
        assert!(!hw.needs_init_command());

        hw.invalidate_init();
        assert!(hw.needs_init_command());
    }
}
