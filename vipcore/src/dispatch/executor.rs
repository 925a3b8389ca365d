use crate::context::Features;
use crate::device::{Device, Hardware};
use crate::errors::VipError;
use crate::platform::regs::*;
use crate::platform::{HardwareId, HardwareJob, Platform};
use crate::task::{CancelOutcome, DescriptorStore, Outcome, Task, Tcb};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Drives one control block through the hardware: program, wait, recover.
/// Shared by every strategy, which only decide on which thread it runs.
pub(crate) struct Executor {
    platform: Arc<dyn Platform>,
    devices: Arc<[Device]>,
    descriptors: Arc<DescriptorStore>,
    features: Features,
    recovery: bool,
    poll_interval: Duration,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("devices", &self.devices.len())
            .field("features", &self.features)
            .field("recovery", &self.recovery)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Executor {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        devices: Arc<[Device]>,
        descriptors: Arc<DescriptorStore>,
        features: Features,
        recovery: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            platform,
            devices,
            descriptors,
            features,
            recovery,
            poll_interval,
        }
    }

    pub(crate) fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub(crate) fn device(&self, index: usize) -> Result<&Device, VipError> {
        self.devices
            .get(index)
            .ok_or_else(|| VipError::invalid(format!("device {} does not exist", index)))
    }

    fn hardware(&self, hw: HardwareId) -> Result<&Hardware, VipError> {
        self.device(hw.device)?
            .hardware(hw.core)
            .ok_or_else(|| VipError::invalid(format!("core {} does not exist", hw.core)))
    }

    pub(crate) fn estimated_time(&self, task: &Task) -> Option<Duration> {
        self.descriptors
            .lookup(task.id)
            .ok()
            .and_then(|desc| desc.estimated_time(task.id.subtask()))
    }

    /// Runs a `Ready` block to completion on the calling thread.
    pub(crate) fn run(&self, tcb: &Tcb) {
        if self.start(tcb) {
            self.finish(tcb);
        }
    }

    /// Programs the hardware for a `Ready` block. Returns whether a hardware
    /// job is now running and `finish` must be called.
    pub(crate) fn start(&self, tcb: &Tcb) -> bool {
        let started = tcb.begin(|task| {
            let desc = self.descriptors.lookup(task.id)?;

            match self.descriptors.job(&desc, task)? {
                Some(job) => {
                    self.program(&job)?;
                    Ok(Some(job))
                }
                None => Ok(None),
            }
        });

        match started {
            Ok(true) if tcb.job().is_some() => true,
            Ok(true) => {
                // Skipped descriptor, nothing was sent to the hardware.
                tcb.complete(Outcome::Success);
                false
            }
            // Canceled while queued.
            Ok(false) => false,
            Err(e) => {
                error!(task = ?tcb.task(), error = %e, "failed to program hardware");
                tcb.complete(Outcome::Faulted(e.to_string()));
                false
            }
        }
    }

    /// Waits for the running job of `tcb` and records its outcome.
    pub(crate) fn finish(&self, tcb: &Tcb) {
        self.finish_until(tcb, None);
    }

    /// Like `finish`, but gives up once `until` passes. The job keeps its own
    /// budget and a later call resumes the wait. Returns whether an outcome
    /// was recorded.
    pub(crate) fn finish_until(&self, tcb: &Tcb, until: Option<Instant>) -> bool {
        let Some(job) = tcb.job() else {
            return true;
        };

        let deadline = tcb
            .deadline()
            .unwrap_or_else(|| Instant::now() + tcb.time_out());

        let Some(outcome) = self.wait_job(tcb, &job, deadline, until) else {
            return false;
        };
        let outcome = tcb.complete(outcome);

        if matches!(outcome, Outcome::Success)
            && let (Some(task), Some(elapsed)) = (tcb.task(), tcb.elapsed())
            && let Ok(desc) = self.descriptors.lookup(task.id)
        {
            desc.record_infer_time(task.id.subtask(), elapsed);
        }

        true
    }

    fn program(&self, job: &HardwareJob) -> Result<(), VipError> {
        let device = self.device(job.device)?;

        if job.cores.is_empty() || !job.cores.is_subset_of(device.all_cores()) {
            return Err(VipError::invalid(format!(
                "{:?} is not a core range of device {}",
                job.cores, job.device
            )));
        }

        let _power = device.power_lock();

        for hw in job.hardware() {
            if self.hardware(hw)?.is_faulted() {
                return Err(VipError::failure(format!(
                    "{:?} is faulted, no recovery attempt left",
                    hw
                )));
            }
        }

        for hw in job.hardware() {
            let state = self.hardware(hw)?;
            state.set_idle(false);

            self.platform
                .write_register(hw, REG_IRQ_ENABLE, IRQ_ENABLE_ALL);

            for patch in &job.patches {
                self.platform.write_register(hw, patch.offset, patch.value);
            }

            let init = job.init.filter(|_| state.needs_init_command());
            let mut count = 0;

            for cmd in init.iter().chain(job.commands.iter()) {
                self.platform
                    .write_register(hw, REG_CMD_BUFFER_ADDR, cmd.device_addr);
                self.platform.write_register(hw, REG_CMD_BUFFER_SIZE, cmd.size);
                count += 1;
            }

            self.platform.write_register(
                hw,
                REG_CMD_BUFFER_CTRL,
                CMD_BUFFER_ENABLE | (count & CMD_BUFFER_COUNT_MASK),
            );
        }

        debug!(device = job.device, cores = ?job.cores, "hardware job started");
        Ok(())
    }

    /// Waits for the interrupt of every core of `job` in slices of
    /// `poll_interval`, checking for cancellation between slices.
    ///
    /// Returns `None` when `until` passed before the job `deadline`. Cores
    /// that already raised their interrupt are idle and skipped on the next
    /// call.
    fn wait_job(
        &self,
        tcb: &Tcb,
        job: &HardwareJob,
        deadline: Instant,
        until: Option<Instant>,
    ) -> Option<Outcome> {
        for hw in job.hardware() {
            let state = match self.hardware(hw) {
                Ok(state) => state,
                Err(e) => return Some(Outcome::Faulted(e.to_string())),
            };

            while !state.is_idle() {
                if tcb.is_canceled() {
                    self.mark_idle(job);
                    return Some(Outcome::Canceled);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Some(self.on_timeout(tcb, job, tcb.time_out()));
                }

                let mut slice = self.poll_interval.min(deadline - now);
                if let Some(until) = until {
                    if now >= until {
                        return None;
                    }
                    slice = slice.min(until - now);
                }

                if !self.platform.wait_interrupt(hw, slice) {
                    continue;
                }

                state.record_irq();
                let status = self.platform.read_register(hw, REG_IRQ_ACK);
                if status & IRQ_BUS_ERROR != 0 {
                    error!(?hw, status, "bus error reported by hardware");
                    return Some(Outcome::Faulted(format!("bus error on {:?}", hw)));
                }

                state.set_idle(true);
            }
        }

        Some(Outcome::Success)
    }

    fn on_timeout(&self, tcb: &Tcb, job: &HardwareJob, timeout: Duration) -> Outcome {
        warn!(task = ?tcb.task(), ?timeout, "hardware timed out");

        if !self.recovery {
            return Outcome::TimedOut;
        }

        match self.recover(job) {
            Ok(()) => {
                info!(device = job.device, cores = ?job.cores, "hardware recovered");
                Outcome::Recovered
            }
            Err(e) => {
                error!(device = job.device, error = %e, "hardware recovery failed");
                Outcome::TimedOut
            }
        }
    }

    /// Resets and re-inits every core of `job`, consuming one recovery
    /// attempt per core.
    fn recover(&self, job: &HardwareJob) -> Result<(), VipError> {
        let device = self.device(job.device)?;
        let _power = device.power_lock();

        for hw in job.hardware() {
            let state = self.hardware(hw)?;

            if !state.take_recovery() {
                state.mark_faulted();
                error!(?hw, "recovery budget exhausted, hardware faulted");
                return Err(VipError::failure(format!(
                    "no recovery attempt left for {:?}",
                    hw
                )));
            }

            warn!(?hw, left = state.recovery_times(), "resetting hardware");
            self.platform.hw_reset(hw)?;
            self.platform.hw_init(hw)?;

            state.invalidate_init();
            state.set_idle(true);
        }

        Ok(())
    }

    fn mark_idle(&self, job: &HardwareJob) {
        for hw in job.hardware() {
            if let Ok(state) = self.hardware(hw) {
                state.set_idle(true);
            }
        }
    }

    /// Cancels `tcb`. A running job is aborted through the hardware when the
    /// chip supports it, otherwise the cores are waited idle.
    pub(crate) fn cancel(&self, tcb: &Tcb) -> Result<CancelOutcome, VipError> {
        tcb.cancel(|task| {
            if self.features.contains(Features::JOB_CANCEL) {
                self.platform.hw_cancel(task.device, task.cores)
            } else {
                self.platform.hw_wait_idle(
                    task.device,
                    self.features.cancel_idle_timeout(),
                    false,
                    task.cores,
                )
            }
        })
    }
}
