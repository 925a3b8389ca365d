use crate::errors::VipError;
use bitflags::bitflags;
use std::time::Duration;

bitflags! {
    /// Capabilities that gate correctness-critical paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// The hardware can abort a running job.
        const JOB_CANCEL = 1 << 0;

        /// MMU page directory mode, VIP virtual addressing.
        const MMU_PDMODE = 1 << 1;

        /// FPGA prototype, much slower than silicon.
        const FPGA = 1 << 2;

        /// All devices sit in one power domain.
        const SHARED_POWER = 1 << 3;
    }
}

const CANCEL_IDLE_TIMEOUT: Duration = Duration::from_millis(300);
const FPGA_CANCEL_IDLE_TIMEOUT: Duration = Duration::from_millis(3000);

impl Features {
    /// How long a cancel waits for idle when the job can't be aborted.
    pub fn cancel_idle_timeout(&self) -> Duration {
        if self.contains(Features::FPGA) {
            FPGA_CANCEL_IDLE_TIMEOUT
        } else {
            CANCEL_IDLE_TIMEOUT
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRow {
    pub chip_id: u32,
    pub name: &'static str,
    pub features: Features,
}

const fn row(chip_id: u32, name: &'static str, features: Features) -> FeatureRow {
    FeatureRow {
        chip_id,
        name,
        features,
    }
}

static FEATURE_DATABASE: &[FeatureRow] = &[
    row(0x0000_8000, "vip8000", Features::MMU_PDMODE),
    row(
        0x0000_9000,
        "vip9000",
        Features::JOB_CANCEL.union(Features::MMU_PDMODE),
    ),
    row(
        0x0000_9003,
        "vip9000-dual",
        Features::JOB_CANCEL
            .union(Features::MMU_PDMODE)
            .union(Features::SHARED_POWER),
    ),
    row(0x0000_90f0, "vip9000-fpga", Features::MMU_PDMODE.union(Features::FPGA)),
];

/// Selects the feature row of `chip_id`. An unknown chip is fatal, running
/// with guessed features could drive the MMU in the wrong mode.
pub fn lookup(chip_id: u32) -> Result<&'static FeatureRow, VipError> {
    FEATURE_DATABASE
        .iter()
        .find(|row| row.chip_id == chip_id)
        .ok_or_else(|| VipError::failure(format!("unknown chip id {:#x}", chip_id)))
}
