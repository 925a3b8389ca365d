use crate::errors::VipError;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Upper bound on hardware cores per device.
pub const MAX_CORES: usize = 32;

/// Set of hardware cores inside one device, one bit per core index.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CoreMask(u32);

impl CoreMask {
    pub const EMPTY: CoreMask = CoreMask(0);

    pub const fn from_bits(bits: u32) -> Self {
        CoreMask(bits)
    }

    pub const fn single(core: usize) -> Self {
        CoreMask(1 << core)
    }

    /// Contiguous range `[index, index + cnt)`.
    pub fn from_range(index: usize, cnt: usize) -> Result<Self, VipError> {
        match index.checked_add(cnt) {
            Some(end) if cnt > 0 && end <= MAX_CORES => {
                let bits = ((1u64 << cnt) - 1) << index;
                Ok(CoreMask(bits as u32))
            }
            _ => Err(VipError::invalid(format!(
                "core range {}+{} is not addressable",
                index, cnt
            ))),
        }
    }

    /// Every core of a device with `count` cores.
    pub fn all(count: usize) -> Self {
        CoreMask::from_range(0, count.clamp(1, MAX_CORES)).unwrap_or(CoreMask::EMPTY)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, core: usize) -> bool {
        core < MAX_CORES && self.0 & (1 << core) != 0
    }

    pub const fn is_subset_of(&self, other: CoreMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn first(&self) -> Option<usize> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CORES).filter(|core| self.contains(*core))
    }
}

impl BitOr for CoreMask {
    type Output = CoreMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        CoreMask(self.0 | rhs.0)
    }
}

impl BitAnd for CoreMask {
    type Output = CoreMask;

    fn bitand(self, rhs: Self) -> Self::Output {
        CoreMask(self.0 & rhs.0)
    }
}

impl Not for CoreMask {
    type Output = CoreMask;

    fn not(self) -> Self::Output {
        CoreMask(!self.0)
    }
}

impl fmt::Debug for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreMask({:#x})", self.0)
    }
}
