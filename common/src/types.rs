//! Common Types for the Lower PHY
//!
//! Numerology, sampling rate and slot timing types shared by the radio
//! boundary, the lower physical layer and the example application.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Number of subframes in a radio frame
pub const NOF_SUBFRAMES_PER_FRAME: u32 = 10;

/// Number of system frame numbers before the frame counter wraps
pub const NOF_SFNS: u32 = 1024;

/// Number of subcarriers in a resource block
pub const NRE: usize = 12;

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Parse a spacing given in kHz
    pub fn from_khz(khz: u32) -> Option<Self> {
        Self::from_u32(khz)
    }

    /// Spacing in kHz
    pub fn to_khz(self) -> u32 {
        self as u32
    }

    /// Spacing in Hz
    pub fn to_hz(self) -> u32 {
        self.to_khz() * 1000
    }

    /// Numerology index (mu)
    pub fn numerology(self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Number of slots in one subframe (1 ms)
    pub fn slots_per_subframe(self) -> u32 {
        1 << self.numerology()
    }

    /// Number of slots in one frame (10 ms)
    pub fn slots_per_frame(self) -> u32 {
        self.slots_per_subframe() * NOF_SUBFRAMES_PER_FRAME
    }

    /// Ratio between this spacing and 15 kHz
    pub fn ratio_to_15khz(self) -> u32 {
        self.to_khz() / 15
    }
}

impl fmt::Display for SubcarrierSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kHz", self.to_khz())
    }
}

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CyclicPrefix {
    Normal,
    Extended,
}

impl CyclicPrefix {
    /// Number of OFDM symbols in a slot
    pub fn symbols_per_slot(self) -> usize {
        match self {
            CyclicPrefix::Normal => 14,
            CyclicPrefix::Extended => 12,
        }
    }

    /// Checks that every cyclic prefix of a subframe is an integer number of
    /// samples for the given DFT size.
    ///
    /// The extended cyclic prefix is only defined for 60 kHz.
    pub fn is_valid(self, scs: SubcarrierSpacing, dft_size: usize) -> bool {
        match self {
            CyclicPrefix::Normal => {
                (144 * dft_size) % 2048 == 0
                    && ((16 * dft_size) << scs.numerology()) % 2048 == 0
            }
            CyclicPrefix::Extended => {
                scs == SubcarrierSpacing::Scs60 && (512 * dft_size) % 2048 == 0
            }
        }
    }

    /// Cyclic prefix length in samples of the symbol with index
    /// `symbol_in_subframe` (counted from the start of the subframe).
    ///
    /// TS 38.211 section 5.3.1: with normal CP the symbols at `l = 0` and
    /// `l = 7 * 2^mu` carry an extra `16 * kappa` samples.
    pub fn length(self, symbol_in_subframe: usize, scs: SubcarrierSpacing, dft_size: usize) -> usize {
        match self {
            CyclicPrefix::Normal => {
                let base = (144 * dft_size) / 2048;
                let half_subframe = 7usize << scs.numerology();
                if symbol_in_subframe % half_subframe == 0 {
                    base + ((16 * dft_size) << scs.numerology()) / 2048
                } else {
                    base
                }
            }
            CyclicPrefix::Extended => (512 * dft_size) / 2048,
        }
    }
}

/// Baseband sampling rate, stored in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SamplingRate {
    hz: u64,
}

impl SamplingRate {
    /// Create from a rate in Hz
    pub fn from_hz(hz: u64) -> Self {
        Self { hz }
    }

    /// Create from a rate in MHz, rounded to the nearest Hz
    pub fn from_mhz(mhz: f64) -> Self {
        Self { hz: (mhz * 1e6).round() as u64 }
    }

    /// Rate in Hz
    pub fn to_hz(self) -> u64 {
        self.hz
    }

    /// Rate in MHz
    pub fn to_mhz(self) -> f64 {
        self.hz as f64 / 1e6
    }

    /// DFT size of one OFDM symbol at this rate
    pub fn dft_size(self, scs: SubcarrierSpacing) -> usize {
        (self.hz / scs.to_hz() as u64) as usize
    }

    /// Number of samples in one subframe (1 ms)
    pub fn samples_per_subframe(self) -> usize {
        (self.hz / 1000) as usize
    }

    /// Checks that the rate is an integer multiple of the subcarrier spacing
    /// and that the normal cyclic prefix lengths are whole samples.
    pub fn is_valid(self, scs: SubcarrierSpacing) -> bool {
        let scs_hz = scs.to_hz() as u64;
        if self.hz == 0 || self.hz % scs_hz != 0 {
            return false;
        }
        CyclicPrefix::Normal.is_valid(scs, self.dft_size(scs))
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} MHz", self.to_mhz())
    }
}

/// Slot identifier: numerology plus the slot count within 1024 frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotPoint {
    scs: SubcarrierSpacing,
    count: u32,
}

impl SlotPoint {
    /// Create from system frame number and slot index within the frame
    pub fn new(scs: SubcarrierSpacing, sfn: u32, slot_index: u32) -> Self {
        let count = (sfn % NOF_SFNS) * scs.slots_per_frame() + slot_index % scs.slots_per_frame();
        Self { scs, count }
    }

    /// Create from an absolute slot count (wrapped to 1024 frames)
    pub fn from_count(scs: SubcarrierSpacing, count: u64) -> Self {
        let period = Self::period(scs) as u64;
        Self { scs, count: (count % period) as u32 }
    }

    fn period(scs: SubcarrierSpacing) -> u32 {
        NOF_SFNS * scs.slots_per_frame()
    }

    /// Subcarrier spacing of the numerology
    pub fn scs(&self) -> SubcarrierSpacing {
        self.scs
    }

    /// Numerology index
    pub fn numerology(&self) -> u8 {
        self.scs.numerology()
    }

    /// Slot count within 1024 frames
    pub fn count(&self) -> u32 {
        self.count
    }

    /// System frame number
    pub fn sfn(&self) -> u32 {
        self.count / self.scs.slots_per_frame()
    }

    /// Slot index within the frame
    pub fn slot_index(&self) -> u32 {
        self.count % self.scs.slots_per_frame()
    }

    /// Subframe index within the frame
    pub fn subframe_index(&self) -> u32 {
        self.slot_index() / self.scs.slots_per_subframe()
    }

    /// Signed distance `self - other` in slots, taking the shortest way
    /// around the 1024-frame wrap.
    pub fn diff(&self, other: &SlotPoint) -> i64 {
        let period = Self::period(self.scs) as i64;
        let mut d = (self.count as i64 - other.count as i64).rem_euclid(period);
        if d >= period / 2 {
            d -= period;
        }
        d
    }
}

impl Add<u32> for SlotPoint {
    type Output = SlotPoint;

    fn add(self, rhs: u32) -> SlotPoint {
        SlotPoint::from_count(self.scs, self.count as u64 + rhs as u64)
    }
}

impl AddAssign<u32> for SlotPoint {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<u32> for SlotPoint {
    type Output = SlotPoint;

    fn sub(self, rhs: u32) -> SlotPoint {
        let period = Self::period(self.scs) as u64;
        let rhs = rhs as u64 % period;
        SlotPoint::from_count(self.scs, self.count as u64 + period - rhs)
    }
}

impl fmt::Display for SlotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.slot_index())
    }
}
