//! SSB placement
//!
//! Derives where the SS/PBCH block sits relative to Point A from the two
//! carrier frequencies the operator configures (3GPP TS 38.211 section 7.4.3
//! and TS 38.213 section 4.1).

use crate::LayerError;
use common::types::{Pci, SubcarrierSpacing, NRE};
use std::fmt;
use tracing::info;

/// Subcarriers in one SS/PBCH block
const SSB_NOF_SUBCARRIERS: f64 = 240.0;

/// Frequencies below this use L_max = 4
const LMAX_4_LIMIT_HZ: f64 = 3.0e9;
/// Upper end of FR1
const FR1_LIMIT_HZ: f64 = 7.125e9;

/// Fraction of a subcarrier tolerated when checking integer offsets
const FREQ_TOLERANCE: f64 = 1e-6;

/// Candidate SS/PBCH block pattern (TS 38.213 section 4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsbPatternCase {
    A,
    B,
    C,
    D,
    E,
}

impl SsbPatternCase {
    /// Default pattern for an SSB subcarrier spacing; 30 kHz maps to case C
    pub fn from_scs(scs: SubcarrierSpacing) -> Result<Self, LayerError> {
        match scs {
            SubcarrierSpacing::Scs15 => Ok(Self::A),
            SubcarrierSpacing::Scs30 => Ok(Self::C),
            SubcarrierSpacing::Scs120 => Ok(Self::D),
            SubcarrierSpacing::Scs240 => Ok(Self::E),
            SubcarrierSpacing::Scs60 => Err(LayerError::InvalidConfiguration(
                "60 kHz is not an SSB subcarrier spacing".into(),
            )),
        }
    }
}

/// Where and how often the SSB is transmitted
#[derive(Debug, Clone, PartialEq)]
pub struct SsbConfiguration {
    pub pci: Pci,
    pub period_ms: u32,
    pub l_max: u32,
    pub pattern_case: SsbPatternCase,
    pub scs: SubcarrierSpacing,
    /// Offset from Point A to the common resource block holding the SSB, in
    /// 15 kHz resource blocks
    pub offset_to_point_a: u32,
    /// k_SSB: subcarrier offset from that resource block to the SSB, in
    /// 15 kHz subcarriers
    pub subcarrier_offset: u32,
}

impl SsbConfiguration {
    /// Compute the SSB placement of a carrier.
    ///
    /// `bandwidth_rb` is in resource blocks of `scs`, which is both the
    /// common and the SSB subcarrier spacing.
    pub fn from_center_frequencies(
        pci: Pci,
        scs: SubcarrierSpacing,
        bandwidth_rb: usize,
        dl_center_freq_hz: f64,
        ssb_center_freq_hz: f64,
        period_ms: u32,
    ) -> Result<Self, LayerError> {
        let scs_hz = scs.to_hz() as f64;
        let point_a = dl_center_freq_hz - (bandwidth_rb * NRE) as f64 * scs_hz / 2.0;
        let ssb_lowest = ssb_center_freq_hz - SSB_NOF_SUBCARRIERS / 2.0 * scs_hz;
        let offset_hz = ssb_lowest - point_a;

        if offset_hz < 0.0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSB at {:.3} MHz starts {:.3} kHz below Point A ({:.3} MHz)",
                ssb_center_freq_hz / 1e6,
                -offset_hz / 1e3,
                point_a / 1e6
            )));
        }

        let offset_15k = offset_hz / 15e3;
        if (offset_15k - offset_15k.round()).abs() > FREQ_TOLERANCE {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSB offset to Point A of {:.3} kHz is not a whole number of 15 kHz subcarriers",
                offset_hz / 1e3
            )));
        }
        let offset_15k = offset_15k.round() as u32;

        let ratio = scs.ratio_to_15khz();
        if offset_15k % ratio != 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSB offset to Point A of {} subcarriers of 15 kHz is not aligned to {} subcarriers",
                offset_15k, scs
            )));
        }

        // Round down to a resource block of the SSB numerology
        let crb = offset_15k / NRE as u32;
        let offset_to_point_a = crb - crb % ratio;
        let subcarrier_offset = offset_15k - NRE as u32 * offset_to_point_a;

        let config = Self {
            pci,
            period_ms,
            l_max: l_max(ssb_center_freq_hz),
            pattern_case: SsbPatternCase::from_scs(scs)?,
            scs,
            offset_to_point_a,
            subcarrier_offset,
        };
        info!("SSB placement: {}", config);
        Ok(config)
    }

    /// Override the default pattern case
    pub fn with_pattern_case(mut self, pattern_case: SsbPatternCase) -> Self {
        self.pattern_case = pattern_case;
        self
    }
}

impl fmt::Display for SsbConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pci={} period={}ms L_max={} case {:?} offset_to_pointA={} k_ssb={}",
            self.pci.0, self.period_ms, self.l_max, self.pattern_case, self.offset_to_point_a, self.subcarrier_offset
        )
    }
}

/// Maximum number of SSB beams for a carrier frequency
fn l_max(freq_hz: f64) -> u32 {
    if freq_hz < LMAX_4_LIMIT_HZ {
        4
    } else if freq_hz <= FR1_LIMIT_HZ {
        8
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n78(ssb_center: f64) -> Result<SsbConfiguration, LayerError> {
        SsbConfiguration::from_center_frequencies(
            Pci(1),
            SubcarrierSpacing::Scs30,
            52,
            3_500_000_000.0,
            ssb_center,
            20,
        )
    }

    #[test]
    fn test_n78_placement() {
        // Point A sits at 3490.64 MHz
        let config = n78(3_503_030_000.0).unwrap();
        assert_eq!(config.offset_to_point_a, 48);
        assert_eq!(config.subcarrier_offset, 10);
        assert!(config.subcarrier_offset < NRE as u32);
        assert_eq!(config.pattern_case, SsbPatternCase::C);
        assert_eq!(config.l_max, 8);
    }

    #[test]
    fn test_misaligned_offset_is_rejected() {
        // 587 subcarriers of 15 kHz: not a multiple of 2
        assert!(matches!(n78(3_503_045_000.0), Err(LayerError::InvalidConfiguration(_))));
        // Not a whole 15 kHz subcarrier
        assert!(n78(3_503_035_000.0).is_err());
        // Below Point A
        assert!(n78(3_490_000_000.0).is_err());
    }

    #[test]
    fn test_n7_placement() {
        let config = SsbConfiguration::from_center_frequencies(
            Pci(1),
            SubcarrierSpacing::Scs15,
            106,
            2_680_000_000.0,
            2_674_060_000.0,
            10,
        )
        .unwrap();
        assert_eq!(config.offset_to_point_a, 10);
        assert_eq!(config.subcarrier_offset, 0);
        assert_eq!(config.pattern_case, SsbPatternCase::A);
        assert_eq!(config.l_max, 4);
    }

    #[test]
    fn test_l_max() {
        assert_eq!(l_max(2.6e9), 4);
        assert_eq!(l_max(3.5e9), 8);
        assert_eq!(l_max(28e9), 64);
    }
}
