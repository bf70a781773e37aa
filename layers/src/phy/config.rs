//! Lower PHY configuration and dependencies

use super::amplitude_control::AmplitudeControllerConfig;
use super::baseband_processor::BufferSizePolicy;
use super::frame_structure::SymbolTiming;
use super::notifiers::{LowerPhyErrorNotifier, LowerPhyRxSymbolNotifier, LowerPhyTimingNotifier};
use crate::LayerError;
use common::executor::TaskExecutor;
use common::types::{CyclicPrefix, SamplingRate, SubcarrierSpacing, NRE};
use interfaces::RadioSession;
use std::sync::Arc;

/// One carrier served by the lower PHY
#[derive(Debug, Clone, PartialEq)]
pub struct SectorDescription {
    /// Carrier bandwidth in resource blocks
    pub bandwidth_rb: usize,
    /// Downlink center frequency
    pub dl_freq_hz: f64,
    /// Uplink center frequency
    pub ul_freq_hz: f64,
    pub nof_tx_ports: usize,
    pub nof_rx_ports: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LowerPhyConfiguration {
    pub srate: SamplingRate,
    pub scs: SubcarrierSpacing,
    pub cp: CyclicPrefix,
    /// Slots between a TTI boundary and the transmission of its slot
    pub max_processing_delay_slots: usize,
    /// Uplink DFT window position as a fraction of the cyclic prefix
    pub dft_window_offset: f32,
    /// Time between the radio start and slot 0
    pub start_delay_ms: Option<u32>,
    pub buffer_size_policy: BufferSizePolicy,
    pub amplitude: AmplitudeControllerConfig,
    pub sectors: Vec<SectorDescription>,
}

impl LowerPhyConfiguration {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.sectors.is_empty() {
            return Err(LayerError::InvalidConfiguration("No sectors configured".into()));
        }
        let dft_size = SymbolTiming::new(self.srate, self.scs, self.cp)?.dft_size();
        if !(0.0..=1.0).contains(&self.dft_window_offset) {
            return Err(LayerError::InvalidConfiguration(format!(
                "DFT window offset {} outside [0, 1]",
                self.dft_window_offset
            )));
        }
        if self.amplitude.full_scale <= 0.0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Full scale amplitude {} must be positive",
                self.amplitude.full_scale
            )));
        }

        for (index, sector) in self.sectors.iter().enumerate() {
            if sector.nof_tx_ports == 0 || sector.nof_rx_ports == 0 {
                return Err(LayerError::InvalidConfiguration(format!(
                    "Sector {} needs at least one transmit and one receive port",
                    index
                )));
            }
            if sector.bandwidth_rb == 0 || sector.bandwidth_rb * NRE > dft_size {
                return Err(LayerError::InvalidConfiguration(format!(
                    "Sector {}: {} RB do not fit a DFT of size {}",
                    index, sector.bandwidth_rb, dft_size
                )));
            }
        }
        Ok(())
    }

    /// Samples between the radio start and slot 0
    pub fn start_delay_samples(&self) -> u64 {
        self.start_delay_ms.unwrap_or(0) as u64 * self.srate.to_hz() / 1000
    }
}

/// Executors the lower PHY runs on; the same executor may appear more than once
#[derive(Clone)]
pub struct LowerPhyExecutors {
    pub rx: Arc<dyn TaskExecutor>,
    pub tx: Arc<dyn TaskExecutor>,
    pub ul: Arc<dyn TaskExecutor>,
    pub dl: Arc<dyn TaskExecutor>,
    pub prach: Arc<dyn TaskExecutor>,
}

/// Everything the lower PHY talks to
pub struct LowerPhyDependencies {
    pub radio: Arc<dyn RadioSession>,
    pub executors: LowerPhyExecutors,
    pub rx_symbol_notifier: Arc<dyn LowerPhyRxSymbolNotifier>,
    pub timing_notifier: Arc<dyn LowerPhyTimingNotifier>,
    pub error_notifier: Arc<dyn LowerPhyErrorNotifier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LowerPhyConfiguration {
        LowerPhyConfiguration {
            srate: SamplingRate::from_mhz(61.44),
            scs: SubcarrierSpacing::Scs30,
            cp: CyclicPrefix::Normal,
            max_processing_delay_slots: 2,
            dft_window_offset: 0.5,
            start_delay_ms: Some(10),
            buffer_size_policy: BufferSizePolicy::Slot,
            amplitude: AmplitudeControllerConfig::default(),
            sectors: vec![SectorDescription {
                bandwidth_rb: 52,
                dl_freq_hz: 3.5e9,
                ul_freq_hz: 3.5e9,
                nof_tx_ports: 1,
                nof_rx_ports: 1,
            }],
        }
    }

    #[test]
    fn test_valid_configuration() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.start_delay_samples(), 614_400);
    }

    #[test]
    fn test_invalid_configurations() {
        let mut c = config();
        c.srate = SamplingRate::from_mhz(11.52);
        c.scs = SubcarrierSpacing::Scs120;
        assert!(matches!(c.validate(), Err(LayerError::InvalidConfiguration(_))));

        let mut c = config();
        c.sectors.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.sectors[0].nof_rx_ports = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.sectors[0].bandwidth_rb = 273;
        assert!(c.validate().is_err());

        let mut c = config();
        c.cp = CyclicPrefix::Extended;
        assert!(c.validate().is_err());
    }
}
