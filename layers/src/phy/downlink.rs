//! Downlink Processor
//!
//! Produces the transmit baseband of one sector for any block of timestamps.
//! Symbols are modulated whole and cached, so blocks that do not line up with
//! symbol boundaries cost no extra modulation.

use super::amplitude_control::{AmplitudeController, AmplitudeMetricsCollector};
use super::frame_structure::SymbolTiming;
use super::notifiers::{LowerPhyTimingContext, LowerPhyTimingNotifier};
use super::pdxch::PdxchProcessor;
use crate::LayerError;
use interfaces::{BasebandBuffer, BasebandTimestamp};
use std::sync::Arc;
use tracing::{debug, trace};

/// Frames between two amplitude metric reports
const METRICS_REPORT_FRAMES: u64 = 100;

pub struct DownlinkProcessor {
    sector: usize,
    timing: SymbolTiming,
    max_processing_delay_slots: u64,
    init_time: Option<BasebandTimestamp>,
    pdxch: PdxchProcessor,
    amplitude: Box<dyn AmplitudeController>,
    metrics: Arc<AmplitudeMetricsCollector>,
    timing_notifier: Arc<dyn LowerPhyTimingNotifier>,
    /// Last modulated symbol, one channel per port
    symbol: BasebandBuffer,
    /// Start of the cached symbol relative to the init time
    symbol_start: Option<u64>,
    last_slot: Option<u64>,
}

impl DownlinkProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sector: usize,
        timing: SymbolTiming,
        nof_tx_ports: usize,
        max_processing_delay_slots: usize,
        pdxch: PdxchProcessor,
        amplitude: Box<dyn AmplitudeController>,
        metrics: Arc<AmplitudeMetricsCollector>,
        timing_notifier: Arc<dyn LowerPhyTimingNotifier>,
    ) -> Self {
        let symbol = BasebandBuffer::new(nof_tx_ports, timing.max_symbol_size());
        Self {
            sector,
            timing,
            max_processing_delay_slots: max_processing_delay_slots as u64,
            init_time: None,
            pdxch,
            amplitude,
            metrics,
            timing_notifier,
            symbol,
            symbol_start: None,
            last_slot: None,
        }
    }

    /// Time of the first sample of slot 0
    pub fn set_init_time(&mut self, init_time: BasebandTimestamp) {
        self.init_time = Some(init_time);
        self.symbol_start = None;
        self.last_slot = None;
    }

    pub fn metrics(&self) -> &Arc<AmplitudeMetricsCollector> {
        &self.metrics
    }

    /// Fill `buffer` with the baseband starting at `timestamp`
    pub fn process(&mut self, buffer: &mut BasebandBuffer, timestamp: BasebandTimestamp) -> Result<(), LayerError> {
        let nof_samples = buffer.nof_samples();
        let init_time = match self.init_time {
            Some(init_time) if init_time < timestamp + nof_samples as u64 => init_time,
            _ => {
                buffer.fill_zero();
                return Ok(());
            }
        };

        let mut i = 0;
        if timestamp < init_time {
            i = (init_time - timestamp) as usize;
            for port in 0..buffer.nof_channels() {
                buffer.channel_mut(port)[..i].fill(Default::default());
            }
        }

        while i < nof_samples {
            let sample = timestamp + i as u64 - init_time;
            let position = self.timing.locate(sample);
            let start = sample - position.offset as u64;

            if self.symbol_start != Some(start) {
                self.new_symbol(init_time, position.slot_count, position.symbol_in_subframe, position.symbol_size)?;
                self.symbol_start = Some(start);
            }

            let count = (position.symbol_size - position.offset).min(nof_samples - i);
            for port in 0..buffer.nof_channels() {
                let src = &self.symbol.channel(port)[position.offset..position.offset + count];
                buffer.channel_mut(port)[i..i + count].copy_from_slice(src);
            }
            i += count;
        }
        Ok(())
    }

    fn new_symbol(
        &mut self,
        init_time: BasebandTimestamp,
        slot_count: u64,
        symbol_in_subframe: usize,
        symbol_size: usize,
    ) -> Result<(), LayerError> {
        if self.last_slot != Some(slot_count) {
            self.last_slot = Some(slot_count);
            let target = slot_count + self.max_processing_delay_slots;
            let context = LowerPhyTimingContext {
                slot: self.timing.slot_point(target),
                time: init_time + self.timing.slot_start(slot_count),
            };
            trace!("Sector {}: TTI boundary for slot {}", self.sector, context.slot);
            self.timing_notifier.on_tti_boundary(&context);

            let report_period = METRICS_REPORT_FRAMES * self.timing.scs().slots_per_frame() as u64;
            if slot_count % report_period == 0 && slot_count > 0 {
                debug!("Sector {} amplitude: {}", self.sector, self.metrics.summary());
            }
        }

        self.symbol.resize(symbol_size);
        let slot = self.timing.slot_point(slot_count);
        self.pdxch.process_symbol(&mut self.symbol, slot, symbol_in_subframe)?;
        for port in 0..self.symbol.nof_channels() {
            let metrics = self.amplitude.process(self.symbol.channel_mut(port));
            self.metrics.update(&metrics);
        }
        Ok(())
    }
}
