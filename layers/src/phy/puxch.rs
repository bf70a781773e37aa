//! PUxCH Processor
//!
//! Demodulates received symbols into the uplink grids requested by the upper
//! layers and reports every demodulated symbol as soon as it is ready.

use super::notifiers::{
    LowerPhyErrorNotifier, LowerPhyRxSymbolContext, LowerPhyRxSymbolNotifier, ResourceGridContext,
};
use super::ofdm::OfdmSymbolDemodulator;
use super::request_queue::{RequestRejection, SlotRequestQueue};
use super::resource_grid::PooledGrid;
use crate::LayerError;
use common::types::SlotPoint;
use interfaces::BasebandBuffer;
use std::sync::Arc;
use tracing::trace;

/// Accepts uplink slot requests for one sector
pub struct PuxchRequestHandler {
    queue: Arc<SlotRequestQueue>,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
}

impl PuxchRequestHandler {
    pub fn handle_request(&self, context: &ResourceGridContext, grid: PooledGrid) {
        match self.queue.push(*context, grid) {
            Ok(()) => trace!("Queued UL grid for slot {}", context.slot),
            Err(RequestRejection::Late) => self.error_notifier.on_puxch_request_late(context),
            Err(RequestRejection::Overflow) => self.error_notifier.on_puxch_request_overflow(context),
        }
    }
}

/// Fills the requested uplink grids of one sector
pub struct PuxchProcessor {
    sector: usize,
    symbols_per_slot: usize,
    queue: Arc<SlotRequestQueue>,
    demodulator: OfdmSymbolDemodulator,
    rx_notifier: Arc<dyn LowerPhyRxSymbolNotifier>,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    current_slot: Option<SlotPoint>,
    current_grid: Option<PooledGrid>,
}

impl PuxchProcessor {
    pub fn new(
        sector: usize,
        symbols_per_slot: usize,
        max_processing_delay_slots: usize,
        demodulator: OfdmSymbolDemodulator,
        rx_notifier: Arc<dyn LowerPhyRxSymbolNotifier>,
        error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    ) -> Self {
        Self {
            sector,
            symbols_per_slot,
            queue: Arc::new(SlotRequestQueue::new(max_processing_delay_slots)),
            demodulator,
            rx_notifier,
            error_notifier,
            current_slot: None,
            current_grid: None,
        }
    }

    pub fn request_handler(&self) -> Arc<PuxchRequestHandler> {
        Arc::new(PuxchRequestHandler {
            queue: self.queue.clone(),
            error_notifier: self.error_notifier.clone(),
        })
    }

    fn begin_slot(&mut self, slot: SlotPoint) {
        let start = self.queue.start_slot(slot);
        self.current_slot = Some(slot);
        self.current_grid = start.grid;
        for context in &start.late {
            self.error_notifier.on_puxch_request_late(context);
        }
    }

    /// Demodulate one received symbol.
    ///
    /// `input` holds one channel per receive port and exactly one symbol,
    /// cyclic prefix included.
    pub fn process_symbol(
        &mut self,
        input: &BasebandBuffer,
        slot: SlotPoint,
        symbol_in_subframe: usize,
    ) -> Result<(), LayerError> {
        let symbol = symbol_in_subframe % self.symbols_per_slot;
        if symbol == 0 || self.current_slot != Some(slot) {
            self.begin_slot(slot);
        }

        if let Some(grid) = self.current_grid.as_mut() {
            let nof_ports = grid.nof_ports().min(input.nof_channels());
            for port in 0..nof_ports {
                self.demodulator
                    .demodulate(grid, input.channel(port), port, symbol_in_subframe)?;
            }
            let context = LowerPhyRxSymbolContext {
                sector: self.sector,
                slot,
                nof_symbols: symbol + 1,
            };
            self.rx_notifier.on_rx_symbol(&context, grid);
        }

        if symbol + 1 == self.symbols_per_slot {
            self.current_grid = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::dft::{DftDirection, DftFactory};
    use crate::phy::ofdm::{OfdmConfig, OfdmSymbolModulator};
    use crate::phy::resource_grid::{ResourceGrid, ResourceGridPool};
    use crate::phy::test_doubles::{CountingErrors, RecordingRx};
    use common::types::{CyclicPrefix, SubcarrierSpacing};
    use num_complex::Complex32;

    const SCS: SubcarrierSpacing = SubcarrierSpacing::Scs15;

    fn ofdm_config() -> OfdmConfig {
        OfdmConfig {
            scs: SCS,
            dft_size: 256,
            cp: CyclicPrefix::Normal,
            bw_rb: 6,
            scale: 1.0,
            center_freq_hz: 2.6e9,
            window_offset: 0.5,
        }
    }

    fn processor(rx: Arc<RecordingRx>, errors: Arc<CountingErrors>) -> PuxchProcessor {
        let dft = DftFactory::generic().create(256, DftDirection::Forward).unwrap();
        let demodulator = OfdmSymbolDemodulator::new(ofdm_config(), dft).unwrap();
        PuxchProcessor::new(0, 14, 1, demodulator, rx, errors)
    }

    #[test]
    fn test_fills_requested_grid() {
        let rx = Arc::new(RecordingRx::default());
        let errors = Arc::new(CountingErrors::default());
        let mut puxch = processor(rx.clone(), errors.clone());
        let pool = ResourceGridPool::new(1, 1, 14, 72);
        let slot = SlotPoint::new(SCS, 0, 3);
        puxch
            .request_handler()
            .handle_request(&ResourceGridContext { slot, sector: 0 }, pool.get().unwrap());

        let dft = DftFactory::generic().create(256, DftDirection::Inverse).unwrap();
        let mut modulator = OfdmSymbolModulator::new(ofdm_config(), dft).unwrap();
        let mut sent = ResourceGrid::new(1, 14, 72);
        for l in 0..14 {
            sent.put(0, l, l, Complex32::new(1.0, -1.0));
        }

        for l in 0..14 {
            let mut input = BasebandBuffer::new(1, modulator.symbol_size(l));
            modulator.modulate(input.channel_mut(0), &sent, 0, l).unwrap();
            puxch.process_symbol(&input, slot, l).unwrap();
        }

        let symbols = rx.symbols.lock().unwrap();
        assert_eq!(symbols.len(), 14);
        assert_eq!(symbols[6].0.nof_symbols, 7);
        let (last_context, received) = &symbols[13];
        assert_eq!(last_context.slot, slot);
        for l in 0..14 {
            assert!((received.get(0, l, l) - Complex32::new(1.0, -1.0)).norm() < 1e-3);
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(CountingErrors::get(&errors.puxch_late), 0);
    }

    #[test]
    fn test_no_request_no_notification() {
        let rx = Arc::new(RecordingRx::default());
        let mut puxch = processor(rx.clone(), Arc::new(CountingErrors::default()));
        let input = BasebandBuffer::new(1, 256 + 20);
        puxch.process_symbol(&input, SlotPoint::new(SCS, 0, 0), 0).unwrap();
        assert!(rx.symbols.lock().unwrap().is_empty());
    }

    #[test]
    fn test_late_and_overflow_requests() {
        let errors = Arc::new(CountingErrors::default());
        let mut puxch = processor(Arc::new(RecordingRx::default()), errors.clone());
        let handler = puxch.request_handler();
        let pool = ResourceGridPool::new(4, 1, 14, 72);
        let context = |slot| ResourceGridContext {
            slot: SlotPoint::new(SCS, 0, slot),
            sector: 0,
        };

        let input = BasebandBuffer::new(1, 256 + 20);
        puxch.process_symbol(&input, SlotPoint::new(SCS, 0, 2), 0).unwrap();
        handler.handle_request(&context(2), pool.get().unwrap());
        assert_eq!(CountingErrors::get(&errors.puxch_late), 1);

        handler.handle_request(&context(3), pool.get().unwrap());
        handler.handle_request(&context(4), pool.get().unwrap());
        handler.handle_request(&context(5), pool.get().unwrap());
        assert_eq!(CountingErrors::get(&errors.puxch_overflow), 1);
    }
}
