//! PDxCH Processor
//!
//! Holds the downlink grids handed over by the upper layers and modulates
//! them symbol by symbol when their slot comes up. Slots without a grid are
//! transmitted as zeros.

use super::notifiers::{LowerPhyErrorNotifier, LowerPhyRgHandler, ResourceGridContext};
use super::ofdm::OfdmSymbolModulator;
use super::request_queue::{RequestRejection, SlotRequestQueue};
use super::resource_grid::PooledGrid;
use crate::LayerError;
use common::types::SlotPoint;
use interfaces::BasebandBuffer;
use std::sync::Arc;
use tracing::trace;

/// Accepts downlink grids for one sector
pub struct PdxchRequestHandler {
    queue: Arc<SlotRequestQueue>,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
}

impl LowerPhyRgHandler for PdxchRequestHandler {
    fn handle_resource_grid(&self, context: &ResourceGridContext, grid: PooledGrid) {
        match self.queue.push(*context, grid) {
            Ok(()) => trace!("Queued DL grid for slot {}", context.slot),
            Err(RequestRejection::Late) => self.error_notifier.on_late_resource_grid(context),
            Err(RequestRejection::Overflow) => self.error_notifier.on_pdxch_request_overflow(context),
        }
    }
}

/// Modulates the downlink grids of one sector
pub struct PdxchProcessor {
    sector: usize,
    symbols_per_slot: usize,
    queue: Arc<SlotRequestQueue>,
    modulator: OfdmSymbolModulator,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    current_slot: Option<SlotPoint>,
    current_grid: Option<PooledGrid>,
}

impl PdxchProcessor {
    pub fn new(
        sector: usize,
        symbols_per_slot: usize,
        max_processing_delay_slots: usize,
        modulator: OfdmSymbolModulator,
        error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    ) -> Self {
        Self {
            sector,
            symbols_per_slot,
            queue: Arc::new(SlotRequestQueue::new(max_processing_delay_slots)),
            modulator,
            error_notifier,
            current_slot: None,
            current_grid: None,
        }
    }

    /// Handler feeding this processor
    pub fn request_handler(&self) -> Arc<PdxchRequestHandler> {
        Arc::new(PdxchRequestHandler {
            queue: self.queue.clone(),
            error_notifier: self.error_notifier.clone(),
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    fn begin_slot(&mut self, slot: SlotPoint) {
        let start = self.queue.start_slot(slot);
        self.current_slot = Some(slot);
        self.current_grid = start.grid;
        if self.current_grid.is_some() {
            trace!("Sector {}: transmitting DL grid of slot {}", self.sector, slot);
        }
        for context in &start.late {
            self.error_notifier.on_late_resource_grid(context);
        }
    }

    /// Modulate symbol `symbol_in_subframe` of `slot` into `output`.
    ///
    /// `output` holds one channel per transmit port and exactly one symbol,
    /// cyclic prefix included.
    pub fn process_symbol(
        &mut self,
        output: &mut BasebandBuffer,
        slot: SlotPoint,
        symbol_in_subframe: usize,
    ) -> Result<(), LayerError> {
        let symbol = symbol_in_subframe % self.symbols_per_slot;
        if symbol == 0 || self.current_slot != Some(slot) {
            self.begin_slot(slot);
        }

        match &self.current_grid {
            Some(grid) => {
                for port in 0..output.nof_channels() {
                    if port < grid.nof_ports() {
                        self.modulator
                            .modulate(output.channel_mut(port), grid, port, symbol_in_subframe)?;
                    } else {
                        output.channel_mut(port).fill(Default::default());
                    }
                }
            }
            None => output.fill_zero(),
        }

        if symbol + 1 == self.symbols_per_slot {
            // Back to the pool
            self.current_grid = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::dft::{DftDirection, DftFactory};
    use crate::phy::ofdm::OfdmConfig;
    use crate::phy::resource_grid::ResourceGridPool;
    use crate::phy::test_doubles::CountingErrors;
    use common::types::{CyclicPrefix, SubcarrierSpacing};
    use num_complex::Complex32;

    const SCS: SubcarrierSpacing = SubcarrierSpacing::Scs30;

    fn processor(errors: Arc<CountingErrors>) -> PdxchProcessor {
        let config = OfdmConfig {
            scs: SCS,
            dft_size: 256,
            cp: CyclicPrefix::Normal,
            bw_rb: 11,
            scale: 1.0,
            center_freq_hz: 3.5e9,
            window_offset: 0.5,
        };
        let dft = DftFactory::generic().create(256, DftDirection::Inverse).unwrap();
        let modulator = OfdmSymbolModulator::new(config, dft).unwrap();
        PdxchProcessor::new(0, 14, 2, modulator, errors)
    }

    fn context(slot: u32) -> ResourceGridContext {
        ResourceGridContext {
            slot: SlotPoint::new(SCS, 0, slot),
            sector: 0,
        }
    }

    #[test]
    fn test_modulates_queued_grid_and_releases_it() {
        let errors = Arc::new(CountingErrors::default());
        let mut pdxch = processor(errors.clone());
        let handler = pdxch.request_handler();
        let pool = ResourceGridPool::new(2, 1, 14, 132);

        let mut grid = pool.get().unwrap();
        grid.put(0, 0, 10, Complex32::new(1.0, 0.0));
        handler.handle_resource_grid(&context(1), grid);

        // Symbol 0 of slot 1 sits at index 14 of the subframe
        let mut output = BasebandBuffer::new(1, 256 + 22);
        pdxch.process_symbol(&mut output, SlotPoint::new(SCS, 0, 1), 14).unwrap();
        assert!(output.channel(0).iter().any(|s| s.norm() > 0.0));
        assert_eq!(pool.available(), 1);

        output.resize(256 + 18);
        for l in 15..28 {
            pdxch.process_symbol(&mut output, SlotPoint::new(SCS, 0, 1), l).unwrap();
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(CountingErrors::get(&errors.late_grid), 0);
    }

    #[test]
    fn test_empty_slot_is_zero() {
        let errors = Arc::new(CountingErrors::default());
        let mut pdxch = processor(errors);
        let mut output = BasebandBuffer::new(1, 256 + 22);
        output.channel_mut(0).fill(Complex32::new(1.0, 1.0));
        pdxch.process_symbol(&mut output, SlotPoint::new(SCS, 0, 0), 0).unwrap();
        assert!(output.channel(0).iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn test_late_and_overflow_requests() {
        let errors = Arc::new(CountingErrors::default());
        let mut pdxch = processor(errors.clone());
        let handler = pdxch.request_handler();
        let pool = ResourceGridPool::new(8, 1, 14, 132);
        assert_eq!(pdxch.queue_capacity(), 4);

        let mut output = BasebandBuffer::new(1, 256 + 22);
        pdxch.process_symbol(&mut output, SlotPoint::new(SCS, 0, 4), 0).unwrap();

        // Slot 4 is on air already
        handler.handle_resource_grid(&context(4), pool.get().unwrap());
        assert_eq!(CountingErrors::get(&errors.late_grid), 1);

        for slot in 5..9 {
            handler.handle_resource_grid(&context(slot), pool.get().unwrap());
        }
        handler.handle_resource_grid(&context(9), pool.get().unwrap());
        assert_eq!(CountingErrors::get(&errors.pdxch_overflow), 1);

        // Jumping to slot 7 makes the grids of 5 and 6 late
        pdxch.process_symbol(&mut output, SlotPoint::new(SCS, 0, 7), 14).unwrap();
        assert_eq!(CountingErrors::get(&errors.late_grid), 3);
        assert_eq!(pool.available(), 8 - 2);
    }
}
