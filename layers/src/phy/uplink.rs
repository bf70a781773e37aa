//! Uplink Processor
//!
//! Consumes the received baseband of one sector. Every block feeds the
//! PRACH capture, then is cut into OFDM symbols that go to the PUxCH
//! processor. Gaps in the timestamps restart the symbol being assembled.

use super::frame_structure::SymbolTiming;
use super::notifiers::{LowerPhyTimingContext, LowerPhyTimingNotifier};
use super::prach_processor::PrachProcessor;
use super::puxch::PuxchProcessor;
use crate::LayerError;
use interfaces::{BasebandBuffer, BasebandTimestamp};
use std::sync::Arc;
use tracing::trace;

pub struct UplinkProcessor {
    sector: usize,
    timing: SymbolTiming,
    init_time: Option<BasebandTimestamp>,
    puxch: PuxchProcessor,
    prach: Arc<PrachProcessor>,
    timing_notifier: Arc<dyn LowerPhyTimingNotifier>,
    /// Symbol being assembled, one channel per port
    symbol: BasebandBuffer,
    /// Start of the symbol being assembled relative to the init time
    symbol_start: Option<u64>,
    /// Samples of the symbol received so far
    fill: usize,
}

impl UplinkProcessor {
    pub fn new(
        sector: usize,
        timing: SymbolTiming,
        nof_rx_ports: usize,
        puxch: PuxchProcessor,
        prach: Arc<PrachProcessor>,
        timing_notifier: Arc<dyn LowerPhyTimingNotifier>,
    ) -> Self {
        let symbol = BasebandBuffer::new(nof_rx_ports, timing.max_symbol_size());
        Self {
            sector,
            timing,
            init_time: None,
            puxch,
            prach,
            timing_notifier,
            symbol,
            symbol_start: None,
            fill: 0,
        }
    }

    pub fn set_init_time(&mut self, init_time: BasebandTimestamp) {
        self.init_time = Some(init_time);
        self.symbol_start = None;
        self.fill = 0;
    }

    /// Process a received block whose first sample was received at `timestamp`
    pub fn process(&mut self, buffer: &BasebandBuffer, timestamp: BasebandTimestamp) -> Result<(), LayerError> {
        let nof_samples = buffer.nof_samples();
        let init_time = match self.init_time {
            Some(init_time) if init_time < timestamp + nof_samples as u64 => init_time,
            _ => return Ok(()),
        };

        let mut i = 0;
        if timestamp >= init_time {
            self.prach.process(buffer, timestamp - init_time);
        } else {
            i = (init_time - timestamp) as usize;
        }

        while i < nof_samples {
            let sample = timestamp + i as u64 - init_time;
            let position = self.timing.locate(sample);
            let start = sample - position.offset as u64;

            if self.symbol_start != Some(start) || self.fill != position.offset {
                if position.offset > 0 {
                    trace!(
                        "Sector {}: uplink discontinuity, symbol {} joined at offset {}",
                        self.sector,
                        position.symbol_in_subframe,
                        position.offset
                    );
                }
                self.symbol.resize(position.symbol_size);
                for port in 0..self.symbol.nof_channels() {
                    self.symbol.channel_mut(port)[..position.offset].fill(Default::default());
                }
                self.symbol_start = Some(start);
                self.fill = position.offset;
            }

            let count = (position.symbol_size - self.fill).min(nof_samples - i);
            for port in 0..self.symbol.nof_channels() {
                let src = &buffer.channel(port)[i..i + count];
                self.symbol.channel_mut(port)[self.fill..self.fill + count].copy_from_slice(src);
            }
            self.fill += count;
            i += count;

            if self.fill == position.symbol_size {
                self.symbol_start = None;
                self.fill = 0;
                self.symbol_complete(init_time, start + position.symbol_size as u64, position.slot_count, position.symbol_in_subframe)?;
            }
        }
        Ok(())
    }

    fn symbol_complete(
        &mut self,
        init_time: BasebandTimestamp,
        end: u64,
        slot_count: u64,
        symbol_in_subframe: usize,
    ) -> Result<(), LayerError> {
        let slot = self.timing.slot_point(slot_count);
        self.puxch.process_symbol(&self.symbol, slot, symbol_in_subframe)?;

        let symbols_per_slot = self.timing.symbols_per_slot();
        let symbol = symbol_in_subframe % symbols_per_slot;
        let context = LowerPhyTimingContext {
            slot,
            time: init_time + end,
        };
        if symbol + 1 == symbols_per_slot / 2 {
            self.timing_notifier.on_ul_half_slot_boundary(&context);
        } else if symbol + 1 == symbols_per_slot {
            self.timing_notifier.on_ul_full_slot_boundary(&context);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::dft::{DftDirection, DftFactory};
    use crate::phy::notifiers::ResourceGridContext;
    use crate::phy::ofdm::{OfdmConfig, OfdmSymbolDemodulator};
    use crate::phy::prach::PrachDemodulator;
    use crate::phy::resource_grid::ResourceGridPool;
    use crate::phy::test_doubles::{CountingErrors, RecordingRx, RecordingTiming};
    use common::executor::InlineExecutor;
    use common::types::{CyclicPrefix, SamplingRate, SlotPoint, SubcarrierSpacing};

    const SCS: SubcarrierSpacing = SubcarrierSpacing::Scs15;

    struct Fixture {
        uplink: UplinkProcessor,
        timing: Arc<RecordingTiming>,
        rx: Arc<RecordingRx>,
        pool: Arc<ResourceGridPool>,
    }

    fn fixture() -> Fixture {
        let srate = SamplingRate::from_mhz(3.84);
        let symbol_timing = SymbolTiming::new(srate, SCS, CyclicPrefix::Normal).unwrap();
        let rx = Arc::new(RecordingRx::default());
        let errors = Arc::new(CountingErrors::default());
        let timing = Arc::new(RecordingTiming::default());
        let ofdm = OfdmConfig {
            scs: SCS,
            dft_size: 256,
            cp: CyclicPrefix::Normal,
            bw_rb: 6,
            scale: 1.0,
            center_freq_hz: 2.6e9,
            window_offset: 0.5,
        };
        let dft = DftFactory::generic().create(256, DftDirection::Forward).unwrap();
        let demodulator = OfdmSymbolDemodulator::new(ofdm, dft).unwrap();
        let puxch = PuxchProcessor::new(0, 14, 2, demodulator, rx.clone(), errors.clone());
        let pool = ResourceGridPool::new(4, 1, 14, 72);
        for slot in 0..3 {
            puxch.request_handler().handle_request(
                &ResourceGridContext {
                    slot: SlotPoint::new(SCS, 0, slot),
                    sector: 0,
                },
                pool.get().unwrap(),
            );
        }
        let prach = Arc::new(PrachProcessor::new(
            0,
            srate,
            symbol_timing.clone(),
            1,
            PrachDemodulator::new(srate, DftFactory::generic()),
            InlineExecutor::new("test_prach"),
            rx.clone(),
            errors,
        ));
        let uplink = UplinkProcessor::new(0, symbol_timing, 1, puxch, prach, timing.clone());
        Fixture {
            uplink,
            timing,
            rx,
            pool,
        }
    }

    #[test]
    fn test_symbols_and_slot_boundaries() {
        let mut f = fixture();
        f.uplink.set_init_time(768);
        let buffer = BasebandBuffer::new(1, 768);
        let mut ts = 0;
        while ts < 768 + 2 * 3840 {
            f.uplink.process(&buffer, ts).unwrap();
            ts += 768;
        }

        let symbols = f.rx.symbols.lock().unwrap();
        assert_eq!(symbols.len(), 28);
        assert!(symbols[..14].iter().all(|(c, _)| c.slot.slot_index() == 0));
        assert_eq!(symbols[27].0.nof_symbols, 14);
        drop(symbols);

        let half = f.timing.half_slot.lock().unwrap();
        let full = f.timing.full_slot.lock().unwrap();
        assert_eq!(half.len(), 2);
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].time, 768 + 3840);
        assert_eq!(half[1].slot.slot_index(), 1);
        // Grids of slots 0 and 1 went back to the pool
        assert_eq!(f.pool.available(), 3);
    }

    #[test]
    fn test_discontinuity_restarts_symbol() {
        let mut f = fixture();
        f.uplink.set_init_time(0);
        let buffer = BasebandBuffer::new(1, 100);
        f.uplink.process(&buffer, 0).unwrap();
        // Skip ahead into the middle of symbol 3
        let symbol3 = 276 + 2 * 274;
        f.uplink.process(&buffer, symbol3 - 50).unwrap();
        let big = BasebandBuffer::new(1, 274);
        f.uplink.process(&big, symbol3 + 50).unwrap();

        let symbols = f.rx.symbols.lock().unwrap();
        // Symbol 0 never completes; symbol 2 is joined late and zero padded
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].0.nof_symbols, 3);
        assert_eq!(symbols[1].0.nof_symbols, 4);
    }
}
