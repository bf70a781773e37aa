//! 5G NR Frame Structure Implementation
//!
//! Implements the symbol and slot timing of a subframe according to
//! 3GPP TS 38.211 section 5.3.1, expressed in samples at the baseband
//! sampling rate. Sample counts are relative to the pipeline start time,
//! which is the start of slot 0 of SFN 0.

use crate::LayerError;
use common::types::{CyclicPrefix, SamplingRate, SlotPoint, SubcarrierSpacing};

/// Absolute position of a sample on the slot timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPosition {
    /// Slot count since the timeline origin
    pub slot_count: u64,
    /// OFDM symbol index within the slot
    pub symbol: usize,
    /// OFDM symbol index within the subframe
    pub symbol_in_subframe: usize,
    /// Offset of the sample within the symbol (cyclic prefix included)
    pub offset: usize,
    /// Symbol length in samples (cyclic prefix included)
    pub symbol_size: usize,
}

/// Symbol and slot boundaries of one subframe
#[derive(Debug, Clone)]
pub struct SymbolTiming {
    scs: SubcarrierSpacing,
    dft_size: usize,
    symbols_per_slot: usize,
    /// Start of each symbol within the subframe, plus the subframe length
    symbol_starts: Vec<usize>,
    /// Cyclic prefix length of each symbol of the subframe
    cp_lengths: Vec<usize>,
}

impl SymbolTiming {
    pub fn new(srate: SamplingRate, scs: SubcarrierSpacing, cp: CyclicPrefix) -> Result<Self, LayerError> {
        if !srate.is_valid(scs) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Sampling rate {} is not valid for {} subcarrier spacing",
                srate, scs
            )));
        }
        let dft_size = srate.dft_size(scs);
        if !cp.is_valid(scs, dft_size) {
            return Err(LayerError::InvalidConfiguration(format!(
                "{:?} cyclic prefix is not valid for {} and DFT size {}",
                cp, scs, dft_size
            )));
        }

        let symbols_per_slot = cp.symbols_per_slot();
        let nof_symbols = symbols_per_slot * scs.slots_per_subframe() as usize;
        let cp_lengths: Vec<usize> = (0..nof_symbols).map(|l| cp.length(l, scs, dft_size)).collect();

        let mut symbol_starts = Vec::with_capacity(nof_symbols + 1);
        let mut start = 0;
        for cp_len in &cp_lengths {
            symbol_starts.push(start);
            start += cp_len + dft_size;
        }
        symbol_starts.push(start);

        if start != srate.samples_per_subframe() {
            return Err(LayerError::InvalidConfiguration(format!(
                "Symbols span {} samples, subframe has {}",
                start,
                srate.samples_per_subframe()
            )));
        }

        Ok(Self {
            scs,
            dft_size,
            symbols_per_slot,
            symbol_starts,
            cp_lengths,
        })
    }

    pub fn scs(&self) -> SubcarrierSpacing {
        self.scs
    }

    pub fn dft_size(&self) -> usize {
        self.dft_size
    }

    pub fn symbols_per_slot(&self) -> usize {
        self.symbols_per_slot
    }

    pub fn slots_per_subframe(&self) -> usize {
        self.scs.slots_per_subframe() as usize
    }

    pub fn subframe_size(&self) -> usize {
        self.symbol_starts[self.symbol_starts.len() - 1]
    }

    /// Largest symbol length in the subframe
    pub fn max_symbol_size(&self) -> usize {
        self.dft_size + self.cp_lengths.iter().copied().max().unwrap_or(0)
    }

    pub fn cp_length(&self, symbol_in_subframe: usize) -> usize {
        self.cp_lengths[symbol_in_subframe % self.cp_lengths.len()]
    }

    pub fn symbol_size(&self, symbol_in_subframe: usize) -> usize {
        self.dft_size + self.cp_length(symbol_in_subframe)
    }

    /// Nominal slot length: subframe length over slots per subframe
    pub fn nominal_slot_size(&self) -> usize {
        self.subframe_size() / self.slots_per_subframe()
    }

    /// Length of the slot with the given absolute count
    pub fn slot_size(&self, slot_count: u64) -> usize {
        let next = self.slot_start(slot_count + 1);
        (next - self.slot_start(slot_count)) as usize
    }

    /// Sample where the slot with the given count begins
    pub fn slot_start(&self, slot_count: u64) -> u64 {
        self.symbol_start(slot_count, 0)
    }

    /// Sample where a symbol of a slot begins
    pub fn symbol_start(&self, slot_count: u64, symbol: usize) -> u64 {
        let slots_per_subframe = self.slots_per_subframe() as u64;
        let subframe = slot_count / slots_per_subframe;
        let slot_in_subframe = (slot_count % slots_per_subframe) as usize;
        let symbol_in_subframe = slot_in_subframe * self.symbols_per_slot + symbol;
        subframe * self.subframe_size() as u64 + self.symbol_starts[symbol_in_subframe] as u64
    }

    /// Find the symbol containing `sample`
    pub fn locate(&self, sample: u64) -> SymbolPosition {
        let subframe_size = self.subframe_size() as u64;
        let subframe = sample / subframe_size;
        let remainder = (sample % subframe_size) as usize;

        // Index of the last symbol starting at or before `remainder`
        let symbol_in_subframe = match self.symbol_starts.binary_search(&remainder) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        let slot_in_subframe = symbol_in_subframe / self.symbols_per_slot;

        SymbolPosition {
            slot_count: subframe * self.slots_per_subframe() as u64 + slot_in_subframe as u64,
            symbol: symbol_in_subframe % self.symbols_per_slot,
            symbol_in_subframe,
            offset: remainder - self.symbol_starts[symbol_in_subframe],
            symbol_size: self.symbol_size(symbol_in_subframe),
        }
    }

    /// Slot point of an absolute slot count
    pub fn slot_point(&self, slot_count: u64) -> SlotPoint {
        SlotPoint::from_count(self.scs, slot_count)
    }
}
