//! PRACH (Physical Random Access Channel) Demodulation
//!
//! Turns a captured PRACH window into frequency-domain preamble sequences
//! according to 3GPP TS 38.211 section 6.3.3 and 5.3.2. Detection of the
//! preambles themselves happens in the upper PHY.

use super::dft::{DftDirection, DftFactory, DftProcessor};
use crate::LayerError;
use common::types::{SamplingRate, SlotPoint, SubcarrierSpacing};
use ndarray::{Array3, ArrayView1, ArrayViewMut1};
use num_complex::Complex32;
use std::collections::HashMap;
use tracing::{debug, trace};

/// PRACH constants according to 3GPP
pub mod constants {
    /// Long sequence length (for formats 0-3)
    pub const LONG_SEQUENCE_LENGTH: usize = 839;
    /// Short sequence length (for formats A1-C2)
    pub const SHORT_SEQUENCE_LENGTH: usize = 139;
    /// Sampling rate the format durations of TS 38.211 Table 6.3.3.1 are expressed in
    pub const REFERENCE_SRATE_HZ: u64 = 30_720_000;
    /// Long format subcarrier spacings
    pub const RA_SCS_1_25_KHZ: u32 = 1_250;
    pub const RA_SCS_5_KHZ: u32 = 5_000;
}

/// PRACH format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrachFormat {
    /// Format 0: 839 sequence length, 1ms duration
    Format0,
    /// Format 1: 839 sequence length, 3ms duration
    Format1,
    /// Format 2: 839 sequence length, 3.5ms duration
    Format2,
    /// Format 3: 839 sequence length, 5 kHz spacing
    Format3,
    FormatA1,
    FormatA2,
    FormatA3,
    FormatB1,
    FormatB4,
    FormatC0,
    FormatC2,
}

impl PrachFormat {
    /// Check if this is a long preamble format
    pub fn is_long(&self) -> bool {
        matches!(self, Self::Format0 | Self::Format1 | Self::Format2 | Self::Format3)
    }

    /// Get sequence length for this format
    pub fn sequence_length(&self) -> usize {
        if self.is_long() {
            constants::LONG_SEQUENCE_LENGTH
        } else {
            constants::SHORT_SEQUENCE_LENGTH
        }
    }

    /// Number of times the sequence is repeated in the window
    pub fn nof_repetitions(&self) -> usize {
        match self {
            Self::Format0 => 1,
            Self::Format1 => 2,
            Self::Format2 => 4,
            Self::Format3 => 4,
            Self::FormatA1 => 2,
            Self::FormatA2 => 4,
            Self::FormatA3 => 6,
            Self::FormatB1 => 2,
            Self::FormatB4 => 12,
            Self::FormatC0 => 1,
            Self::FormatC2 => 4,
        }
    }

    /// Preamble subcarrier spacing in Hz
    pub fn ra_scs_hz(&self, pusch_scs: SubcarrierSpacing) -> u32 {
        match self {
            Self::Format0 | Self::Format1 | Self::Format2 => constants::RA_SCS_1_25_KHZ,
            Self::Format3 => constants::RA_SCS_5_KHZ,
            _ => pusch_scs.to_hz(),
        }
    }

    /// Cyclic prefix and total useful part in units of the 30.72 MHz
    /// reference sampling rate, before the short-format `2^-mu` scaling
    fn reference_durations(&self) -> (u64, u64) {
        match self {
            Self::Format0 => (3168, 24576),
            Self::Format1 => (21024, 2 * 24576),
            Self::Format2 => (4688, 4 * 24576),
            Self::Format3 => (3168, 4 * 6144),
            Self::FormatA1 => (288, 2 * 2048),
            Self::FormatA2 => (576, 4 * 2048),
            Self::FormatA3 => (864, 6 * 2048),
            Self::FormatB1 => (216, 2 * 2048),
            Self::FormatB4 => (936, 12 * 2048),
            Self::FormatC0 => (1240, 2048),
            Self::FormatC2 => (2048, 4 * 2048),
        }
    }

    fn to_samples(&self, reference: u64, srate: SamplingRate, pusch_scs: SubcarrierSpacing) -> u64 {
        let shift = if self.is_long() { 0 } else { pusch_scs.numerology() };
        reference * srate.to_hz() / (constants::REFERENCE_SRATE_HZ << shift)
    }

    /// Cyclic prefix length in samples
    pub fn cp_length(&self, srate: SamplingRate, pusch_scs: SubcarrierSpacing) -> usize {
        self.to_samples(self.reference_durations().0, srate, pusch_scs) as usize
    }

    /// Length of all repetitions together, in samples
    pub fn sequence_duration(&self, srate: SamplingRate, pusch_scs: SubcarrierSpacing) -> usize {
        self.to_samples(self.reference_durations().1, srate, pusch_scs) as usize
    }

    /// Samples to capture for one PRACH window
    pub fn window_length(&self, srate: SamplingRate, pusch_scs: SubcarrierSpacing) -> usize {
        self.cp_length(srate, pusch_scs) + self.sequence_duration(srate, pusch_scs)
    }

    /// DFT size demodulating one repetition
    pub fn dft_size(&self, srate: SamplingRate, pusch_scs: SubcarrierSpacing) -> Result<usize, LayerError> {
        let ra_scs = self.ra_scs_hz(pusch_scs) as u64;
        if srate.to_hz() % ra_scs != 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Sampling rate {} is not a multiple of the {:?} spacing of {} Hz",
                srate, self, ra_scs
            )));
        }
        Ok((srate.to_hz() / ra_scs) as usize)
    }

    /// Frequency offset `k_bar` of TS 38.211 Table 6.3.3.2-1
    pub fn kbar(&self, pusch_scs: SubcarrierSpacing) -> Result<usize, LayerError> {
        if !self.is_long() {
            return Ok(2);
        }
        match (self.ra_scs_hz(pusch_scs), pusch_scs) {
            (constants::RA_SCS_1_25_KHZ, SubcarrierSpacing::Scs15) => Ok(7),
            (constants::RA_SCS_1_25_KHZ, SubcarrierSpacing::Scs30) => Ok(1),
            (constants::RA_SCS_5_KHZ, SubcarrierSpacing::Scs15) => Ok(12),
            (constants::RA_SCS_5_KHZ, SubcarrierSpacing::Scs30) => Ok(10),
            (ra_scs, scs) => Err(LayerError::InvalidConfiguration(format!(
                "PRACH spacing of {} Hz cannot be combined with {} PUSCH",
                ra_scs, scs
            ))),
        }
    }
}

/// Describes one PRACH window to capture
#[derive(Debug, Clone, PartialEq)]
pub struct PrachBufferContext {
    pub sector: usize,
    /// Receive ports to capture
    pub ports: Vec<usize>,
    /// Slot the window starts in
    pub slot: SlotPoint,
    /// First OFDM symbol of the window within the slot
    pub start_symbol: usize,
    pub format: PrachFormat,
    /// PRACH frequency start relative to the uplink BWP, in PUSCH RBs
    pub rb_offset: usize,
    /// Uplink bandwidth in PUSCH RBs
    pub nof_prb_ul: usize,
    pub pusch_scs: SubcarrierSpacing,
    pub root_sequence_index: u32,
}

/// Demodulated PRACH sequences, indexed `[port][replica][sequence]`
#[derive(Debug, Clone, PartialEq)]
pub struct PrachBuffer {
    data: Array3<Complex32>,
}

impl PrachBuffer {
    pub fn new(nof_ports: usize, format: PrachFormat) -> Self {
        Self {
            data: Array3::zeros((nof_ports, format.nof_repetitions(), format.sequence_length())),
        }
    }

    pub fn nof_ports(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn nof_replicas(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn sequence_length(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn symbol(&self, port: usize, replica: usize) -> ArrayView1<'_, Complex32> {
        self.data.slice(ndarray::s![port, replica, ..])
    }

    pub fn symbol_mut(&mut self, port: usize, replica: usize) -> ArrayViewMut1<'_, Complex32> {
        self.data.slice_mut(ndarray::s![port, replica, ..])
    }
}

/// Checks that a window described by `context` can be demodulated at `srate`
pub fn validate_context(srate: SamplingRate, context: &PrachBufferContext) -> Result<(), LayerError> {
    first_bin(srate, context).map(|_| ())
}

/// Signed DFT bin of the first sequence element relative to DC
fn first_bin(srate: SamplingRate, context: &PrachBufferContext) -> Result<i64, LayerError> {
    let format = context.format;
    let dft_size = format.dft_size(srate, context.pusch_scs)? as i64;
    let kbar = format.kbar(context.pusch_scs)? as i64;
    let ratio = (context.pusch_scs.to_hz() / format.ra_scs_hz(context.pusch_scs)) as i64;
    let k1 = (context.rb_offset * 12) as i64 - (context.nof_prb_ul * 12 / 2) as i64;
    let first = ratio * k1 + kbar;
    let last = first + format.sequence_length() as i64;
    if first < -dft_size / 2 || last > dft_size / 2 {
        return Err(LayerError::InvalidConfiguration(format!(
            "PRACH occupies bins {}..{} outside a DFT of size {}",
            first, last, dft_size
        )));
    }
    Ok(first)
}

/// Frequency-domain PRACH demodulator
///
/// DFTs are created on first use for each size and kept afterwards.
pub struct PrachDemodulator {
    srate: SamplingRate,
    factory: DftFactory,
    dfts: HashMap<usize, Box<dyn DftProcessor>>,
}

impl PrachDemodulator {
    pub fn new(srate: SamplingRate, factory: DftFactory) -> Self {
        Self {
            srate,
            factory,
            dfts: HashMap::new(),
        }
    }

    /// Demodulate the window captured on `port` into `buffer`.
    ///
    /// `input` starts at the beginning of the cyclic prefix.
    pub fn demodulate(
        &mut self,
        buffer: &mut PrachBuffer,
        input: &[Complex32],
        context: &PrachBufferContext,
        port: usize,
    ) -> Result<(), LayerError> {
        let format = context.format;
        let window = format.window_length(self.srate, context.pusch_scs);
        if input.len() < window {
            return Err(LayerError::ProcessingError(format!(
                "PRACH window has {} samples, {:?} needs {}",
                input.len(),
                format,
                window
            )));
        }
        if port >= buffer.nof_ports()
            || buffer.nof_replicas() != format.nof_repetitions()
            || buffer.sequence_length() != format.sequence_length()
        {
            return Err(LayerError::ProcessingError(format!(
                "PRACH buffer of {} ports, {} replicas cannot hold port {} of {:?}",
                buffer.nof_ports(),
                buffer.nof_replicas(),
                port,
                format
            )));
        }

        let first = first_bin(self.srate, context)?;
        let dft_size = format.dft_size(self.srate, context.pusch_scs)?;
        let cp_len = format.cp_length(self.srate, context.pusch_scs);
        let scale = 1.0 / (dft_size as f32).sqrt();

        let dft = match self.dfts.entry(dft_size) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                debug!("Creating PRACH DFT of size {}", dft_size);
                entry.insert(self.factory.create(dft_size, DftDirection::Forward)?)
            }
        };

        for replica in 0..format.nof_repetitions() {
            let start = cp_len + replica * dft_size;
            dft.input().copy_from_slice(&input[start..start + dft_size]);
            let freq = dft.run()?;
            let mut sequence = buffer.symbol_mut(port, replica);
            for (n, value) in sequence.iter_mut().enumerate() {
                let bin = (first + n as i64).rem_euclid(dft_size as i64) as usize;
                *value = freq[bin] * scale;
            }
        }
        trace!(
            "Demodulated {:?} on port {} for slot {}",
            format,
            port,
            context.slot
        );
        Ok(())
    }
}
