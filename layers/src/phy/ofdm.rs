//! OFDM Modulation and Demodulation for 5G NR
//!
//! Implements OFDM processing according to 3GPP TS 38.211 section 5.3.1,
//! including the up-conversion phase compensation of section 5.4.
//!
//! The `bw_rb * 12` subcarriers of a grid are centred on DC: subcarrier `k`
//! maps to DFT bin `(k + N - nof_subc / 2) mod N`. Both directions scale by
//! `1 / sqrt(N)` so that a modulated then demodulated grid is unchanged.

use super::dft::{DftDirection, DftProcessor};
use super::resource_grid::ResourceGrid;
use crate::LayerError;
use common::types::{CyclicPrefix, SubcarrierSpacing, NRE};
use num_complex::Complex32;
use std::f64::consts::PI;
use tracing::debug;

/// OFDM modulator/demodulator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OfdmConfig {
    /// Subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// DFT size
    pub dft_size: usize,
    /// Cyclic prefix type
    pub cp: CyclicPrefix,
    /// Bandwidth in resource blocks
    pub bw_rb: usize,
    /// Extra amplitude scaling on top of the DFT normalization
    pub scale: f32,
    /// Carrier center frequency used for the phase compensation
    pub center_freq_hz: f64,
    /// Demodulation DFT window position as a fraction of the cyclic prefix
    /// (0 starts at the end of the prefix, 1 at its beginning)
    pub window_offset: f32,
}

impl OfdmConfig {
    pub fn nof_subc(&self) -> usize {
        self.bw_rb * NRE
    }

    fn validate(&self) -> Result<(), LayerError> {
        if self.nof_subc() > self.dft_size {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} RB do not fit in a DFT of size {}",
                self.bw_rb, self.dft_size
            )));
        }
        if !(0.0..=1.0).contains(&self.window_offset) {
            return Err(LayerError::InvalidConfiguration(format!(
                "DFT window offset {} outside [0, 1]",
                self.window_offset
            )));
        }
        if !self.cp.is_valid(self.scs, self.dft_size) {
            return Err(LayerError::InvalidConfiguration(format!(
                "{:?} cyclic prefix invalid for {} with DFT size {}",
                self.cp, self.scs, self.dft_size
            )));
        }
        Ok(())
    }

    fn symbols_per_subframe(&self) -> usize {
        self.cp.symbols_per_slot() * self.scs.slots_per_subframe() as usize
    }

    fn cp_length(&self, symbol_in_subframe: usize) -> usize {
        self.cp.length(symbol_in_subframe, self.scs, self.dft_size)
    }

    /// DFT bin of grid subcarrier `k`
    fn bin(&self, k: usize) -> usize {
        (k + self.dft_size - self.nof_subc() / 2) % self.dft_size
    }

    /// Phase compensation of every symbol in a subframe (TS 38.211 5.4).
    ///
    /// The up-converted symbol `l` starts its useful part at
    /// `t = t_start(l) + N_cp(l) * Tc`; the modulator removes the carrier
    /// phase `2*pi*f0*t` accumulated at that instant.
    fn phase_compensation(&self) -> Vec<Complex32> {
        let srate = (self.dft_size * self.scs.to_hz() as usize) as f64;
        let mut start = 0usize;
        (0..self.symbols_per_subframe())
            .map(|l| {
                let cp_len = self.cp_length(l);
                let t = (start + cp_len) as f64 / srate;
                start += cp_len + self.dft_size;
                let phase = (2.0 * PI * self.center_freq_hz * t).rem_euclid(2.0 * PI);
                Complex32::new(phase.cos() as f32, -(phase.sin() as f32))
            })
            .collect()
    }
}

/// OFDM modulator for downlink
pub struct OfdmSymbolModulator {
    config: OfdmConfig,
    dft: Box<dyn DftProcessor>,
    phase: Vec<Complex32>,
}

impl OfdmSymbolModulator {
    pub fn new(config: OfdmConfig, dft: Box<dyn DftProcessor>) -> Result<Self, LayerError> {
        config.validate()?;
        if dft.size() != config.dft_size || dft.direction() != DftDirection::Inverse {
            return Err(LayerError::InvalidConfiguration(format!(
                "Modulator needs an inverse DFT of size {}, got {:?} of size {}",
                config.dft_size,
                dft.direction(),
                dft.size()
            )));
        }
        let phase = config.phase_compensation();
        debug!(
            "Created OFDM modulator: N={}, {} RB, {:?} CP, f0={} Hz",
            config.dft_size, config.bw_rb, config.cp, config.center_freq_hz
        );
        Ok(Self { config, dft, phase })
    }

    /// Samples of symbol `symbol_in_subframe`, cyclic prefix included
    pub fn symbol_size(&self, symbol_in_subframe: usize) -> usize {
        self.config.dft_size + self.config.cp_length(symbol_in_subframe)
    }

    /// Modulate one symbol of one port into `output`.
    ///
    /// The grid holds one slot; its row is `symbol_in_subframe` modulo the
    /// symbols per slot.
    pub fn modulate(
        &mut self,
        output: &mut [Complex32],
        grid: &ResourceGrid,
        port: usize,
        symbol_in_subframe: usize,
    ) -> Result<(), LayerError> {
        let n = self.config.dft_size;
        let cp_len = self.config.cp_length(symbol_in_subframe);
        if output.len() != n + cp_len {
            return Err(LayerError::ProcessingError(format!(
                "Modulator output has {} samples, symbol needs {}",
                output.len(),
                n + cp_len
            )));
        }
        let nof_subc = self.config.nof_subc();
        if grid.nof_subc() != nof_subc || port >= grid.nof_ports() {
            return Err(LayerError::ProcessingError(format!(
                "Grid of {} subcarriers and {} ports does not fit {} subcarriers, port {}",
                grid.nof_subc(),
                grid.nof_ports(),
                nof_subc,
                port
            )));
        }

        let row = symbol_in_subframe % grid.nof_symbols();
        let symbol = grid.symbol(port, row);
        let input = self.dft.input();
        input.fill(Complex32::new(0.0, 0.0));
        for (k, re) in symbol.iter().enumerate() {
            input[self.config.bin(k)] = *re;
        }

        let scale = self.phase[symbol_in_subframe % self.phase.len()]
            * (self.config.scale / (n as f32).sqrt());
        let time = self.dft.run()?;
        for (out, sample) in output[cp_len..].iter_mut().zip(time.iter()) {
            *out = sample * scale;
        }
        output.copy_within(n..n + cp_len, 0);
        Ok(())
    }
}

/// OFDM demodulator for uplink
pub struct OfdmSymbolDemodulator {
    config: OfdmConfig,
    dft: Box<dyn DftProcessor>,
    phase: Vec<Complex32>,
    /// Samples between the DFT window start and the end of the prefix
    window_advance: usize,
    /// Per-subcarrier correction of the advanced DFT window
    window_phase: Vec<Complex32>,
}

impl OfdmSymbolDemodulator {
    pub fn new(config: OfdmConfig, dft: Box<dyn DftProcessor>) -> Result<Self, LayerError> {
        config.validate()?;
        if dft.size() != config.dft_size || dft.direction() != DftDirection::Forward {
            return Err(LayerError::InvalidConfiguration(format!(
                "Demodulator needs a forward DFT of size {}, got {:?} of size {}",
                config.dft_size,
                dft.direction(),
                dft.size()
            )));
        }

        // The shortest prefix bounds the advance so every symbol shares it
        let min_cp = (0..config.symbols_per_subframe())
            .map(|l| config.cp_length(l))
            .min()
            .unwrap_or(0);
        let window_advance = (config.window_offset * min_cp as f32).floor() as usize;

        // Starting `d` samples early delays the symbol by `d`: bin `b` picks up
        // exp(-j*2*pi*b*d/N), undone here.
        let n = config.dft_size;
        let window_phase = (0..config.nof_subc())
            .map(|k| {
                let bin = config.bin(k);
                let phase = 2.0 * PI * (bin * window_advance % n) as f64 / n as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();

        // Undo the modulator compensation
        let phase = config.phase_compensation().iter().map(|p| p.conj()).collect();

        debug!(
            "Created OFDM demodulator: N={}, {} RB, window advance {} samples",
            config.dft_size, config.bw_rb, window_advance
        );
        Ok(Self {
            config,
            dft,
            phase,
            window_advance,
            window_phase,
        })
    }

    pub fn symbol_size(&self, symbol_in_subframe: usize) -> usize {
        self.config.dft_size + self.config.cp_length(symbol_in_subframe)
    }

    pub fn window_advance(&self) -> usize {
        self.window_advance
    }

    /// Demodulate one symbol of one port from `input` into the grid
    pub fn demodulate(
        &mut self,
        grid: &mut ResourceGrid,
        input: &[Complex32],
        port: usize,
        symbol_in_subframe: usize,
    ) -> Result<(), LayerError> {
        let n = self.config.dft_size;
        let cp_len = self.config.cp_length(symbol_in_subframe);
        if input.len() != n + cp_len {
            return Err(LayerError::ProcessingError(format!(
                "Demodulator input has {} samples, symbol needs {}",
                input.len(),
                n + cp_len
            )));
        }
        if grid.nof_subc() != self.config.nof_subc() || port >= grid.nof_ports() {
            return Err(LayerError::ProcessingError(format!(
                "Grid of {} subcarriers and {} ports cannot take port {}",
                grid.nof_subc(),
                grid.nof_ports(),
                port
            )));
        }

        let start = cp_len - self.window_advance;
        self.dft.input().copy_from_slice(&input[start..start + n]);

        let scale = self.phase[symbol_in_subframe % self.phase.len()]
            * (self.config.scale.recip() / (n as f32).sqrt());
        let freq = self.dft.run()?;

        let row = symbol_in_subframe % grid.nof_symbols();
        let mut symbol = grid.symbol_mut(port, row);
        for (k, re) in symbol.iter_mut().enumerate() {
            let bin = (k + n - self.config.nof_subc() / 2) % n;
            *re = freq[bin] * self.window_phase[k] * scale;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::dft::DftFactory;
    use rand::Rng;

    fn config(dft_size: usize, scs: SubcarrierSpacing, bw_rb: usize) -> OfdmConfig {
        OfdmConfig {
            scs,
            dft_size,
            cp: CyclicPrefix::Normal,
            bw_rb,
            scale: 1.0,
            center_freq_hz: 3.5e9,
            window_offset: 0.5,
        }
    }

    fn random_grid(nof_subc: usize) -> ResourceGrid {
        let mut rng = rand::thread_rng();
        let mut grid = ResourceGrid::new(1, 14, nof_subc);
        for l in 0..14 {
            for k in 0..nof_subc {
                grid.put(0, l, k, Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)));
            }
        }
        grid
    }

    fn pair(cfg: &OfdmConfig) -> (OfdmSymbolModulator, OfdmSymbolDemodulator) {
        let factory = DftFactory::best_available();
        let modulator = OfdmSymbolModulator::new(
            cfg.clone(),
            factory.create(cfg.dft_size, DftDirection::Inverse).unwrap(),
        )
        .unwrap();
        let demodulator = OfdmSymbolDemodulator::new(
            cfg.clone(),
            factory.create(cfg.dft_size, DftDirection::Forward).unwrap(),
        )
        .unwrap();
        (modulator, demodulator)
    }

    /// Largest error relative to the RMS amplitude of the reference grid
    fn max_relative_error(a: &ResourceGrid, b: &ResourceGrid) -> f32 {
        let mut max = 0.0f32;
        let mut power = 0.0f32;
        for l in 0..a.nof_symbols() {
            for k in 0..a.nof_subc() {
                let expected = a.get(0, l, k);
                power += expected.norm_sqr();
                max = max.max((b.get(0, l, k) - expected).norm());
            }
        }
        let rms = (power / (a.nof_symbols() * a.nof_subc()) as f32).sqrt();
        max / rms
    }

    #[test]
    fn test_modulate_demodulate_slot() {
        for (dft_size, scs, bw_rb) in [
            (2048, SubcarrierSpacing::Scs30, 52),
            (1536, SubcarrierSpacing::Scs15, 106),
        ] {
            let cfg = config(dft_size, scs, bw_rb);
            let (mut modulator, mut demodulator) = pair(&cfg);
            let grid = random_grid(cfg.nof_subc());
            let mut received = ResourceGrid::new(1, 14, cfg.nof_subc());

            // Second slot of the subframe so the long prefix lands on symbol 0 at 30 kHz
            let first = if scs == SubcarrierSpacing::Scs30 { 14 } else { 0 };
            for l in first..first + 14 {
                let mut samples = vec![Complex32::new(0.0, 0.0); modulator.symbol_size(l)];
                modulator.modulate(&mut samples, &grid, 0, l).unwrap();
                demodulator.demodulate(&mut received, &samples, 0, l).unwrap();
            }
            assert!(max_relative_error(&grid, &received) < 1e-3);
        }
    }

    #[test]
    fn test_cyclic_prefix_copies_symbol_tail() {
        let cfg = config(2048, SubcarrierSpacing::Scs30, 52);
        let (mut modulator, _) = pair(&cfg);
        let grid = random_grid(cfg.nof_subc());
        let mut samples = vec![Complex32::new(0.0, 0.0); modulator.symbol_size(1)];
        modulator.modulate(&mut samples, &grid, 0, 1).unwrap();
        assert_eq!(samples.len(), 2048 + 144);
        assert_eq!(&samples[..144], &samples[2048..]);
    }

    #[test]
    fn test_demodulation_tolerates_timing_jitter() {
        let cfg = config(2048, SubcarrierSpacing::Scs30, 52);
        let (mut modulator, mut demodulator) = pair(&cfg);
        let grid = random_grid(cfg.nof_subc());
        let l = 3;
        let size = modulator.symbol_size(l);
        let mut samples = vec![Complex32::new(0.0, 0.0); size];
        modulator.modulate(&mut samples, &grid, 0, l).unwrap();

        // Received a few samples late: the window still sits inside the prefix
        let delay = 10;
        let mut delayed = vec![Complex32::new(0.0, 0.0); size];
        delayed[delay..].copy_from_slice(&samples[..size - delay]);

        let mut received = ResourceGrid::new(1, 14, cfg.nof_subc());
        demodulator.demodulate(&mut received, &delayed, 0, l).unwrap();

        // A pure delay becomes a linear phase; magnitudes are preserved
        for k in 0..cfg.nof_subc() {
            let expected = grid.get(0, l, k).norm();
            assert!((received.get(0, l, k).norm() - expected).abs() < 1e-3 * expected.max(1.0));
        }
    }

    #[test]
    fn test_rejects_oversized_bandwidth() {
        let cfg = config(512, SubcarrierSpacing::Scs15, 52);
        let factory = DftFactory::generic();
        let result = OfdmSymbolModulator::new(cfg, factory.create(512, DftDirection::Inverse).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_wrong_dft_direction() {
        let cfg = config(2048, SubcarrierSpacing::Scs30, 52);
        let factory = DftFactory::generic();
        let result = OfdmSymbolDemodulator::new(cfg, factory.create(2048, DftDirection::Inverse).unwrap());
        assert!(result.is_err());
    }
}
