//! Amplitude Controller
//!
//! Scales the transmit baseband so that a fully loaded carrier sits
//! `backoff_db` below full scale, and optionally clips the envelope to a
//! ceiling while keeping the phase of every sample.

use common::utils::{db_to_amplitude, power_to_db};
use num_complex::Complex32;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Amplitude controller configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeControllerConfig {
    /// Clip samples above the ceiling
    pub enable_clipping: bool,
    /// Gain backoff applied on top of the bandwidth normalization
    pub backoff_db: f32,
    /// Clipping ceiling relative to full scale
    pub ceiling_dbfs: f32,
    /// Amplitude of a full scale sample
    pub full_scale: f32,
}

impl Default for AmplitudeControllerConfig {
    fn default() -> Self {
        Self {
            enable_clipping: false,
            backoff_db: 12.0,
            ceiling_dbfs: -0.1,
            full_scale: 1.0,
        }
    }
}

impl AmplitudeControllerConfig {
    /// Input gain for a carrier of `bw_rb` resource blocks
    pub fn input_gain_db(&self, bw_rb: usize) -> f32 {
        -10.0 * ((bw_rb * 12) as f32).log10() - self.backoff_db
    }

    /// Clipping threshold as an amplitude
    pub fn ceiling_amplitude(&self) -> f32 {
        self.full_scale * db_to_amplitude(self.ceiling_dbfs)
    }
}

/// Result of processing one block of samples
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AmplitudeControllerMetrics {
    pub gain_db: f32,
    /// Mean power after scaling, relative to full scale power
    pub avg_power_fs: f32,
    /// Largest sample power after scaling, relative to full scale power
    pub peak_power_fs: f32,
    /// Peak to average power ratio (linear)
    pub papr_lin: f32,
    pub nof_clipped_samples: u64,
    pub nof_processed_samples: u64,
    pub clipping_probability: f64,
}

/// Scales, and possibly clips, a block of baseband samples in place
pub trait AmplitudeController: Send {
    fn process(&mut self, samples: &mut [Complex32]) -> AmplitudeControllerMetrics;
}

/// Build the controller variant selected by `config`
pub fn create_amplitude_controller(config: &AmplitudeControllerConfig, bw_rb: usize) -> Box<dyn AmplitudeController> {
    let gain_db = config.input_gain_db(bw_rb);
    debug!(
        "Amplitude controller: gain {:.2} dB, clipping {}",
        gain_db,
        if config.enable_clipping { "on" } else { "off" }
    );
    if config.enable_clipping {
        Box::new(AmplitudeControllerClipping::new(config, gain_db))
    } else {
        Box::new(AmplitudeControllerScaling::new(config, gain_db))
    }
}

fn block_metrics(gain_db: f32, full_scale: f32, sum_power: f64, peak: f32, clipped: u64, n: usize) -> AmplitudeControllerMetrics {
    if n == 0 {
        return AmplitudeControllerMetrics {
            gain_db,
            ..Default::default()
        };
    }
    let fs_power = full_scale * full_scale;
    let avg = (sum_power / n as f64) as f32;
    AmplitudeControllerMetrics {
        gain_db,
        avg_power_fs: avg / fs_power,
        peak_power_fs: peak / fs_power,
        papr_lin: if avg > 0.0 { peak / avg } else { 0.0 },
        nof_clipped_samples: clipped,
        nof_processed_samples: n as u64,
        clipping_probability: clipped as f64 / n as f64,
    }
}

/// Scaling only
pub struct AmplitudeControllerScaling {
    gain_db: f32,
    gain: f32,
    full_scale: f32,
}

impl AmplitudeControllerScaling {
    pub fn new(config: &AmplitudeControllerConfig, gain_db: f32) -> Self {
        Self {
            gain_db,
            gain: db_to_amplitude(gain_db),
            full_scale: config.full_scale,
        }
    }
}

impl AmplitudeController for AmplitudeControllerScaling {
    fn process(&mut self, samples: &mut [Complex32]) -> AmplitudeControllerMetrics {
        let mut sum = 0.0f64;
        let mut peak = 0.0f32;
        for sample in samples.iter_mut() {
            *sample *= self.gain;
            let power = sample.norm_sqr();
            sum += power as f64;
            peak = peak.max(power);
        }
        block_metrics(self.gain_db, self.full_scale, sum, peak, 0, samples.len())
    }
}

/// Scaling followed by phase-preserving clipping
pub struct AmplitudeControllerClipping {
    gain_db: f32,
    gain: f32,
    full_scale: f32,
    ceiling: f32,
}

impl AmplitudeControllerClipping {
    pub fn new(config: &AmplitudeControllerConfig, gain_db: f32) -> Self {
        Self {
            gain_db,
            gain: db_to_amplitude(gain_db),
            full_scale: config.full_scale,
            ceiling: config.ceiling_amplitude(),
        }
    }
}

impl AmplitudeController for AmplitudeControllerClipping {
    fn process(&mut self, samples: &mut [Complex32]) -> AmplitudeControllerMetrics {
        let ceiling_power = self.ceiling * self.ceiling;
        let mut sum = 0.0f64;
        let mut peak = 0.0f32;
        let mut clipped = 0u64;
        for sample in samples.iter_mut() {
            *sample *= self.gain;
            let mut power = sample.norm_sqr();
            if power > ceiling_power {
                *sample *= self.ceiling / power.sqrt();
                power = ceiling_power;
                clipped += 1;
            }
            sum += power as f64;
            peak = peak.max(power);
        }
        block_metrics(self.gain_db, self.full_scale, sum, peak, clipped, samples.len())
    }
}

/// Lock-free accumulator of amplitude controller metrics.
///
/// Written by the downlink thread, read by whoever prints the summary.
#[derive(Debug, Default)]
pub struct AmplitudeMetricsCollector {
    gain_db: AtomicU32,
    /// Sum of sample powers relative to full scale, as `f64` bits
    power_sum: AtomicU64,
    /// Largest sample power relative to full scale, as `f32` bits
    peak_power: AtomicU32,
    nof_clipped: AtomicU64,
    nof_processed: AtomicU64,
}

impl AmplitudeMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, metrics: &AmplitudeControllerMetrics) {
        self.gain_db.store(metrics.gain_db.to_bits(), Ordering::Relaxed);

        let block_power = metrics.avg_power_fs as f64 * metrics.nof_processed_samples as f64;
        let _ = self
            .power_sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + block_power).to_bits())
            });
        // Non-negative floats order like their bit patterns
        self.peak_power
            .fetch_max(metrics.peak_power_fs.to_bits(), Ordering::Relaxed);

        self.nof_clipped
            .fetch_add(metrics.nof_clipped_samples, Ordering::Relaxed);
        self.nof_processed
            .fetch_add(metrics.nof_processed_samples, Ordering::Relaxed);
    }

    pub fn summary(&self) -> AmplitudeMetricsSummary {
        let processed = self.nof_processed.load(Ordering::Relaxed);
        let clipped = self.nof_clipped.load(Ordering::Relaxed);
        let power_sum = f64::from_bits(self.power_sum.load(Ordering::Relaxed));
        let avg = if processed > 0 {
            (power_sum / processed as f64) as f32
        } else {
            0.0
        };
        let peak = f32::from_bits(self.peak_power.load(Ordering::Relaxed));
        AmplitudeMetricsSummary {
            gain_db: f32::from_bits(self.gain_db.load(Ordering::Relaxed)),
            avg_power_dbfs: power_to_db(avg),
            peak_power_dbfs: power_to_db(peak),
            papr_db: power_to_db(peak) - power_to_db(avg),
            nof_clipped_samples: clipped,
            nof_processed_samples: processed,
            clipping_probability: if processed > 0 {
                clipped as f64 / processed as f64
            } else {
                0.0
            },
        }
    }
}

/// Accumulated amplitude figures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplitudeMetricsSummary {
    pub gain_db: f32,
    pub avg_power_dbfs: f32,
    pub peak_power_dbfs: f32,
    pub papr_db: f32,
    pub nof_clipped_samples: u64,
    pub nof_processed_samples: u64,
    pub clipping_probability: f64,
}

impl fmt::Display for AmplitudeMetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gain={:.2}dB avg={:.2}dBFS peak={:.2}dBFS papr={:.2}dB clipped={} of {} (p={:.2e})",
            self.gain_db,
            self.avg_power_dbfs,
            self.peak_power_dbfs,
            self.papr_db,
            self.nof_clipped_samples,
            self.nof_processed_samples,
            self.clipping_probability
        )
    }
}
