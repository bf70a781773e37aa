//! PRACH Processor
//!
//! Captures the PRACH window requested by the upper layers out of the
//! received baseband stream and demodulates it on the PRACH executor.
//!
//! One window per sector may be in progress at any time:
//!
//! ```text
//! Idle -> WaitingWindow -> Capturing -> Detecting -> Idle
//! ```

use super::frame_structure::SymbolTiming;
use super::notifiers::{LowerPhyErrorNotifier, LowerPhyRxSymbolNotifier};
use super::prach::{validate_context, PrachBuffer, PrachBufferContext, PrachDemodulator};
use common::executor::TaskExecutor;
use common::types::SamplingRate;
use interfaces::BasebandBuffer;
use num_complex::Complex32;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

enum PrachState {
    Idle,
    /// Requested; the window position is resolved on the next received block
    WaitingWindow {
        context: PrachBufferContext,
        window: Option<(u64, usize)>,
    },
    Capturing {
        context: PrachBufferContext,
        start: u64,
        samples: Vec<Vec<Complex32>>,
    },
    Detecting,
}

impl PrachState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingWindow { .. } => "waiting",
            Self::Capturing { .. } => "capturing",
            Self::Detecting => "detecting",
        }
    }
}

struct PrachShared {
    state: Mutex<PrachState>,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl PrachShared {
    fn state(&self) -> MutexGuard<'_, PrachState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, usize> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn finish_job(&self) {
        *self.state() = PrachState::Idle;
        let mut in_flight = self.in_flight();
        *in_flight = in_flight.saturating_sub(1);
        self.drained.notify_all();
    }
}

/// Accepts PRACH window requests for one sector
pub struct PrachRequestHandler {
    srate: SamplingRate,
    nof_rx_ports: usize,
    shared: Arc<PrachShared>,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
}

impl PrachRequestHandler {
    pub fn handle_request(&self, context: &PrachBufferContext) {
        if let Err(e) = validate_context(self.srate, context) {
            warn!("Ignoring PRACH request for slot {}: {}", context.slot, e);
            return;
        }
        if context.ports.is_empty() || context.ports.iter().any(|&port| port >= self.nof_rx_ports) {
            warn!(
                "Ignoring PRACH request for slot {}: ports {:?} not in 0..{}",
                context.slot, context.ports, self.nof_rx_ports
            );
            return;
        }

        let accepted = {
            let mut state = self.shared.state();
            if matches!(*state, PrachState::Idle) {
                *state = PrachState::WaitingWindow {
                    context: context.clone(),
                    window: None,
                };
                true
            } else {
                debug!("PRACH request for slot {} while {}", context.slot, state.name());
                false
            }
        };
        if !accepted {
            self.error_notifier.on_prach_request_overflow(context);
        }
    }
}

/// PRACH capture and demodulation for one sector
pub struct PrachProcessor {
    sector: usize,
    srate: SamplingRate,
    timing: SymbolTiming,
    nof_rx_ports: usize,
    shared: Arc<PrachShared>,
    demodulator: Arc<Mutex<PrachDemodulator>>,
    executor: Arc<dyn TaskExecutor>,
    rx_notifier: Arc<dyn LowerPhyRxSymbolNotifier>,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
}

impl PrachProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sector: usize,
        srate: SamplingRate,
        timing: SymbolTiming,
        nof_rx_ports: usize,
        demodulator: PrachDemodulator,
        executor: Arc<dyn TaskExecutor>,
        rx_notifier: Arc<dyn LowerPhyRxSymbolNotifier>,
        error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    ) -> Self {
        Self {
            sector,
            srate,
            timing,
            nof_rx_ports,
            shared: Arc::new(PrachShared {
                state: Mutex::new(PrachState::Idle),
                in_flight: Mutex::new(0),
                drained: Condvar::new(),
            }),
            demodulator: Arc::new(Mutex::new(demodulator)),
            executor,
            rx_notifier,
            error_notifier,
        }
    }

    pub fn request_handler(&self) -> Arc<PrachRequestHandler> {
        Arc::new(PrachRequestHandler {
            srate: self.srate,
            nof_rx_ports: self.nof_rx_ports,
            shared: self.shared.clone(),
            error_notifier: self.error_notifier.clone(),
        })
    }

    /// Checks whether no window is requested or in progress
    pub fn is_idle(&self) -> bool {
        matches!(*self.shared.state(), PrachState::Idle)
    }

    /// Feed a received block starting `sample` samples after the pipeline
    /// start time
    pub fn process(&self, buffer: &BasebandBuffer, sample: u64) {
        let mut late = None;
        let mut complete = None;
        {
            let mut state = self.shared.state();

            if let PrachState::WaitingWindow { context, window } = &mut *state {
                if window.is_none() {
                    match self.resolve_window(context, sample) {
                        Some(resolved) => *window = Some(resolved),
                        None => late = Some(context.clone()),
                    }
                }
            }
            if late.is_some() {
                *state = PrachState::Idle;
            }

            // The window begins within or before this block
            let end = sample + buffer.nof_samples() as u64;
            let begins = match &*state {
                PrachState::WaitingWindow {
                    context,
                    window: Some((start, len)),
                } if *start < end => Some((context.clone(), *start, *len)),
                _ => None,
            };
            if let Some((context, start, len)) = begins {
                trace!("Sector {}: capturing PRACH window of slot {}", self.sector, context.slot);
                let samples = vec![vec![Complex32::new(0.0, 0.0); len]; context.ports.len()];
                *state = PrachState::Capturing {
                    context,
                    start,
                    samples,
                };
            }

            let mut captured = false;
            if let PrachState::Capturing { context, start, samples } = &mut *state {
                let len = samples.first().map_or(0, |s| s.len()) as u64;
                let from = sample.max(*start);
                let to = end.min(*start + len);
                if from < to {
                    let src = (from - sample) as usize..(to - sample) as usize;
                    let dst = (from - *start) as usize..(to - *start) as usize;
                    for (capture, &port) in samples.iter_mut().zip(&context.ports) {
                        capture[dst.clone()].copy_from_slice(&buffer.channel(port)[src.clone()]);
                    }
                }
                captured = end >= *start + len;
            }
            if captured {
                if let PrachState::Capturing { context, samples, .. } =
                    std::mem::replace(&mut *state, PrachState::Detecting)
                {
                    complete = Some((context, samples));
                }
            }
        }

        if let Some(context) = late {
            self.error_notifier.on_prach_request_late(&context);
        }
        if let Some((context, samples)) = complete {
            self.detect(context, samples);
        }
    }

    /// Window start and length, or `None` when the window already began
    fn resolve_window(&self, context: &PrachBufferContext, sample: u64) -> Option<(u64, usize)> {
        let position = self.timing.locate(sample);
        let current = self.timing.slot_point(position.slot_count);
        let slot_count = position.slot_count as i64 + context.slot.diff(&current);
        if slot_count < 0 {
            return None;
        }
        let start = self.timing.symbol_start(slot_count as u64, context.start_symbol);
        if start < sample {
            return None;
        }
        let len = context.format.window_length(self.srate, context.pusch_scs);
        debug!(
            "Sector {}: PRACH window of slot {} at sample {} ({} samples)",
            self.sector, context.slot, start, len
        );
        Some((start, len))
    }

    fn detect(&self, context: PrachBufferContext, samples: Vec<Vec<Complex32>>) {
        *self.shared.in_flight() += 1;

        let shared = self.shared.clone();
        let demodulator = self.demodulator.clone();
        let notifier = self.rx_notifier.clone();
        let sector = self.sector;
        let task = Box::new(move || {
            let mut buffer = PrachBuffer::new(samples.len(), context.format);
            // The demodulator keeps no state between windows
            let mut demodulator = match demodulator.lock() {
                Ok(demodulator) => demodulator,
                Err(poisoned) => poisoned.into_inner(),
            };
            let result = samples
                .iter()
                .enumerate()
                .try_for_each(|(port, window)| demodulator.demodulate(&mut buffer, window, &context, port));
            drop(demodulator);
            match result {
                Ok(()) => notifier.on_rx_prach_window(&context, &buffer),
                Err(e) => error!("Sector {}: PRACH demodulation failed: {}", sector, e),
            }
            shared.finish_job();
        });

        if let Err(e) = self.executor.execute(task) {
            warn!("Sector {}: dropping PRACH window: {}", self.sector, e);
            self.shared.finish_job();
        }
    }

    /// Cancel pending requests and wait for detections in flight.
    ///
    /// Returns `false` when jobs were still running after `timeout`.
    pub fn stop(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.state();
            if !matches!(*state, PrachState::Detecting) {
                *state = PrachState::Idle;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight();
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!("Sector {}: {} PRACH jobs still running", self.sector, *in_flight);
                return false;
            }
            in_flight = match self.shared.drained.wait_timeout(in_flight, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
