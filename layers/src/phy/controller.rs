//! Lower PHY Controller
//!
//! Starts and stops the radio stream and the baseband loops of every sector.
//! The controller moves from `Constructed` to `Running` once and ends in
//! `Stopped`; it cannot be restarted.

use super::baseband_processor::BasebandProcessor;
use super::prach_processor::PrachProcessor;
use crate::LayerError;
use interfaces::{BasebandTimestamp, RadioSession};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time each sector gets to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Constructed,
    Running,
    Stopped,
}

pub struct LowerPhyController {
    radio: Arc<dyn RadioSession>,
    basebands: Vec<BasebandProcessor>,
    prach: Vec<Arc<PrachProcessor>>,
    start_delay_samples: u64,
    /// Held for the whole of `start` and `stop`
    state: Mutex<ControllerState>,
}

impl LowerPhyController {
    pub fn new(
        radio: Arc<dyn RadioSession>,
        basebands: Vec<BasebandProcessor>,
        prach: Vec<Arc<PrachProcessor>>,
        start_delay_samples: u64,
    ) -> Self {
        Self {
            radio,
            basebands,
            prach,
            start_delay_samples,
            state: Mutex::new(ControllerState::Constructed),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.lock_state()
    }

    /// Start the radio at `timestamp`; slot 0 begins after the start delay
    pub fn start(&self, timestamp: BasebandTimestamp) -> Result<(), LayerError> {
        let mut state = self.lock_state();
        if *state != ControllerState::Constructed {
            return Err(LayerError::InvalidState(format!(
                "Lower PHY cannot start while {:?}",
                *state
            )));
        }

        self.radio.start(timestamp)?;
        let init_time = timestamp + self.start_delay_samples;
        for baseband in &self.basebands {
            if let Err(e) = baseband.start(init_time) {
                warn!("Lower PHY start failed: {}", e);
                self.shutdown();
                *state = ControllerState::Stopped;
                return Err(e);
            }
        }

        *state = ControllerState::Running;
        info!(
            "Lower PHY started: radio at {}, slot 0 at {} ({} sectors)",
            timestamp,
            init_time,
            self.basebands.len()
        );
        Ok(())
    }

    /// Stop everything. Safe to call any number of times from any thread.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        match *state {
            ControllerState::Stopped => return,
            ControllerState::Constructed => self.radio.stop(),
            ControllerState::Running => {
                info!("Stopping lower PHY");
                self.shutdown();
            }
        }
        *state = ControllerState::Stopped;
        info!("Lower PHY stopped");
    }

    fn shutdown(&self) {
        for baseband in &self.basebands {
            baseband.request_stop();
        }
        // Unblocks receivers waiting for samples
        self.radio.stop();
        for (sector, baseband) in self.basebands.iter().enumerate() {
            baseband.wait_stop(STOP_TIMEOUT);
            match baseband.last_rx_end() {
                Some(end) => debug!("Sector {} stopped, last block received up to {}", sector, end),
                None => debug!("Sector {} stopped before receiving", sector),
            }
        }
        for prach in &self.prach {
            prach.stop(STOP_TIMEOUT);
        }
    }
}
