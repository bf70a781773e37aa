//! Streaming state shared by a radio session and its gateways

use crate::InterfaceError;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Idle -> Running -> Stopped, never backwards
#[derive(Default)]
pub(crate) struct StreamState(AtomicU8);

impl StreamState {
    pub fn start(&self) -> Result<(), InterfaceError> {
        match self
            .0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(STOPPED) => Err(InterfaceError::Stopped),
            Err(_) => Err(InterfaceError::InitializationFailed("stream already started".into())),
        }
    }

    /// Returns true the first time only
    pub fn stop(&self) -> bool {
        self.0.swap(STOPPED, Ordering::AcqRel) != STOPPED
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == STOPPED
    }

    /// Error to return from a blocked operation that can no longer proceed
    pub fn check(&self) -> Result<(), InterfaceError> {
        match self.0.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            STOPPED => Err(InterfaceError::Stopped),
            _ => Err(InterfaceError::NotStarted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let state = StreamState::default();
        assert!(matches!(state.check(), Err(InterfaceError::NotStarted)));
        state.start().unwrap();
        assert!(state.is_running());
        assert!(state.start().is_err());
        assert!(state.stop());
        assert!(!state.stop());
        assert!(state.is_stopped());
        assert!(matches!(state.start(), Err(InterfaceError::Stopped)));
    }
}
