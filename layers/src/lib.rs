//! Lower Physical Layer Library
//!
//! This crate implements the 5G NR lower physical layer: OFDM and PRACH
//! baseband processing, the per-sector downlink and uplink pipelines, and
//! the real-time controller that exchanges samples with the radio.

pub mod phy;

use common::ExecutorError;
use interfaces::InterfaceError;
use thiserror::Error;

/// Lower PHY errors
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Radio interface error: {0}")]
    Interface(#[from] InterfaceError),
}
