//! Radio Interfaces Library
//!
//! This crate provides the boundary between the lower PHY and the radio:
//! baseband buffers and gateways, the radio session and factory traits,
//! radio event notification, and two drivers (ZMQ for srsUE-compatible IQ
//! exchange and an in-memory virtual radio).

pub mod baseband;
pub mod radio;
mod sample_fifo;
mod stream;
pub mod virtual_rf;
pub mod zmq_rf;

pub use baseband::*;
pub use radio::*;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Unknown radio driver '{0}'")]
    UnknownDriver(String),

    #[error("Radio stream not started")]
    NotStarted,

    #[error("Radio stream stopped")]
    Stopped,

    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },
}
