//! Common Utilities and Types Library
//!
//! This crate provides numerology types, dB helpers and the task executors
//! shared by the radio interfaces, the lower PHY and the example application.

pub mod executor;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use executor::*;
pub use types::*;
pub use utils::*;
