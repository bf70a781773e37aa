//! Lower Physical Layer
//!
//! Real-time baseband processing of a 5G NR gNB (3GPP TS 38.211):
//!
//! - OFDM modulation and demodulation with per-symbol phase compensation
//! - PRACH window capture and demodulation
//! - per-sector downlink and uplink pipelines fed by slot request queues
//! - the baseband loops exchanging samples with the radio
//! - the controller and factory tying everything together

pub mod amplitude_control;
pub mod baseband_processor;
pub mod config;
pub mod controller;
pub mod dft;
pub mod downlink;
pub mod factory;
pub mod frame_structure;
pub mod notifiers;
pub mod ofdm;
pub mod pdxch;
pub mod prach;
pub mod prach_processor;
pub mod puxch;
mod request_queue;
pub mod resource_grid;
pub mod ssb;
pub mod uplink;

#[cfg(test)]
mod test_doubles;

// Re-export commonly used types
pub use amplitude_control::{AmplitudeControllerConfig, AmplitudeMetricsCollector, AmplitudeMetricsSummary};
pub use baseband_processor::BufferSizePolicy;
pub use config::{LowerPhyConfiguration, LowerPhyDependencies, LowerPhyExecutors, SectorDescription};
pub use controller::{ControllerState, LowerPhyController};
pub use factory::{create_lower_phy, LowerPhy};
pub use frame_structure::SymbolTiming;
pub use notifiers::*;
pub use prach::{PrachBuffer, PrachBufferContext, PrachFormat};
pub use resource_grid::{PooledGrid, ResourceGrid, ResourceGridPool};
pub use ssb::{SsbConfiguration, SsbPatternCase};
