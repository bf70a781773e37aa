//! Lower PHY boundary
//!
//! Notifiers implemented by the upper layers to hear from the lower PHY, and
//! handlers the lower PHY implements to accept work from them. Every
//! notification is delivered from a real-time thread: implementations must
//! return quickly and must not block.

use super::prach::{PrachBuffer, PrachBufferContext};
use super::resource_grid::{PooledGrid, ResourceGrid};
use common::types::SlotPoint;
use interfaces::BasebandTimestamp;

/// Slot and time a timing notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerPhyTimingContext {
    pub slot: SlotPoint,
    /// Baseband time of the event
    pub time: BasebandTimestamp,
}

/// Identifies the grid a request or notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceGridContext {
    pub slot: SlotPoint,
    pub sector: usize,
}

/// Received symbols available in an uplink grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerPhyRxSymbolContext {
    pub sector: usize,
    pub slot: SlotPoint,
    /// Symbols of the slot demodulated so far
    pub nof_symbols: usize,
}

/// Slot timing events
pub trait LowerPhyTimingNotifier: Send + Sync {
    /// A downlink slot may now be prepared; `context.slot` is the slot that
    /// will be transmitted after the processing delay
    fn on_tti_boundary(&self, context: &LowerPhyTimingContext);

    /// The first half of an uplink slot has been received
    fn on_ul_half_slot_boundary(&self, context: &LowerPhyTimingContext);

    /// A whole uplink slot has been received
    fn on_ul_full_slot_boundary(&self, context: &LowerPhyTimingContext);
}

/// Uplink data
pub trait LowerPhyRxSymbolNotifier: Send + Sync {
    fn on_rx_symbol(&self, context: &LowerPhyRxSymbolContext, grid: &ResourceGrid);

    fn on_rx_prach_window(&self, context: &PrachBufferContext, buffer: &PrachBuffer);
}

/// Real-time faults. None of them stops the pipeline.
pub trait LowerPhyErrorNotifier: Send + Sync {
    /// A downlink grid arrived after its slot was transmitted
    fn on_late_resource_grid(&self, context: &ResourceGridContext);

    /// The downlink request queue was full
    fn on_pdxch_request_overflow(&self, context: &ResourceGridContext);

    /// A PRACH window request arrived after the window started
    fn on_prach_request_late(&self, context: &PrachBufferContext);

    /// A PRACH window was requested while another one was in progress
    fn on_prach_request_overflow(&self, context: &PrachBufferContext);

    fn on_puxch_request_late(&self, context: &ResourceGridContext);

    fn on_puxch_request_overflow(&self, context: &ResourceGridContext);

    /// The downlink could not keep up with the receive time
    fn on_tx_deadline_missed(&self, context: &LowerPhyTimingContext);
}

/// Accepts downlink grids
pub trait LowerPhyRgHandler: Send + Sync {
    fn handle_resource_grid(&self, context: &ResourceGridContext, grid: PooledGrid);
}

/// Accepts uplink capture requests
pub trait LowerPhyRequestHandler: Send + Sync {
    fn request_prach_window(&self, context: &PrachBufferContext);

    /// The grid is filled symbol by symbol and reported through
    /// [`LowerPhyRxSymbolNotifier::on_rx_symbol`]
    fn request_uplink_slot(&self, context: &ResourceGridContext, grid: PooledGrid);
}

/// Timing notifier that ignores every event
#[derive(Debug, Default)]
pub struct NullTimingNotifier;

impl LowerPhyTimingNotifier for NullTimingNotifier {
    fn on_tti_boundary(&self, _context: &LowerPhyTimingContext) {}

    fn on_ul_half_slot_boundary(&self, _context: &LowerPhyTimingContext) {}

    fn on_ul_full_slot_boundary(&self, _context: &LowerPhyTimingContext) {}
}
