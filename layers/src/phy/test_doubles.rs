//! Recording notifiers shared by the unit tests

use super::notifiers::*;
use super::prach::{PrachBuffer, PrachBufferContext};
use super::resource_grid::ResourceGrid;
use common::types::SlotPoint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct CountingErrors {
    pub late_grid: AtomicUsize,
    pub pdxch_overflow: AtomicUsize,
    pub prach_late: AtomicUsize,
    pub prach_overflow: AtomicUsize,
    pub puxch_late: AtomicUsize,
    pub puxch_overflow: AtomicUsize,
    pub tx_deadline_missed: AtomicUsize,
}

impl CountingErrors {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl LowerPhyErrorNotifier for CountingErrors {
    fn on_late_resource_grid(&self, _context: &ResourceGridContext) {
        self.late_grid.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pdxch_request_overflow(&self, _context: &ResourceGridContext) {
        self.pdxch_overflow.fetch_add(1, Ordering::SeqCst);
    }

    fn on_prach_request_late(&self, _context: &PrachBufferContext) {
        self.prach_late.fetch_add(1, Ordering::SeqCst);
    }

    fn on_prach_request_overflow(&self, _context: &PrachBufferContext) {
        self.prach_overflow.fetch_add(1, Ordering::SeqCst);
    }

    fn on_puxch_request_late(&self, _context: &ResourceGridContext) {
        self.puxch_late.fetch_add(1, Ordering::SeqCst);
    }

    fn on_puxch_request_overflow(&self, _context: &ResourceGridContext) {
        self.puxch_overflow.fetch_add(1, Ordering::SeqCst);
    }

    fn on_tx_deadline_missed(&self, _context: &LowerPhyTimingContext) {
        self.tx_deadline_missed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingTiming {
    pub tti: Mutex<Vec<LowerPhyTimingContext>>,
    pub half_slot: Mutex<Vec<LowerPhyTimingContext>>,
    pub full_slot: Mutex<Vec<LowerPhyTimingContext>>,
}

impl LowerPhyTimingNotifier for RecordingTiming {
    fn on_tti_boundary(&self, context: &LowerPhyTimingContext) {
        self.tti.lock().unwrap().push(*context);
    }

    fn on_ul_half_slot_boundary(&self, context: &LowerPhyTimingContext) {
        self.half_slot.lock().unwrap().push(*context);
    }

    fn on_ul_full_slot_boundary(&self, context: &LowerPhyTimingContext) {
        self.full_slot.lock().unwrap().push(*context);
    }
}

#[derive(Default)]
pub struct RecordingRx {
    /// Context and a copy of the grid of every notification
    pub symbols: Mutex<Vec<(LowerPhyRxSymbolContext, ResourceGrid)>>,
    pub prach: Mutex<Vec<(PrachBufferContext, PrachBuffer)>>,
}

impl RecordingRx {
    pub fn slots(&self) -> Vec<SlotPoint> {
        let symbols = self.symbols.lock().unwrap();
        let mut slots: Vec<SlotPoint> = symbols.iter().map(|(context, _)| context.slot).collect();
        slots.dedup();
        slots
    }
}

impl LowerPhyRxSymbolNotifier for RecordingRx {
    fn on_rx_symbol(&self, context: &LowerPhyRxSymbolContext, grid: &ResourceGrid) {
        self.symbols.lock().unwrap().push((*context, grid.clone()));
    }

    fn on_rx_prach_window(&self, context: &PrachBufferContext, buffer: &PrachBuffer) {
        self.prach.lock().unwrap().push((context.clone(), buffer.clone()));
    }
}
