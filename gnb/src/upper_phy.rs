//! Upper PHY stand-in
//!
//! Drives the lower PHY the way a real upper PHY would: every TTI boundary
//! gets a downlink grid, optionally an uplink slot request and a PRACH
//! window request. Received symbols and errors are counted for the final
//! summary, and slot progress is published on a `watch` channel.

use clap::ValueEnum;
use common::types::{SlotPoint, SubcarrierSpacing, NRE};
use layers::phy::{
    LowerPhyErrorNotifier, LowerPhyRequestHandler, LowerPhyRgHandler, LowerPhyRxSymbolContext,
    LowerPhyRxSymbolNotifier, LowerPhyTimingContext, LowerPhyTimingNotifier, PrachBuffer, PrachBufferContext,
    PrachFormat, ResourceGrid, ResourceGridContext, ResourceGridPool,
};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Modulation of the random downlink data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Modulation {
    Qpsk,
    Qam16,
    #[default]
    Qam64,
    Qam256,
}

impl Modulation {
    pub fn bits_per_symbol(self) -> u32 {
        match self {
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
            Modulation::Qam256 => 8,
        }
    }

    /// Random constellation point with unit average power
    fn random_symbol(self, rng: &mut impl Rng) -> Complex32 {
        let levels = 1i32 << (self.bits_per_symbol() / 2);
        let order = (levels * levels) as f32;
        let norm = (2.0 * (order - 1.0) / 3.0).sqrt();
        let mut axis = || (2 * rng.gen_range(0..levels) - (levels - 1)) as f32 / norm;
        Complex32::new(axis(), axis())
    }
}

#[derive(Debug, Clone)]
pub struct UpperPhyConfig {
    pub sector: usize,
    pub scs: SubcarrierSpacing,
    pub bandwidth_rb: usize,
    pub symbols_per_slot: usize,
    pub nof_ports: usize,
    /// Grids kept in each pool
    pub nof_grids: usize,
    pub random_data: bool,
    pub modulation: Modulation,
    pub enable_ul: bool,
    pub enable_prach: bool,
    pub prach_format: PrachFormat,
}

/// What the stand-in saw during the run
#[derive(Debug, Default)]
pub struct UpperPhyCounters {
    pub tti: AtomicU64,
    pub dl_grids: AtomicU64,
    pub dl_grids_unavailable: AtomicU64,
    pub ul_requests: AtomicU64,
    pub ul_slots: AtomicU64,
    pub rx_symbols: AtomicU64,
    pub prach_requests: AtomicU64,
    pub prach_windows: AtomicU64,
    pub late_grids: AtomicU64,
    pub pdxch_overflows: AtomicU64,
    pub prach_late: AtomicU64,
    pub prach_overflows: AtomicU64,
    pub puxch_late: AtomicU64,
    pub puxch_overflows: AtomicU64,
    pub tx_deadline_misses: AtomicU64,
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl fmt::Display for UpperPhyCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tti={} dl_grids={} (unavailable {}) ul_requests={} ul_slots={} rx_symbols={} prach={}/{} | \
             late_grids={} pdxch_overflows={} prach_late={} prach_overflows={} puxch_late={} \
             puxch_overflows={} tx_deadline_misses={}",
            get(&self.tti),
            get(&self.dl_grids),
            get(&self.dl_grids_unavailable),
            get(&self.ul_requests),
            get(&self.ul_slots),
            get(&self.rx_symbols),
            get(&self.prach_windows),
            get(&self.prach_requests),
            get(&self.late_grids),
            get(&self.pdxch_overflows),
            get(&self.prach_late),
            get(&self.prach_overflows),
            get(&self.puxch_late),
            get(&self.puxch_overflows),
            get(&self.tx_deadline_misses),
        )
    }
}

struct Handlers {
    rg: Arc<dyn LowerPhyRgHandler>,
    request: Arc<dyn LowerPhyRequestHandler>,
}

pub struct UpperPhyStub {
    config: UpperPhyConfig,
    /// Set once the lower PHY exists; TTIs before that are only counted
    handlers: OnceLock<Handlers>,
    dl_pool: Arc<ResourceGridPool>,
    ul_pool: Arc<ResourceGridPool>,
    rng: Mutex<StdRng>,
    slot_tx: watch::Sender<Option<SlotPoint>>,
    counters: UpperPhyCounters,
}

impl UpperPhyStub {
    pub fn new(config: UpperPhyConfig) -> (Arc<Self>, watch::Receiver<Option<SlotPoint>>) {
        let nof_subc = config.bandwidth_rb * NRE;
        let dl_pool = ResourceGridPool::new(config.nof_grids, config.nof_ports, config.symbols_per_slot, nof_subc);
        let ul_pool = ResourceGridPool::new(config.nof_grids, config.nof_ports, config.symbols_per_slot, nof_subc);
        let (slot_tx, slot_rx) = watch::channel(None);
        let stub = Arc::new(Self {
            config,
            handlers: OnceLock::new(),
            dl_pool,
            ul_pool,
            rng: Mutex::new(StdRng::from_entropy()),
            slot_tx,
            counters: UpperPhyCounters::default(),
        });
        (stub, slot_rx)
    }

    /// Connect the lower PHY entry points. Only the first call has an effect.
    pub fn connect(&self, rg: Arc<dyn LowerPhyRgHandler>, request: Arc<dyn LowerPhyRequestHandler>) {
        if self.handlers.set(Handlers { rg, request }).is_err() {
            warn!("Upper PHY already connected");
        }
    }

    pub fn counters(&self) -> &UpperPhyCounters {
        &self.counters
    }

    pub fn nof_slots(&self) -> u64 {
        get(&self.counters.tti)
    }

    fn fill(&self, grid: &mut ResourceGrid) {
        if !self.config.random_data {
            grid.set_all_zero();
            return;
        }
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        for port in 0..grid.nof_ports() {
            for symbol in 0..grid.nof_symbols() {
                for re in grid.symbol_mut(port, symbol).iter_mut() {
                    *re = self.config.modulation.random_symbol(&mut *rng);
                }
            }
        }
    }

    fn send_downlink(&self, handlers: &Handlers, context: &ResourceGridContext) {
        let Some(mut grid) = self.dl_pool.get() else {
            bump(&self.counters.dl_grids_unavailable);
            return;
        };
        self.fill(&mut grid);
        handlers.rg.handle_resource_grid(context, grid);
        bump(&self.counters.dl_grids);
    }

    fn request_uplink(&self, handlers: &Handlers, context: &ResourceGridContext) {
        match self.ul_pool.get() {
            Some(grid) => {
                handlers.request.request_uplink_slot(context, grid);
                bump(&self.counters.ul_requests);
            }
            None => trace!("No uplink grid for slot {}", context.slot),
        }
    }

    fn request_prach(&self, handlers: &Handlers, slot: SlotPoint) {
        let context = PrachBufferContext {
            sector: self.config.sector,
            ports: (0..self.config.nof_ports).collect(),
            slot,
            start_symbol: 0,
            format: self.config.prach_format,
            rb_offset: 0,
            nof_prb_ul: self.config.bandwidth_rb,
            pusch_scs: self.config.scs,
            root_sequence_index: 1,
        };
        handlers.request.request_prach_window(&context);
        bump(&self.counters.prach_requests);
    }
}

impl LowerPhyTimingNotifier for UpperPhyStub {
    fn on_tti_boundary(&self, context: &LowerPhyTimingContext) {
        bump(&self.counters.tti);
        self.slot_tx.send_replace(Some(context.slot));

        let Some(handlers) = self.handlers.get() else {
            return;
        };
        let grid_context = ResourceGridContext {
            slot: context.slot,
            sector: self.config.sector,
        };
        self.send_downlink(handlers, &grid_context);
        if self.config.enable_ul {
            self.request_uplink(handlers, &grid_context);
        }
        if self.config.enable_prach && context.slot.slot_index() == 0 && context.slot.sfn() % 2 == 0 {
            self.request_prach(handlers, context.slot);
        }
    }

    fn on_ul_half_slot_boundary(&self, context: &LowerPhyTimingContext) {
        trace!("UL half slot {} at {}", context.slot, context.time);
    }

    fn on_ul_full_slot_boundary(&self, context: &LowerPhyTimingContext) {
        trace!("UL full slot {} at {}", context.slot, context.time);
    }
}

impl LowerPhyRxSymbolNotifier for UpperPhyStub {
    fn on_rx_symbol(&self, context: &LowerPhyRxSymbolContext, _grid: &ResourceGrid) {
        bump(&self.counters.rx_symbols);
        if context.nof_symbols == self.config.symbols_per_slot {
            bump(&self.counters.ul_slots);
        }
    }

    fn on_rx_prach_window(&self, context: &PrachBufferContext, buffer: &PrachBuffer) {
        bump(&self.counters.prach_windows);
        let port = buffer.symbol(0, 0);
        let power = port.iter().map(|s| s.norm_sqr()).sum::<f32>() / port.len().max(1) as f32;
        debug!("PRACH window {:?} at {}: mean power {:.3e}", context.format, context.slot, power);
    }
}

impl LowerPhyErrorNotifier for UpperPhyStub {
    fn on_late_resource_grid(&self, context: &ResourceGridContext) {
        bump(&self.counters.late_grids);
        warn!("Sector {}: late downlink grid for slot {}", context.sector, context.slot);
    }

    fn on_pdxch_request_overflow(&self, context: &ResourceGridContext) {
        bump(&self.counters.pdxch_overflows);
        warn!("Sector {}: downlink queue overflow at slot {}", context.sector, context.slot);
    }

    fn on_prach_request_late(&self, context: &PrachBufferContext) {
        bump(&self.counters.prach_late);
        warn!("Sector {}: late PRACH request for slot {}", context.sector, context.slot);
    }

    fn on_prach_request_overflow(&self, context: &PrachBufferContext) {
        bump(&self.counters.prach_overflows);
        warn!("Sector {}: PRACH request overflow at slot {}", context.sector, context.slot);
    }

    fn on_puxch_request_late(&self, context: &ResourceGridContext) {
        bump(&self.counters.puxch_late);
        warn!("Sector {}: late uplink request for slot {}", context.sector, context.slot);
    }

    fn on_puxch_request_overflow(&self, context: &ResourceGridContext) {
        bump(&self.counters.puxch_overflows);
        warn!("Sector {}: uplink queue overflow at slot {}", context.sector, context.slot);
    }

    fn on_tx_deadline_missed(&self, context: &LowerPhyTimingContext) {
        bump(&self.counters.tx_deadline_misses);
        warn!("Transmit deadline missed at slot {} ({})", context.slot, context.time);
    }
}
