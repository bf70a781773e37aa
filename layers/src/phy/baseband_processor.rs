//! Baseband Processor
//!
//! Runs the receive and transmit loops of one sector on the lower PHY
//! executors. Each loop iteration is one task that enqueues the next one, so
//! several loops can share a single worker thread.
//!
//! The receive time drives everything: the downlink never produces samples
//! more than one block ahead of `last_rx_end + tx_time_offset`, and a
//! downlink that falls behind that point skips ahead and reports a missed
//! deadline.

use super::downlink::DownlinkProcessor;
use super::frame_structure::SymbolTiming;
use super::notifiers::{LowerPhyErrorNotifier, LowerPhyTimingContext};
use super::uplink::UplinkProcessor;
use crate::LayerError;
use common::executor::TaskExecutor;
use interfaces::{
    BasebandBuffer, BasebandBufferPool, BasebandGatewayReceiver, BasebandGatewayTransmitter, BasebandTimestamp,
    TxMetadata,
};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How the baseband block size is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferSizePolicy {
    /// The radio's preferred packet size
    SinglePacket,
    HalfSlot,
    #[default]
    Slot,
    /// One slot rounded up to a whole number of radio packets
    OptimalSlot,
}

impl BufferSizePolicy {
    /// Block size in samples for a nominal slot of `slot_size` samples
    pub fn buffer_size(&self, slot_size: usize, optimal: Option<usize>) -> usize {
        match (self, optimal) {
            (Self::SinglePacket, Some(optimal)) if optimal > 0 => optimal,
            (Self::SinglePacket, _) => {
                warn!("Radio has no preferred packet size, using one slot per buffer");
                slot_size
            }
            (Self::HalfSlot, _) => slot_size / 2,
            (Self::Slot, _) => slot_size,
            (Self::OptimalSlot, Some(optimal)) if optimal > 0 => slot_size.div_ceil(optimal) * optimal,
            (Self::OptimalSlot, _) => slot_size,
        }
    }
}

/// Executors the loops of one sector run on
#[derive(Clone)]
pub struct BasebandProcessorExecutors {
    pub rx: Arc<dyn TaskExecutor>,
    pub tx: Arc<dyn TaskExecutor>,
    pub ul: Arc<dyn TaskExecutor>,
    pub dl: Arc<dyn TaskExecutor>,
}

#[derive(Debug, Clone)]
pub struct BasebandProcessorConfig {
    pub sector: usize,
    pub nof_tx_ports: usize,
    pub nof_rx_ports: usize,
    /// Samples per baseband block
    pub buffer_size: usize,
    /// Transmit lead over the receive time, in samples
    pub tx_time_offset: u64,
    /// Buffers per direction
    pub nof_buffers: usize,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// Pause of a loop that has nothing to do yet
const RETRY_SLEEP: Duration = Duration::from_micros(50);

#[derive(Default)]
struct Pending {
    ul_tasks: usize,
    tx_tasks: usize,
    rx_loop: bool,
    dl_loop: bool,
}

struct Inner {
    sector: usize,
    buffer_size: usize,
    tx_time_offset: u64,
    timing: SymbolTiming,
    receiver: Arc<dyn BasebandGatewayReceiver>,
    transmitter: Arc<dyn BasebandGatewayTransmitter>,
    executors: BasebandProcessorExecutors,
    uplink: Mutex<UplinkProcessor>,
    downlink: Mutex<DownlinkProcessor>,
    rx_pool: BasebandBufferPool,
    tx_pool: BasebandBufferPool,
    nof_rx_ports: usize,
    nof_tx_ports: usize,
    error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    state: AtomicU8,
    init_time: AtomicU64,
    /// End of the last received block, 0 before the first one
    last_rx_end: AtomicU64,
    tx_next: Mutex<Option<BasebandTimestamp>>,
    pending: Mutex<Pending>,
    pending_changed: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    fn update_pending(&self, update: impl FnOnce(&mut Pending)) {
        let mut pending = lock(&self.pending);
        update(&mut pending);
        self.pending_changed.notify_all();
    }

    fn rx_loop(self: Arc<Self>) {
        if !self.is_running() {
            self.update_pending(|p| p.rx_loop = false);
            return;
        }

        let Some(mut buffer) = self.rx_pool.take() else {
            // Every buffer is still queued for the uplink
            thread::sleep(RETRY_SLEEP);
            self.enqueue_rx();
            return;
        };

        let metadata = match self.receiver.receive(&mut buffer) {
            Ok(metadata) => metadata,
            Err(e) => {
                if self.is_running() {
                    error!("Sector {}: receive failed, stopping rx loop: {}", self.sector, e);
                }
                self.rx_pool.give_back(buffer);
                self.update_pending(|p| p.rx_loop = false);
                return;
            }
        };
        let rx_end = metadata.ts + buffer.nof_samples() as u64;
        self.last_rx_end.store(rx_end, Ordering::Release);

        self.update_pending(|p| p.ul_tasks += 1);
        let inner = self.clone();
        let task = Box::new(move || {
            if let Err(e) = lock(&inner.uplink).process(&buffer, metadata.ts) {
                warn!("Sector {}: uplink processing failed: {}", inner.sector, e);
            }
            inner.rx_pool.give_back(buffer);
            inner.update_pending(|p| p.ul_tasks -= 1);
        });
        if let Err(e) = self.executors.ul.execute(task) {
            warn!("Sector {}: dropping received block at {}: {}", self.sector, metadata.ts, e);
            // The buffer went down with the task
            self.rx_pool
                .give_back(BasebandBuffer::new(self.nof_rx_ports, self.buffer_size));
            self.update_pending(|p| p.ul_tasks -= 1);
        }

        self.enqueue_rx();
    }

    fn enqueue_rx(self: &Arc<Self>) {
        let inner = self.clone();
        if let Err(e) = self.executors.rx.defer(Box::new(move || inner.rx_loop())) {
            error!("Sector {}: cannot continue rx loop: {}", self.sector, e);
            self.update_pending(|p| p.rx_loop = false);
        }
    }

    fn dl_loop(self: Arc<Self>) {
        if !self.is_running() {
            self.update_pending(|p| p.dl_loop = false);
            return;
        }

        let rx_end = self.last_rx_end.load(Ordering::Acquire);
        if rx_end == 0 {
            thread::sleep(RETRY_SLEEP);
            self.enqueue_dl();
            return;
        }

        let earliest = rx_end + self.tx_time_offset;
        let ts = {
            let mut tx_next = lock(&self.tx_next);
            let init_time = self.init_time.load(Ordering::Acquire);
            let ts = *tx_next.get_or_insert(init_time.max(earliest));
            if ts > earliest + self.buffer_size as u64 {
                drop(tx_next);
                thread::sleep(RETRY_SLEEP);
                self.enqueue_dl();
                return;
            }
            if ts < earliest {
                let blocks = (earliest - ts).div_ceil(self.buffer_size as u64);
                let skipped = ts + blocks * self.buffer_size as u64;
                *tx_next = Some(skipped);
                drop(tx_next);
                self.deadline_missed(ts, init_time);
                skipped
            } else {
                ts
            }
        };

        let Some(mut buffer) = self.tx_pool.take() else {
            thread::sleep(RETRY_SLEEP);
            self.enqueue_dl();
            return;
        };
        if let Err(e) = lock(&self.downlink).process(&mut buffer, ts) {
            warn!("Sector {}: downlink processing failed at {}: {}", self.sector, ts, e);
            buffer.fill_zero();
        }
        *lock(&self.tx_next) = Some(ts + self.buffer_size as u64);

        self.update_pending(|p| p.tx_tasks += 1);
        let inner = self.clone();
        let task = Box::new(move || {
            if let Err(e) = inner.transmitter.transmit(&buffer, TxMetadata { ts }) {
                if inner.is_running() {
                    warn!("Sector {}: transmit at {} failed: {}", inner.sector, ts, e);
                }
            }
            inner.tx_pool.give_back(buffer);
            inner.update_pending(|p| p.tx_tasks -= 1);
        });
        if let Err(e) = self.executors.tx.execute(task) {
            warn!("Sector {}: dropping transmit block at {}: {}", self.sector, ts, e);
            self.tx_pool
                .give_back(BasebandBuffer::new(self.nof_tx_ports, self.buffer_size));
            self.update_pending(|p| p.tx_tasks -= 1);
        }

        self.enqueue_dl();
    }

    fn enqueue_dl(self: &Arc<Self>) {
        let inner = self.clone();
        if let Err(e) = self.executors.dl.defer(Box::new(move || inner.dl_loop())) {
            error!("Sector {}: cannot continue dl loop: {}", self.sector, e);
            self.update_pending(|p| p.dl_loop = false);
        }
    }

    fn deadline_missed(&self, ts: BasebandTimestamp, init_time: BasebandTimestamp) {
        let slot_count = self.timing.locate(ts.saturating_sub(init_time)).slot_count;
        let context = LowerPhyTimingContext {
            slot: self.timing.slot_point(slot_count),
            time: ts,
        };
        self.error_notifier.on_tx_deadline_missed(&context);
    }
}

/// Receive and transmit loops of one sector
pub struct BasebandProcessor {
    inner: Arc<Inner>,
}

impl BasebandProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &BasebandProcessorConfig,
        timing: SymbolTiming,
        receiver: Arc<dyn BasebandGatewayReceiver>,
        transmitter: Arc<dyn BasebandGatewayTransmitter>,
        executors: BasebandProcessorExecutors,
        uplink: UplinkProcessor,
        downlink: DownlinkProcessor,
        error_notifier: Arc<dyn LowerPhyErrorNotifier>,
    ) -> Self {
        debug!(
            "Sector {}: baseband blocks of {} samples, tx lead {} samples, {} buffers",
            config.sector, config.buffer_size, config.tx_time_offset, config.nof_buffers
        );
        Self {
            inner: Arc::new(Inner {
                sector: config.sector,
                buffer_size: config.buffer_size,
                tx_time_offset: config.tx_time_offset,
                timing,
                receiver,
                transmitter,
                executors,
                uplink: Mutex::new(uplink),
                downlink: Mutex::new(downlink),
                rx_pool: BasebandBufferPool::new(config.nof_buffers, config.nof_rx_ports, config.buffer_size),
                tx_pool: BasebandBufferPool::new(config.nof_buffers, config.nof_tx_ports, config.buffer_size),
                nof_rx_ports: config.nof_rx_ports,
                nof_tx_ports: config.nof_tx_ports,
                error_notifier,
                state: AtomicU8::new(IDLE),
                init_time: AtomicU64::new(0),
                last_rx_end: AtomicU64::new(0),
                tx_next: Mutex::new(None),
                pending: Mutex::new(Pending::default()),
                pending_changed: Condvar::new(),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn tx_time_offset(&self) -> u64 {
        self.inner.tx_time_offset
    }

    /// End of the most recently received block
    pub fn last_rx_end(&self) -> Option<BasebandTimestamp> {
        match self.inner.last_rx_end.load(Ordering::Acquire) {
            0 => None,
            end => Some(end),
        }
    }

    /// Launch the loops; slot 0 starts at `init_time`
    pub fn start(&self, init_time: BasebandTimestamp) -> Result<(), LayerError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LayerError::InvalidState(format!(
                "Baseband processor of sector {} already started",
                inner.sector
            )));
        }
        inner.init_time.store(init_time, Ordering::Release);
        lock(&inner.uplink).set_init_time(init_time);
        lock(&inner.downlink).set_init_time(init_time);
        inner.update_pending(|p| {
            p.rx_loop = true;
            p.dl_loop = true;
        });

        let rx = inner.clone();
        if let Err(e) = inner.executors.rx.execute(Box::new(move || rx.rx_loop())) {
            inner.update_pending(|p| {
                p.rx_loop = false;
                p.dl_loop = false;
            });
            inner.state.store(STOPPING, Ordering::Release);
            return Err(e.into());
        }
        let dl = inner.clone();
        if let Err(e) = inner.executors.dl.execute(Box::new(move || dl.dl_loop())) {
            inner.update_pending(|p| p.dl_loop = false);
            inner.state.store(STOPPING, Ordering::Release);
            return Err(e.into());
        }
        info!("Sector {}: baseband processing started at {}", inner.sector, init_time);
        Ok(())
    }

    /// Ask the loops to finish after their current iteration
    pub fn request_stop(&self) {
        self.inner.state.store(STOPPING, Ordering::Release);
    }

    /// Wait for both loops to acknowledge the stop and for the uplink and
    /// transmit tasks they queued. Returns `false` on timeout.
    pub fn wait_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.inner.pending);
        while pending.rx_loop || pending.dl_loop || pending.ul_tasks > 0 || pending.tx_tasks > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Sector {}: stop timed out (rx loop {}, dl loop {}, {} ul and {} tx tasks pending)",
                    self.inner.sector, pending.rx_loop, pending.dl_loop, pending.ul_tasks, pending.tx_tasks
                );
                return false;
            }
            pending = match self.inner.pending_changed.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        debug!("Sector {}: baseband processing stopped", self.inner.sector);
        true
    }
}
