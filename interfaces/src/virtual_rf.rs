//! Virtual RF Driver
//!
//! In-memory radio used to run the lower PHY without hardware. Received
//! samples are zeros, or with `loopback=1` the samples transmitted on the
//! same channel at the same timestamps. With `realtime=1` reception is paced
//! to wall-clock time at the configured sampling rate.
//!
//! Device arguments: `loopback=0|1`, `realtime=0|1`, `timeout_ms=<n>`,
//! `buffer_size=<n>`.

use crate::baseband::{
    BasebandBuffer, BasebandGateway, BasebandGatewayReceiver, BasebandGatewayTransmitter, BasebandTimestamp,
    RxMetadata, TxMetadata,
};
use crate::radio::{
    parse_device_args, RadioConfig, RadioEvent, RadioEventDispatcher, RadioEventKind, RadioEventSource,
    RadioFactory, RadioNotifier, RadioSession,
};
use crate::sample_fifo::TimedFifo;
use crate::stream::StreamState;
use crate::InterfaceError;
use common::{SamplingRate, TaskExecutor};
use num_complex::Complex32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Subframes of samples a loopback FIFO may hold
const FIFO_SUBFRAMES: usize = 100;

/// Virtual radio configuration
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualRfConfig {
    /// Feed transmitted samples back to the receiver
    pub loopback: bool,
    /// Pace reception to wall-clock time
    pub realtime: bool,
    /// Longest wait for loopback samples before zeros are returned
    pub timeout: Duration,
    /// Preferred block size reported to the lower PHY
    pub buffer_size: Option<usize>,
}

impl Default for VirtualRfConfig {
    fn default() -> Self {
        Self {
            loopback: false,
            realtime: true,
            timeout: Duration::from_millis(100),
            buffer_size: None,
        }
    }
}

impl VirtualRfConfig {
    pub fn from_device_args(args: &str) -> Result<Self, InterfaceError> {
        let args = parse_device_args(args)?;
        let mut config = Self::default();
        for (key, value) in &args {
            let invalid = || InterfaceError::InvalidConfig(format!("Invalid {}={}", key, value));
            match key.as_str() {
                "loopback" => config.loopback = parse_flag(value).ok_or_else(invalid)?,
                "realtime" => config.realtime = parse_flag(value).ok_or_else(invalid)?,
                "timeout_ms" => {
                    config.timeout = Duration::from_millis(value.parse().map_err(|_| invalid())?)
                }
                "buffer_size" => config.buffer_size = Some(value.parse().map_err(|_| invalid())?),
                _ => debug!("Ignoring virtual radio argument '{}'", key),
            }
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

struct SectorState {
    fifos: Vec<TimedFifo>,
    /// Highest timestamp covered by any transmission
    tx_end: Option<BasebandTimestamp>,
}

/// State shared by the transmitter and receiver of a sector
struct VirtualSector {
    index: usize,
    nof_rx_channels: usize,
    state: Mutex<SectorState>,
    transmitted: Condvar,
    rx_time: AtomicU64,
}

struct VirtualShared {
    config: VirtualRfConfig,
    srate: SamplingRate,
    stream: StreamState,
    start: Mutex<Option<(Instant, BasebandTimestamp)>>,
    dispatcher: RadioEventDispatcher,
}

struct VirtualTransmitter {
    sector: Arc<VirtualSector>,
    shared: Arc<VirtualShared>,
}

impl BasebandGatewayTransmitter for VirtualTransmitter {
    fn transmit(&self, buffer: &BasebandBuffer, metadata: TxMetadata) -> Result<(), InterfaceError> {
        let mut reports = Vec::with_capacity(buffer.nof_channels());
        {
            let mut state = self.sector.state.lock().map_err(|_| InterfaceError::Stopped)?;
            if buffer.nof_channels() != state.fifos.len() {
                return Err(InterfaceError::BufferSizeMismatch {
                    expected: state.fifos.len(),
                    actual: buffer.nof_channels(),
                });
            }
            let first = state.tx_end.is_none();
            for (channel, fifo) in state.fifos.iter_mut().enumerate() {
                let mut report = fifo.write(metadata.ts, buffer.channel(channel));
                if first {
                    report.padded = 0;
                }
                reports.push(report);
            }
            let end = metadata.ts + buffer.nof_samples() as u64;
            state.tx_end = Some(state.tx_end.map_or(end, |e| e.max(end)));
        }
        self.sector.transmitted.notify_all();

        for (channel, report) in reports.into_iter().enumerate() {
            let event = |kind| RadioEvent {
                sector: self.sector.index,
                channel,
                source: RadioEventSource::Transmit,
                kind,
                timestamp: Some(metadata.ts),
            };
            if report.late > 0 {
                self.shared.dispatcher.notify(event(RadioEventKind::Late));
            }
            if report.padded > 0 {
                self.shared.dispatcher.notify(event(RadioEventKind::Underflow));
            }
            if report.overflow > 0 {
                self.shared.dispatcher.notify(event(RadioEventKind::Overflow));
            }
        }
        Ok(())
    }
}

struct VirtualReceiver {
    sector: Arc<VirtualSector>,
    shared: Arc<VirtualShared>,
}

impl VirtualReceiver {
    /// Sleep until `end` is in the past on the wall clock
    fn pace(&self, end: BasebandTimestamp) -> Result<(), InterfaceError> {
        let Some((instant, init_time)) = self.shared.start.lock().ok().and_then(|s| *s) else {
            return Ok(());
        };
        let elapsed_samples = end.saturating_sub(init_time);
        let due = instant + Duration::from_secs_f64(elapsed_samples as f64 / self.shared.srate.to_hz() as f64);
        loop {
            self.shared.stream.check()?;
            let now = Instant::now();
            if now >= due {
                return Ok(());
            }
            thread::sleep((due - now).min(Duration::from_millis(10)));
        }
    }
}

impl BasebandGatewayReceiver for VirtualReceiver {
    fn receive(&self, buffer: &mut BasebandBuffer) -> Result<RxMetadata, InterfaceError> {
        self.shared.stream.check()?;
        if buffer.nof_channels() != self.sector.nof_rx_channels {
            return Err(InterfaceError::BufferSizeMismatch {
                expected: self.sector.nof_rx_channels,
                actual: buffer.nof_channels(),
            });
        }

        let ts = self.sector.rx_time.load(Ordering::Acquire);
        let end = ts + buffer.nof_samples() as u64;

        if self.shared.config.realtime {
            self.pace(end)?;
        }

        let mut state = self.sector.state.lock().map_err(|_| InterfaceError::Stopped)?;
        if self.shared.config.loopback {
            // Once transmission has begun it leads reception; wait for it to cover this block
            let deadline = Instant::now() + self.shared.config.timeout;
            while state.tx_end.is_some_and(|tx_end| tx_end < end) {
                self.shared.stream.check()?;
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let timeout = (deadline - now).min(Duration::from_millis(10));
                state = self
                    .sector
                    .transmitted
                    .wait_timeout(state, timeout)
                    .map_err(|_| InterfaceError::Stopped)?
                    .0;
            }
        }

        for channel in 0..buffer.nof_channels() {
            let out = buffer.channel_mut(channel);
            match state.fifos.get_mut(channel) {
                Some(fifo) => {
                    fifo.read_at(ts, out);
                    if !self.shared.config.loopback {
                        out.fill(Complex32::new(0.0, 0.0));
                    }
                }
                None => out.fill(Complex32::new(0.0, 0.0)),
            }
        }
        drop(state);

        self.sector.rx_time.store(end, Ordering::Release);
        Ok(RxMetadata { ts })
    }
}

struct VirtualGateway {
    transmitter: Arc<VirtualTransmitter>,
    receiver: Arc<VirtualReceiver>,
}

impl BasebandGateway for VirtualGateway {
    fn transmitter(&self) -> Arc<dyn BasebandGatewayTransmitter> {
        self.transmitter.clone()
    }

    fn receiver(&self) -> Arc<dyn BasebandGatewayReceiver> {
        self.receiver.clone()
    }

    fn optimal_buffer_size(&self) -> Option<usize> {
        self.transmitter.shared.config.buffer_size
    }
}

/// Virtual radio session
pub struct VirtualRadioSession {
    shared: Arc<VirtualShared>,
    sectors: Vec<Arc<VirtualSector>>,
    gateways: Vec<Arc<VirtualGateway>>,
}

impl RadioSession for VirtualRadioSession {
    fn baseband_gateway(&self, sector: usize) -> Option<Arc<dyn BasebandGateway>> {
        self.gateways
            .get(sector)
            .map(|g| g.clone() as Arc<dyn BasebandGateway>)
    }

    fn read_current_time(&self) -> BasebandTimestamp {
        self.sectors
            .first()
            .map_or(0, |s| s.rx_time.load(Ordering::Acquire))
    }

    fn start(&self, init_time: BasebandTimestamp) -> Result<(), InterfaceError> {
        self.shared.stream.start()?;
        for sector in &self.sectors {
            sector.rx_time.store(init_time, Ordering::Release);
            if let Ok(mut state) = sector.state.lock() {
                for fifo in &mut state.fifos {
                    fifo.reset(init_time);
                }
            }
        }
        if let Ok(mut start) = self.shared.start.lock() {
            *start = Some((Instant::now(), init_time));
        }
        info!(
            "Virtual radio started at timestamp {} (loopback={}, realtime={})",
            init_time, self.shared.config.loopback, self.shared.config.realtime
        );
        Ok(())
    }

    fn stop(&self) {
        if self.shared.stream.stop() {
            for sector in &self.sectors {
                sector.transmitted.notify_all();
            }
            info!("Virtual radio stopped");
        }
    }
}

/// Factory for the virtual driver
pub struct VirtualRadioFactory;

impl RadioFactory for VirtualRadioFactory {
    fn create(
        &self,
        config: &RadioConfig,
        async_executor: Arc<dyn TaskExecutor>,
        notifier: Arc<dyn RadioNotifier>,
    ) -> Result<Arc<dyn RadioSession>, InterfaceError> {
        if config.sectors.is_empty() {
            return Err(InterfaceError::InvalidConfig("no sectors configured".into()));
        }
        if config.srate.to_hz() == 0 {
            return Err(InterfaceError::InvalidConfig("sampling rate must be positive".into()));
        }
        let virtual_config = VirtualRfConfig::from_device_args(&config.device_args)?;
        let shared = Arc::new(VirtualShared {
            config: virtual_config,
            srate: config.srate,
            stream: StreamState::default(),
            start: Mutex::new(None),
            dispatcher: RadioEventDispatcher::new(async_executor, notifier),
        });

        let capacity = config.srate.samples_per_subframe() * FIFO_SUBFRAMES;
        let sectors: Vec<_> = config
            .sectors
            .iter()
            .enumerate()
            .map(|(index, sector)| {
                Arc::new(VirtualSector {
                    index,
                    nof_rx_channels: sector.nof_rx_channels,
                    state: Mutex::new(SectorState {
                        fifos: (0..sector.nof_tx_channels).map(|_| TimedFifo::new(capacity)).collect(),
                        tx_end: None,
                    }),
                    transmitted: Condvar::new(),
                    rx_time: AtomicU64::new(0),
                })
            })
            .collect();

        let gateways = sectors
            .iter()
            .map(|sector| {
                Arc::new(VirtualGateway {
                    transmitter: Arc::new(VirtualTransmitter {
                        sector: sector.clone(),
                        shared: shared.clone(),
                    }),
                    receiver: Arc::new(VirtualReceiver {
                        sector: sector.clone(),
                        shared: shared.clone(),
                    }),
                })
            })
            .collect();

        info!("Virtual radio created with {} sectors at {}", sectors.len(), config.srate);
        Ok(Arc::new(VirtualRadioSession {
            shared,
            sectors,
            gateways,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioNotificationCounter, RadioSectorConfig};
    use common::InlineExecutor;

    fn create(args: &str) -> (Arc<dyn RadioSession>, Arc<RadioNotificationCounter>) {
        let config = RadioConfig {
            driver: "virtual".into(),
            device_args: args.into(),
            srate: SamplingRate::from_mhz(1.92),
            sectors: vec![RadioSectorConfig {
                tx_freq_hz: 3.5e9,
                rx_freq_hz: 3.5e9,
                nof_tx_channels: 1,
                nof_rx_channels: 1,
                tx_gain_db: 0.0,
                rx_gain_db: 0.0,
            }],
        };
        let counter = Arc::new(RadioNotificationCounter::new());
        let session = VirtualRadioFactory
            .create(&config, InlineExecutor::new("inline"), counter.clone())
            .unwrap();
        (session, counter)
    }

    fn block(start: usize, n: usize) -> BasebandBuffer {
        let mut buffer = BasebandBuffer::new(1, n);
        for (i, s) in buffer.channel_mut(0).iter_mut().enumerate() {
            *s = Complex32::new((start + i) as f32, 1.0);
        }
        buffer
    }

    #[test]
    fn test_device_args() {
        let config = VirtualRfConfig::from_device_args("loopback=1,realtime=0,timeout_ms=5").unwrap();
        assert!(config.loopback);
        assert!(!config.realtime);
        assert_eq!(config.timeout, Duration::from_millis(5));
        assert!(VirtualRfConfig::from_device_args("loopback=maybe").is_err());
    }

    #[test]
    fn test_receive_before_start_fails() {
        let (session, _) = create("realtime=0");
        let gateway = session.baseband_gateway(0).unwrap();
        let mut buffer = BasebandBuffer::new(1, 16);
        assert!(matches!(
            gateway.receiver().receive(&mut buffer),
            Err(InterfaceError::NotStarted)
        ));
    }

    #[test]
    fn test_loopback_preserves_order_and_timestamps() {
        let (session, counter) = create("loopback=1,realtime=0,timeout_ms=50");
        let gateway = session.baseband_gateway(0).unwrap();
        session.start(100).unwrap();

        for k in 0..4 {
            gateway
                .transmitter()
                .transmit(&block(k * 32, 32), TxMetadata { ts: 100 + (k * 32) as u64 })
                .unwrap();
        }

        let mut rx = BasebandBuffer::new(1, 64);
        let metadata = gateway.receiver().receive(&mut rx).unwrap();
        assert_eq!(metadata.ts, 100);
        assert_eq!(rx, block(0, 64));
        let metadata = gateway.receiver().receive(&mut rx).unwrap();
        assert_eq!(metadata.ts, 164);
        assert_eq!(rx, block(64, 64));
        assert_eq!(session.read_current_time(), 228);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_late_transmission_is_counted() {
        let (session, counter) = create("loopback=1,realtime=0,timeout_ms=1");
        let gateway = session.baseband_gateway(0).unwrap();
        session.start(0).unwrap();

        gateway.transmitter().transmit(&block(0, 32), TxMetadata { ts: 0 }).unwrap();
        let mut rx = BasebandBuffer::new(1, 64);
        gateway.receiver().receive(&mut rx).unwrap();

        // Everything before 64 is already on air
        gateway.transmitter().transmit(&block(0, 32), TxMetadata { ts: 16 }).unwrap();
        assert_eq!(counter.count(RadioEventSource::Transmit, RadioEventKind::Late), 1);

        // A gap after the first transmission is an underflow
        gateway.transmitter().transmit(&block(0, 32), TxMetadata { ts: 200 }).unwrap();
        assert_eq!(counter.count(RadioEventSource::Transmit, RadioEventKind::Underflow), 1);
    }

    #[test]
    fn test_stop_unblocks_receive() {
        let (session, _) = create("loopback=1,realtime=0,timeout_ms=10000");
        let gateway = session.baseband_gateway(0).unwrap();
        session.start(0).unwrap();
        gateway.transmitter().transmit(&block(0, 8), TxMetadata { ts: 0 }).unwrap();

        let receiver = gateway.receiver();
        let handle = thread::spawn(move || {
            let mut rx = BasebandBuffer::new(1, 64);
            receiver.receive(&mut rx)
        });
        thread::sleep(Duration::from_millis(20));
        session.stop();
        session.stop();
        assert!(matches!(handle.join().unwrap(), Err(InterfaceError::Stopped)));
    }

    #[test]
    fn test_realtime_pacing() {
        let (session, _) = create("realtime=1");
        let gateway = session.baseband_gateway(0).unwrap();
        session.start(0).unwrap();
        let started = Instant::now();
        // 1920 samples at 1.92 MHz is one millisecond each
        let mut rx = BasebandBuffer::new(1, 1920);
        for _ in 0..5 {
            gateway.receiver().receive(&mut rx).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(5));
        session.stop();
    }
}
