//! ZMQ RF Driver for IQ Sample Exchange
//!
//! This module implements the ZMQ-based RF driver for exchanging IQ samples
//! with srsUE and other compatible software radios.
//!
//! Each transmit channel binds a REP socket served by its own thread: every
//! request from the peer is answered with the next queued samples. Each
//! receive channel connects a REQ socket and pulls samples on demand. The
//! payload is raw little-endian `cf32`; timestamps are sample counts.

use crate::baseband::{
    bytes_to_samples, samples_to_bytes, BasebandBuffer, BasebandGateway, BasebandGatewayReceiver,
    BasebandGatewayTransmitter, BasebandTimestamp, RxMetadata, TxMetadata,
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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use zmq::{Context, Socket};

/// Default ZMQ ports of the first channel
pub const DEFAULT_TX_PORT: u16 = 2000;
pub const DEFAULT_RX_PORT: u16 = 2001;

/// Default socket timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: i32 = 100;

/// Subframes of samples a transmit FIFO may hold
const TX_FIFO_SUBFRAMES: usize = 100;

/// ZMQ RF configuration
#[derive(Debug, Clone)]
pub struct ZmqRfConfig {
    /// Sample rate
    pub sample_rate: SamplingRate,
    /// Sample rate the peer expects, if announced
    pub base_srate: Option<f64>,
    /// One bind address per transmit channel
    pub tx_addresses: Vec<String>,
    /// One connect address per receive channel
    pub rx_addresses: Vec<String>,
    /// Socket send/receive timeout
    pub timeout_ms: i32,
    /// Largest number of samples sent in one reply
    pub max_packet_samples: usize,
    /// Preferred block size reported to the lower PHY
    pub buffer_size: Option<usize>,
}

impl ZmqRfConfig {
    /// Parse device arguments in srsRAN format
    /// Format: "key1=value1,key2=value2,..."
    /// Supports indexed port names: tx_port0, rx_port0, tx_port1, rx_port1, etc.
    pub fn from_device_args(
        args: &str,
        sample_rate: SamplingRate,
        nof_tx_channels: usize,
        nof_rx_channels: usize,
    ) -> Result<Self, InterfaceError> {
        let args = parse_device_args(args)?;

        let address = |prefix: &str, index: usize, default: String| {
            args.get(&format!("{}{}", prefix, index))
                .or_else(|| if index == 0 { args.get(prefix) } else { None })
                .cloned()
                .unwrap_or(default)
        };
        let tx_addresses = (0..nof_tx_channels)
            .map(|i| address("tx_port", i, format!("tcp://*:{}", DEFAULT_TX_PORT as usize + 2 * i)))
            .collect();
        let rx_addresses = (0..nof_rx_channels)
            .map(|i| address("rx_port", i, format!("tcp://localhost:{}", DEFAULT_RX_PORT as usize + 2 * i)))
            .collect();

        let parse_usize = |key: &str| -> Result<Option<usize>, InterfaceError> {
            args.get(key)
                .map(|v| {
                    v.parse::<usize>()
                        .map_err(|_| InterfaceError::InvalidConfig(format!("Invalid {}", key)))
                })
                .transpose()
        };

        let base_srate = args
            .get("base_srate")
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| InterfaceError::InvalidConfig("Invalid base_srate".to_string()))
            })
            .transpose()?;
        if let Some(base) = base_srate {
            if (base - sample_rate.to_hz() as f64).abs() > 1.0 {
                warn!(
                    "ZMQ base_srate {} MHz differs from the stream rate {}",
                    base / 1e6,
                    sample_rate
                );
            }
        }

        let timeout_ms = match parse_usize("timeout_ms")? {
            Some(v) => i32::try_from(v).map_err(|_| InterfaceError::InvalidConfig("Invalid timeout_ms".into()))?,
            None => DEFAULT_TIMEOUT_MS,
        };

        Ok(Self {
            sample_rate,
            base_srate,
            tx_addresses,
            rx_addresses,
            timeout_ms,
            max_packet_samples: parse_usize("max_packet")?.unwrap_or(sample_rate.samples_per_subframe()),
            buffer_size: parse_usize("buffer_size")?,
        })
    }

    /// Longest time a transmit channel holds a request without queued samples
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }
}

struct TxQueue {
    fifo: TimedFifo,
    written: bool,
}

/// State shared between a transmit channel and its serving thread
struct TxShared {
    queue: Mutex<TxQueue>,
    available: Condvar,
}

/// One transmit channel: REP socket plus the thread answering requests
struct ZmqTxChannel {
    address: String,
    shared: Arc<TxShared>,
    socket: Mutex<Option<Socket>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ZmqTxChannel {
    fn new(context: &Context, address: &str, config: &ZmqRfConfig) -> Result<Self, InterfaceError> {
        info!("Creating TX socket (REP) to bind to {}", address);
        let socket = context.socket(zmq::REP)?;
        socket.set_linger(0)?;
        socket.set_rcvtimeo(config.timeout_ms)?;
        socket.set_sndtimeo(config.timeout_ms)?;
        socket.bind(address)?;

        let capacity = config.sample_rate.samples_per_subframe() * TX_FIFO_SUBFRAMES;
        Ok(Self {
            address: address.to_string(),
            shared: Arc::new(TxShared {
                queue: Mutex::new(TxQueue {
                    fifo: TimedFifo::new(capacity),
                    written: false,
                }),
                available: Condvar::new(),
            }),
            socket: Mutex::new(Some(socket)),
            thread: Mutex::new(None),
        })
    }

    fn start(
        &self,
        init_time: BasebandTimestamp,
        stream: Arc<StreamState>,
        max_packet: usize,
        idle_timeout: Duration,
    ) -> Result<(), InterfaceError> {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.fifo.reset(init_time);
        }
        let socket = self
            .socket
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .ok_or_else(|| InterfaceError::InitializationFailed(format!("TX socket {} unavailable", self.address)))?;
        let shared = self.shared.clone();
        let name = format!("zmq_tx:{}", self.address);
        let handle = thread::Builder::new()
            .name("zmq_tx".into())
            .spawn(move || serve_tx_requests(socket, shared, stream, max_packet, idle_timeout, name))
            .map_err(|e| InterfaceError::InitializationFailed(e.to_string()))?;
        if let Ok(mut thread) = self.thread.lock() {
            *thread = Some(handle);
        }
        Ok(())
    }

    fn join(&self) {
        self.shared.available.notify_all();
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("TX serving thread for {} panicked", self.address);
            }
        }
    }
}

/// Answers each request of the peer with the next queued samples.
///
/// A REP socket must reply before it can receive again. When nothing is
/// queued within `idle_timeout` the reply is a packet of zeros, so a peer
/// whose own transmission depends on our receive path keeps running.
fn serve_tx_requests(
    socket: Socket,
    shared: Arc<TxShared>,
    stream: Arc<StreamState>,
    max_packet: usize,
    idle_timeout: Duration,
    name: String,
) {
    debug!("{}: serving thread started", name);
    let mut packet = vec![Complex32::new(0.0, 0.0); max_packet];

    while stream.is_running() {
        match socket.recv_bytes(0) {
            Ok(_) => {}
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                error!("{}: error receiving request: {}", name, e);
                break;
            }
        }

        let nof_samples = {
            let Ok(mut queue) = shared.queue.lock() else {
                break;
            };
            let deadline = Instant::now() + idle_timeout;
            while queue.fifo.len() == 0 && stream.is_running() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                queue = match shared.available.wait_timeout(queue, deadline - now) {
                    Ok((queue, _)) => queue,
                    Err(_) => return,
                };
            }
            if !stream.is_running() {
                break;
            }
            if queue.fifo.len() == 0 {
                // Zeros take the place of the samples in the FIFO timeline
                let start = queue.fifo.start_ts();
                queue.fifo.read_at(start, &mut packet);
                trace!("{}: nothing queued, sending {} zeros", name, packet.len());
                packet.len()
            } else {
                queue.fifo.read(&mut packet)
            }
        };

        trace!("{}: sending {} samples", name, nof_samples);
        if let Err(e) = socket.send(samples_to_bytes(&packet[..nof_samples]), 0) {
            warn!("{}: failed to send samples: {}", name, e);
        }
    }
    debug!("{}: serving thread finished", name);
}

/// Transmitter of one sector
struct ZmqTransmitter {
    sector: usize,
    channels: Vec<Arc<TxShared>>,
    dispatcher: RadioEventDispatcher,
}

impl BasebandGatewayTransmitter for ZmqTransmitter {
    fn transmit(&self, buffer: &BasebandBuffer, metadata: TxMetadata) -> Result<(), InterfaceError> {
        if buffer.nof_channels() != self.channels.len() {
            return Err(InterfaceError::BufferSizeMismatch {
                expected: self.channels.len(),
                actual: buffer.nof_channels(),
            });
        }

        for (channel, shared) in self.channels.iter().enumerate() {
            let report = {
                let mut queue = shared.queue.lock().map_err(|_| InterfaceError::Stopped)?;
                let first = !queue.written;
                queue.written = true;
                let mut report = queue.fifo.write(metadata.ts, buffer.channel(channel));
                if first {
                    report.padded = 0;
                }
                report
            };
            shared.available.notify_all();

            let event = |kind| RadioEvent {
                sector: self.sector,
                channel,
                source: RadioEventSource::Transmit,
                kind,
                timestamp: Some(metadata.ts),
            };
            if report.late > 0 {
                self.dispatcher.notify(event(RadioEventKind::Late));
            }
            if report.padded > 0 {
                self.dispatcher.notify(event(RadioEventKind::Underflow));
            }
            if report.overflow > 0 {
                self.dispatcher.notify(event(RadioEventKind::Overflow));
            }
        }
        Ok(())
    }
}

struct RxSocket {
    socket: Socket,
    leftover: VecDeque<Complex32>,
    awaiting_reply: bool,
}

/// Receiver of one sector
struct ZmqReceiver {
    channels: Vec<Mutex<RxSocket>>,
    rx_time: Arc<AtomicU64>,
    stream: Arc<StreamState>,
}

impl ZmqReceiver {
    fn receive_channel(&self, channel: &Mutex<RxSocket>, out: &mut [Complex32]) -> Result<(), InterfaceError> {
        let mut guard = channel.lock().map_err(|_| InterfaceError::Stopped)?;
        let state = &mut *guard;

        while state.leftover.len() < out.len() {
            self.stream.check()?;

            if !state.awaiting_reply {
                match state.socket.send(&[0xffu8][..], 0) {
                    Ok(()) => state.awaiting_reply = true,
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            match state.socket.recv_bytes(0) {
                Ok(bytes) => {
                    state.awaiting_reply = false;
                    state.leftover.extend(bytes_to_samples(&bytes)?);
                }
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let n = out.len();
        for (dst, src) in out.iter_mut().zip(state.leftover.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }
}

impl BasebandGatewayReceiver for ZmqReceiver {
    fn receive(&self, buffer: &mut BasebandBuffer) -> Result<RxMetadata, InterfaceError> {
        if buffer.nof_channels() != self.channels.len() {
            return Err(InterfaceError::BufferSizeMismatch {
                expected: self.channels.len(),
                actual: buffer.nof_channels(),
            });
        }
        for (index, channel) in self.channels.iter().enumerate() {
            self.receive_channel(channel, buffer.channel_mut(index))?;
        }
        let ts = self.rx_time.fetch_add(buffer.nof_samples() as u64, Ordering::AcqRel);
        Ok(RxMetadata { ts })
    }
}

struct ZmqGateway {
    transmitter: Arc<ZmqTransmitter>,
    receiver: Arc<ZmqReceiver>,
    buffer_size: Option<usize>,
}

impl BasebandGateway for ZmqGateway {
    fn transmitter(&self) -> Arc<dyn BasebandGatewayTransmitter> {
        self.transmitter.clone()
    }

    fn receiver(&self) -> Arc<dyn BasebandGatewayReceiver> {
        self.receiver.clone()
    }

    fn optimal_buffer_size(&self) -> Option<usize> {
        self.buffer_size
    }
}

/// ZMQ radio session
pub struct ZmqRadioSession {
    config: ZmqRfConfig,
    gateways: Vec<Arc<ZmqGateway>>,
    tx_channels: Vec<ZmqTxChannel>,
    stream: Arc<StreamState>,
    stop_lock: Mutex<()>,
    _context: Context,
}

impl RadioSession for ZmqRadioSession {
    fn baseband_gateway(&self, sector: usize) -> Option<Arc<dyn BasebandGateway>> {
        self.gateways
            .get(sector)
            .map(|g| g.clone() as Arc<dyn BasebandGateway>)
    }

    fn read_current_time(&self) -> BasebandTimestamp {
        self.gateways
            .first()
            .map_or(0, |g| g.receiver.rx_time.load(Ordering::Acquire))
    }

    fn start(&self, init_time: BasebandTimestamp) -> Result<(), InterfaceError> {
        self.stream.start()?;
        for gateway in &self.gateways {
            gateway.receiver.rx_time.store(init_time, Ordering::Release);
        }
        for channel in &self.tx_channels {
            channel.start(
                init_time,
                self.stream.clone(),
                self.config.max_packet_samples,
                self.config.idle_timeout(),
            )?;
        }
        info!("ZMQ radio started at timestamp {}", init_time);
        Ok(())
    }

    fn stop(&self) {
        let Ok(_guard) = self.stop_lock.lock() else {
            return;
        };
        if !self.stream.stop() {
            return;
        }
        for channel in &self.tx_channels {
            channel.join();
        }
        info!("ZMQ radio stopped");
    }
}

impl Drop for ZmqRadioSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Factory for the ZMQ driver
pub struct ZmqRadioFactory;

impl RadioFactory for ZmqRadioFactory {
    fn create(
        &self,
        config: &RadioConfig,
        async_executor: Arc<dyn TaskExecutor>,
        notifier: Arc<dyn RadioNotifier>,
    ) -> Result<Arc<dyn RadioSession>, InterfaceError> {
        if config.sectors.is_empty() {
            return Err(InterfaceError::InvalidConfig("no sectors configured".into()));
        }
        let zmq_config = ZmqRfConfig::from_device_args(
            &config.device_args,
            config.srate,
            config.total_tx_channels(),
            config.total_rx_channels(),
        )?;
        info!("Initializing ZMQ RF driver");
        info!("Sample rate: {}", zmq_config.sample_rate);

        let context = Context::new();
        let stream = Arc::new(StreamState::default());
        let dispatcher = RadioEventDispatcher::new(async_executor, notifier);

        let mut tx_channels = Vec::new();
        let mut gateways = Vec::new();
        let mut tx_index = 0;
        let mut rx_index = 0;

        for (sector, sector_config) in config.sectors.iter().enumerate() {
            let mut tx_shared = Vec::new();
            for _ in 0..sector_config.nof_tx_channels {
                let channel = ZmqTxChannel::new(&context, &zmq_config.tx_addresses[tx_index], &zmq_config)?;
                tx_shared.push(channel.shared.clone());
                tx_channels.push(channel);
                tx_index += 1;
            }

            let mut rx_channels = Vec::new();
            for _ in 0..sector_config.nof_rx_channels {
                let address = &zmq_config.rx_addresses[rx_index];
                info!("Creating RX socket (REQ) to connect to {}", address);
                let socket = context.socket(zmq::REQ)?;
                socket.set_linger(0)?;
                socket.set_rcvtimeo(zmq_config.timeout_ms)?;
                socket.set_sndtimeo(zmq_config.timeout_ms)?;
                socket.connect(address)?;
                rx_channels.push(Mutex::new(RxSocket {
                    socket,
                    leftover: VecDeque::new(),
                    awaiting_reply: false,
                }));
                rx_index += 1;
            }

            gateways.push(Arc::new(ZmqGateway {
                transmitter: Arc::new(ZmqTransmitter {
                    sector,
                    channels: tx_shared,
                    dispatcher: dispatcher.clone(),
                }),
                receiver: Arc::new(ZmqReceiver {
                    channels: rx_channels,
                    rx_time: Arc::new(AtomicU64::new(0)),
                    stream: stream.clone(),
                }),
                buffer_size: zmq_config.buffer_size,
            }));
        }

        info!("ZMQ RF driver initialized with {} sectors", gateways.len());
        Ok(Arc::new(ZmqRadioSession {
            config: zmq_config,
            gateways,
            tx_channels,
            stream,
            stop_lock: Mutex::new(()),
            _context: context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioNotificationCounter, RadioSectorConfig};
    use common::InlineExecutor;

    fn radio_config(args: &str) -> RadioConfig {
        RadioConfig {
            driver: "zmq".into(),
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
        }
    }

    #[test]
    fn test_device_args_defaults_and_indexing() {
        let srate = SamplingRate::from_mhz(23.04);
        let config = ZmqRfConfig::from_device_args("tx_port1=tcp://*:5000,base_srate=23.04e6", srate, 2, 2).unwrap();
        assert_eq!(config.tx_addresses, vec!["tcp://*:2000", "tcp://*:5000"]);
        assert_eq!(config.rx_addresses, vec!["tcp://localhost:2001", "tcp://localhost:2003"]);
        assert_eq!(config.base_srate, Some(23.04e6));
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_packet_samples, 23040);
        assert!(ZmqRfConfig::from_device_args("base_srate=fast", srate, 1, 1).is_err());
    }

    #[test]
    fn test_loopback_through_sockets() {
        let args = "tx_port0=tcp://127.0.0.1:25100,rx_port0=tcp://127.0.0.1:25100,timeout_ms=20";
        let counter = Arc::new(RadioNotificationCounter::new());
        let session = ZmqRadioFactory
            .create(&radio_config(args), InlineExecutor::new("inline"), counter.clone())
            .unwrap();
        let gateway = session.baseband_gateway(0).unwrap();
        assert!(session.baseband_gateway(1).is_none());
        session.start(0).unwrap();

        let mut tx = BasebandBuffer::new(1, 64);
        for (i, sample) in tx.channel_mut(0).iter_mut().enumerate() {
            *sample = Complex32::new(i as f32, -(i as f32));
        }
        gateway.transmitter().transmit(&tx, TxMetadata { ts: 0 }).unwrap();

        let mut rx = BasebandBuffer::new(1, 64);
        let metadata = gateway.receiver().receive(&mut rx).unwrap();
        assert_eq!(metadata.ts, 0);
        assert_eq!(rx, tx);
        assert_eq!(session.read_current_time(), 64);

        // Retransmitting the same timestamp is late
        gateway.transmitter().transmit(&tx, TxMetadata { ts: 0 }).unwrap();
        assert_eq!(counter.count(RadioEventSource::Transmit, RadioEventKind::Late), 1);

        session.stop();
        session.stop();
        assert!(matches!(
            gateway.receiver().receive(&mut rx),
            Err(InterfaceError::Stopped)
        ));
    }

    #[test]
    fn test_idle_channel_answers_with_zeros() {
        let args = "tx_port0=tcp://127.0.0.1:25110,rx_port0=tcp://127.0.0.1:25110,timeout_ms=20,max_packet=32";
        let session = ZmqRadioFactory
            .create(
                &radio_config(args),
                InlineExecutor::new("inline"),
                Arc::new(RadioNotificationCounter::new()),
            )
            .unwrap();
        let gateway = session.baseband_gateway(0).unwrap();
        session.start(0).unwrap();

        // Nothing transmitted yet: the receive side still gets its samples
        let mut rx = BasebandBuffer::new(1, 64);
        rx.channel_mut(0).fill(Complex32::new(1.0, 1.0));
        assert_eq!(gateway.receiver().receive(&mut rx).unwrap().ts, 0);
        assert!(rx.channel(0).iter().all(|s| s.norm() == 0.0));

        // Later transmissions continue the timeline after the zeros
        let mut tx = BasebandBuffer::new(1, 64);
        for (i, sample) in tx.channel_mut(0).iter_mut().enumerate() {
            *sample = Complex32::new(1.0 + i as f32, 0.0);
        }
        gateway.transmitter().transmit(&tx, TxMetadata { ts: 64 }).unwrap();
        assert_eq!(gateway.receiver().receive(&mut rx).unwrap().ts, 64);
        assert_eq!(rx, tx);
        session.stop();
    }
}
