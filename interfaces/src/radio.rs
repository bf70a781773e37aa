//! Radio Session Boundary
//!
//! Traits the lower PHY uses to drive a radio, the radio factory selecting a
//! driver by name, and real-time event reporting.

use crate::baseband::{BasebandGateway, BasebandTimestamp};
use crate::virtual_rf::VirtualRadioFactory;
use crate::zmq_rf::ZmqRadioFactory;
use crate::InterfaceError;
use common::{SamplingRate, TaskExecutor};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-sector radio stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RadioSectorConfig {
    /// Transmit center frequency in Hz
    pub tx_freq_hz: f64,
    /// Receive center frequency in Hz
    pub rx_freq_hz: f64,
    /// Number of transmit channels (ports)
    pub nof_tx_channels: usize,
    /// Number of receive channels (ports)
    pub nof_rx_channels: usize,
    /// Transmit gain in dB
    pub tx_gain_db: f32,
    /// Receive gain in dB
    pub rx_gain_db: f32,
}

/// Radio configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RadioConfig {
    /// Driver name ("zmq" or "virtual")
    pub driver: String,
    /// Driver arguments in `key=value,key=value` form
    pub device_args: String,
    /// Baseband sampling rate
    pub srate: SamplingRate,
    /// One entry per sector
    pub sectors: Vec<RadioSectorConfig>,
}

impl RadioConfig {
    /// Total number of transmit channels across sectors
    pub fn total_tx_channels(&self) -> usize {
        self.sectors.iter().map(|s| s.nof_tx_channels).sum()
    }

    /// Total number of receive channels across sectors
    pub fn total_rx_channels(&self) -> usize {
        self.sectors.iter().map(|s| s.nof_rx_channels).sum()
    }
}

/// Parse device arguments in srsRAN format
/// Format: "key1=value1,key2=value2,..."
pub fn parse_device_args(args: &str) -> Result<HashMap<String, String>, InterfaceError> {
    let mut map = HashMap::new();
    for pair in args.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| InterfaceError::InvalidConfig(format!("Malformed device argument '{}'", pair)))?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Direction the event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioEventSource {
    Transmit,
    Receive,
}

/// Kind of real-time event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioEventKind {
    /// The radio received more than the application consumed
    Overflow,
    /// The radio ran out of samples to transmit
    Underflow,
    /// Samples arrived after their transmission time
    Late,
    Other,
}

/// Real-time event reported by a radio driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioEvent {
    pub sector: usize,
    pub channel: usize,
    pub source: RadioEventSource,
    pub kind: RadioEventKind,
    pub timestamp: Option<BasebandTimestamp>,
}

impl fmt::Display for RadioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} on sector {} channel {}",
            self.source, self.kind, self.sector, self.channel
        )?;
        if let Some(ts) = self.timestamp {
            write!(f, " at {}", ts)?;
        }
        Ok(())
    }
}

/// Receives radio events
pub trait RadioNotifier: Send + Sync {
    fn on_radio_rt_event(&self, event: RadioEvent);
}

/// Counts radio events per direction and kind
#[derive(Default)]
pub struct RadioNotificationCounter {
    counters: [[AtomicU64; 4]; 2],
}

impl RadioNotificationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(source: RadioEventSource, kind: RadioEventKind) -> (usize, usize) {
        let source = match source {
            RadioEventSource::Transmit => 0,
            RadioEventSource::Receive => 1,
        };
        let kind = match kind {
            RadioEventKind::Overflow => 0,
            RadioEventKind::Underflow => 1,
            RadioEventKind::Late => 2,
            RadioEventKind::Other => 3,
        };
        (source, kind)
    }

    pub fn count(&self, source: RadioEventSource, kind: RadioEventKind) -> u64 {
        let (s, k) = Self::index(source, kind);
        self.counters[s][k].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .flat_map(|row| row.iter())
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// One-line summary of every counter
    pub fn summary(&self) -> String {
        let line = |source| {
            format!(
                "overflow={} underflow={} late={} other={}",
                self.count(source, RadioEventKind::Overflow),
                self.count(source, RadioEventKind::Underflow),
                self.count(source, RadioEventKind::Late),
                self.count(source, RadioEventKind::Other),
            )
        };
        format!(
            "Tx: {} | Rx: {}",
            line(RadioEventSource::Transmit),
            line(RadioEventSource::Receive)
        )
    }

    pub fn print_summary(&self) {
        info!("Radio events: {}", self.summary());
    }
}

impl RadioNotifier for RadioNotificationCounter {
    fn on_radio_rt_event(&self, event: RadioEvent) {
        let (s, k) = Self::index(event.source, event.kind);
        self.counters[s][k].fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards events to a notifier from the asynchronous executor so that
/// drivers never call application code from their streaming threads.
#[derive(Clone)]
pub struct RadioEventDispatcher {
    executor: Arc<dyn TaskExecutor>,
    notifier: Arc<dyn RadioNotifier>,
}

impl RadioEventDispatcher {
    pub fn new(executor: Arc<dyn TaskExecutor>, notifier: Arc<dyn RadioNotifier>) -> Self {
        Self { executor, notifier }
    }

    pub fn notify(&self, event: RadioEvent) {
        let notifier = self.notifier.clone();
        if let Err(e) = self
            .executor
            .execute(Box::new(move || notifier.on_radio_rt_event(event)))
        {
            warn!("Dropped radio event ({}): {}", event, e);
        }
    }
}

/// A running radio
pub trait RadioSession: Send + Sync {
    /// Baseband gateway of a sector
    fn baseband_gateway(&self, sector: usize) -> Option<Arc<dyn BasebandGateway>>;

    /// Current receive time in samples
    fn read_current_time(&self) -> BasebandTimestamp;

    /// Start streaming; samples are produced from `init_time` on
    fn start(&self, init_time: BasebandTimestamp) -> Result<(), InterfaceError>;

    /// Stop streaming and unblock every pending receive
    fn stop(&self);
}

/// Creates radio sessions
pub trait RadioFactory: Send + Sync {
    fn create(
        &self,
        config: &RadioConfig,
        async_executor: Arc<dyn TaskExecutor>,
        notifier: Arc<dyn RadioNotifier>,
    ) -> Result<Arc<dyn RadioSession>, InterfaceError>;
}

/// Select a radio factory by driver name
pub fn create_radio_factory(driver: &str) -> Result<Box<dyn RadioFactory>, InterfaceError> {
    match driver {
        "zmq" => Ok(Box::new(ZmqRadioFactory)),
        "virtual" => Ok(Box::new(VirtualRadioFactory)),
        other => Err(InterfaceError::UnknownDriver(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::InlineExecutor;

    #[test]
    fn test_parse_device_args() {
        let args = parse_device_args("tx_port0=tcp://*:2000, rx_port0=tcp://localhost:2001,base_srate=23.04e6").unwrap();
        assert_eq!(args.get("tx_port0").unwrap(), "tcp://*:2000");
        assert_eq!(args.get("rx_port0").unwrap(), "tcp://localhost:2001");
        assert_eq!(args.get("base_srate").unwrap(), "23.04e6");
        assert!(parse_device_args("").unwrap().is_empty());
        assert!(parse_device_args("loopback").is_err());
    }

    #[test]
    fn test_unknown_driver() {
        assert!(matches!(
            create_radio_factory("uhd"),
            Err(InterfaceError::UnknownDriver(name)) if name == "uhd"
        ));
        assert!(create_radio_factory("virtual").is_ok());
        assert!(create_radio_factory("zmq").is_ok());
    }

    #[test]
    fn test_notification_counter() {
        let counter = Arc::new(RadioNotificationCounter::new());
        let dispatcher = RadioEventDispatcher::new(InlineExecutor::new("inline"), counter.clone());
        let event = RadioEvent {
            sector: 0,
            channel: 0,
            source: RadioEventSource::Transmit,
            kind: RadioEventKind::Late,
            timestamp: Some(42),
        };
        dispatcher.notify(event);
        dispatcher.notify(event);
        dispatcher.notify(RadioEvent {
            source: RadioEventSource::Receive,
            kind: RadioEventKind::Overflow,
            ..event
        });
        assert_eq!(counter.count(RadioEventSource::Transmit, RadioEventKind::Late), 2);
        assert_eq!(counter.count(RadioEventSource::Receive, RadioEventKind::Overflow), 1);
        assert_eq!(counter.total(), 3);
        assert!(counter.summary().starts_with("Tx: overflow=0 underflow=0 late=2"));
    }
}
