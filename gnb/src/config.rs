//! Application Configuration
//!
//! A run is described by an [`AppConfig`]. It starts from a built-in
//! profile, is optionally overridden by a TOML or YAML file and finally by
//! the command line flags.

use crate::upper_phy::Modulation;
use crate::workers::ThreadProfile;
use crate::Args;
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use common::types::{CyclicPrefix, Pci, SamplingRate, SubcarrierSpacing};
use interfaces::{RadioConfig, RadioSectorConfig};
use layers::phy::{
    AmplitudeControllerConfig, BufferSizePolicy, LowerPhyConfiguration, SectorDescription, SsbConfiguration,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// ZMQ port used for both directions in loopback mode
const ZMQ_LOOPBACK_PORT: u16 = 2000;

/// Built-in configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// 20 MHz TDD carrier in band n78 over ZMQ, 30 kHz
    #[value(name = "zmq_20MHz_n78")]
    Zmq20MhzN78,
    /// 20 MHz FDD carrier in band n7 over ZMQ, 15 kHz
    #[value(name = "zmq_20MHz_n7")]
    Zmq20MhzN7,
    /// Same carrier as zmq_20MHz_n78 on the in-memory radio
    #[value(name = "virtual_20MHz_n78")]
    Virtual20MhzN78,
}

impl Profile {
    pub fn config(self) -> AppConfig {
        let n78 = AppConfig::default();
        match self {
            Profile::Zmq20MhzN78 => n78,
            Profile::Zmq20MhzN7 => AppConfig {
                radio: RadioSection {
                    device_args: "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001,base_srate=23.04e6".into(),
                    srate_mhz: 23.04,
                    ..n78.radio
                },
                cell: CellSection {
                    scs_khz: 15,
                    bandwidth_rb: 106,
                    dl_freq_hz: 2_680_000_000.0,
                    ul_freq_hz: 2_560_000_000.0,
                    ssb_freq_hz: 2_674_060_000.0,
                    ssb_period_ms: 10,
                    ..n78.cell
                },
                ..n78
            },
            Profile::Virtual20MhzN78 => AppConfig {
                radio: RadioSection {
                    driver: "virtual".into(),
                    device_args: "loopback=0,realtime=1".into(),
                    ..n78.radio
                },
                ..n78
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RadioSection {
    /// "zmq" or "virtual"
    pub driver: String,
    pub device_args: String,
    pub srate_mhz: f64,
    pub tx_gain_db: f32,
    pub rx_gain_db: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellSection {
    pub pci: u16,
    pub scs_khz: u32,
    pub bandwidth_rb: usize,
    pub dl_freq_hz: f64,
    pub ul_freq_hz: f64,
    pub ssb_freq_hz: f64,
    pub ssb_period_ms: u32,
    pub nof_ports: usize,
}

/// Serialized form of [`BufferSizePolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    SinglePacket,
    HalfSlot,
    Slot,
    OptimalSlot,
}

impl From<BufferPolicy> for BufferSizePolicy {
    fn from(policy: BufferPolicy) -> Self {
        match policy {
            BufferPolicy::SinglePacket => BufferSizePolicy::SinglePacket,
            BufferPolicy::HalfSlot => BufferSizePolicy::HalfSlot,
            BufferPolicy::Slot => BufferSizePolicy::Slot,
            BufferPolicy::OptimalSlot => BufferSizePolicy::OptimalSlot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LowerPhySection {
    pub max_processing_delay_slots: usize,
    pub dft_window_offset: f32,
    pub start_delay_ms: Option<u32>,
    pub buffer_size_policy: BufferPolicy,
    pub thread_profile: ThreadProfile,
    pub enable_clipping: bool,
    pub backoff_db: f32,
    pub ceiling_dbfs: f32,
    pub full_scale: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSection {
    /// Slots to run for; 0 runs until a signal arrives
    pub duration_slots: u64,
    pub random_data: bool,
    pub modulation: Modulation,
    pub enable_ul: bool,
    pub enable_prach: bool,
    /// Receive what is transmitted
    pub loopback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub radio: RadioSection,
    pub cell: CellSection,
    pub lower_phy: LowerPhySection,
    pub test: TestSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        let amplitude = AmplitudeControllerConfig::default();
        Self {
            radio: RadioSection {
                driver: "zmq".into(),
                device_args: "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001,base_srate=61.44e6".into(),
                srate_mhz: 61.44,
                tx_gain_db: 60.0,
                rx_gain_db: 40.0,
            },
            cell: CellSection {
                pci: 1,
                scs_khz: 30,
                bandwidth_rb: 52,
                dl_freq_hz: 3_500_000_000.0,
                ul_freq_hz: 3_500_000_000.0,
                ssb_freq_hz: 3_503_030_000.0,
                ssb_period_ms: 20,
                nof_ports: 1,
            },
            lower_phy: LowerPhySection {
                max_processing_delay_slots: 4,
                dft_window_offset: 0.5,
                start_delay_ms: Some(10),
                buffer_size_policy: BufferPolicy::Slot,
                thread_profile: ThreadProfile::Single,
                enable_clipping: amplitude.enable_clipping,
                backoff_db: amplitude.backoff_db,
                ceiling_dbfs: amplitude.ceiling_dbfs,
                full_scale: amplitude.full_scale,
            },
            test: TestSection {
                duration_slots: 20_000,
                random_data: false,
                modulation: Modulation::default(),
                enable_ul: false,
                enable_prach: false,
                loopback: false,
            },
        }
    }
}

/// Overlay `top` on `base`, table by table
fn merge(base: &mut toml::Value, top: toml::Value) {
    match (base, top) {
        (toml::Value::Table(base), toml::Value::Table(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

impl AppConfig {
    /// Profile, then configuration file, then command line
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut config = args.profile.config();
        if let Some(path) = &args.config {
            config = config.with_file(path)?;
            info!("Loaded configuration overrides from {}", path.display());
        }
        Ok(config.with_args(args))
    }

    /// Apply the values of a TOML or YAML file; missing keys keep their value
    pub fn with_file(self, path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
        let overrides: toml::Value = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => bail!("Unknown configuration format of {}, expected .toml or .yaml", path.display()),
        };
        let mut merged = toml::Value::try_from(&self)?;
        merge(&mut merged, overrides);
        merged
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(duration) = args.duration {
            self.test.duration_slots = duration;
        }
        if let Some(profile) = args.thread_profile {
            self.lower_phy.thread_profile = profile;
        }
        if let Some(backoff) = args.backoff {
            self.lower_phy.backoff_db = backoff;
        }
        if let Some(ports) = args.ports {
            self.cell.nof_ports = ports;
        }
        if let Some(modulation) = args.modulation {
            self.test.modulation = modulation;
        }
        self.test.loopback |= args.loopback;
        self.lower_phy.enable_clipping |= args.clipping;
        self.test.random_data |= args.random_data;
        self.test.enable_ul |= args.uplink;
        self.test.enable_prach |= args.prach;
        self
    }

    pub fn scs(&self) -> Result<SubcarrierSpacing> {
        SubcarrierSpacing::from_khz(self.cell.scs_khz)
            .ok_or_else(|| anyhow!("Invalid subcarrier spacing {} kHz", self.cell.scs_khz))
    }

    pub fn srate(&self) -> SamplingRate {
        SamplingRate::from_mhz(self.radio.srate_mhz)
    }

    pub fn lower_phy_config(&self) -> Result<LowerPhyConfiguration> {
        let lower_phy = &self.lower_phy;
        let config = LowerPhyConfiguration {
            srate: self.srate(),
            scs: self.scs()?,
            cp: CyclicPrefix::Normal,
            max_processing_delay_slots: lower_phy.max_processing_delay_slots,
            dft_window_offset: lower_phy.dft_window_offset,
            start_delay_ms: lower_phy.start_delay_ms,
            buffer_size_policy: lower_phy.buffer_size_policy.into(),
            amplitude: AmplitudeControllerConfig {
                enable_clipping: lower_phy.enable_clipping,
                backoff_db: lower_phy.backoff_db,
                ceiling_dbfs: lower_phy.ceiling_dbfs,
                full_scale: lower_phy.full_scale,
            },
            sectors: vec![SectorDescription {
                bandwidth_rb: self.cell.bandwidth_rb,
                dl_freq_hz: self.cell.dl_freq_hz,
                ul_freq_hz: self.cell.ul_freq_hz,
                nof_tx_ports: self.cell.nof_ports,
                nof_rx_ports: self.cell.nof_ports,
            }],
        };
        config.validate()?;
        Ok(config)
    }

    /// Driver arguments with loopback applied
    pub fn device_args(&self) -> String {
        if !self.test.loopback {
            return self.radio.device_args.clone();
        }
        match self.radio.driver.as_str() {
            "zmq" => {
                let mut args: Vec<String> = self
                    .radio
                    .device_args
                    .split(',')
                    .filter(|arg| !arg.starts_with("tx_port") && !arg.starts_with("rx_port"))
                    .map(str::to_string)
                    .collect();
                args.push(format!("tx_port=tcp://*:{}", ZMQ_LOOPBACK_PORT));
                args.push(format!("rx_port=tcp://localhost:{}", ZMQ_LOOPBACK_PORT));
                args.join(",")
            }
            _ => format!("{},loopback=1", self.radio.device_args),
        }
    }

    pub fn radio_config(&self) -> RadioConfig {
        RadioConfig {
            driver: self.radio.driver.clone(),
            device_args: self.device_args(),
            srate: self.srate(),
            sectors: vec![RadioSectorConfig {
                tx_freq_hz: self.cell.dl_freq_hz,
                rx_freq_hz: self.cell.ul_freq_hz,
                nof_tx_channels: self.cell.nof_ports,
                nof_rx_channels: self.cell.nof_ports,
                tx_gain_db: self.radio.tx_gain_db,
                rx_gain_db: self.radio.rx_gain_db,
            }],
        }
    }

    pub fn ssb_config(&self) -> Result<SsbConfiguration> {
        let pci = Pci::new(self.cell.pci).ok_or_else(|| anyhow!("Invalid PCI {}", self.cell.pci))?;
        Ok(SsbConfiguration::from_center_frequencies(
            pci,
            self.scs()?,
            self.cell.bandwidth_rb,
            self.cell.dl_freq_hz,
            self.cell.ssb_freq_hz,
            self.cell.ssb_period_ms,
        )?)
    }
}
