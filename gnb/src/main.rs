//! Lower PHY Example Application
//!
//! Runs the lower PHY against a ZMQ or virtual radio with a stand-in upper
//! PHY feeding it resource grids, until the configured number of slots has
//! elapsed or a termination signal arrives.

mod config;
mod upper_phy;
mod workers;

use anyhow::Result;
use clap::Parser;
use config::{AppConfig, Profile};
use interfaces::{create_radio_factory, RadioNotificationCounter};
use layers::phy::{create_lower_phy, LowerPhyDependencies};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};
use upper_phy::{Modulation, UpperPhyConfig, UpperPhyStub};
use workers::{LowerPhyWorkers, ThreadProfile};

/// Longest time the main loop sleeps between two cancellation checks
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Frames between two progress reports
const REPORT_FRAMES: u32 = 100;

/// Lower PHY example
#[derive(Parser, Debug)]
#[command(name = "lower_phy_example", author, version, about, long_about = None)]
pub struct Args {
    /// Configuration profile
    #[arg(short = 'P', long, value_enum, default_value_t = Profile::Zmq20MhzN78)]
    pub profile: Profile,

    /// TOML or YAML file applied on top of the profile
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Duration in slots, 0 runs until interrupted
    #[arg(short = 'D', long)]
    pub duration: Option<u64>,

    /// Thread profile
    #[arg(short = 'T', long, value_enum)]
    pub thread_profile: Option<ThreadProfile>,

    /// Receive the transmitted signal
    #[arg(short = 'L', long)]
    pub loopback: bool,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(short = 'v', long, default_value = "info")]
    pub log_level: String,

    /// Clip the transmitted signal
    #[arg(short = 'c', long)]
    pub clipping: bool,

    /// Transmit power backoff in dB
    #[arg(short = 'b', long)]
    pub backoff: Option<f32>,

    /// Fill the downlink grids with random data
    #[arg(short = 'd', long)]
    pub random_data: bool,

    /// Request uplink slots
    #[arg(short = 'u', long)]
    pub uplink: bool,

    /// Request PRACH windows
    #[arg(short = 'p', long)]
    pub prach: bool,

    /// Antenna ports
    #[arg(short = 'a', long)]
    pub ports: Option<usize>,

    /// Modulation of the random data
    #[arg(short = 'm', long, value_enum)]
    pub modulation: Option<Modulation>,
}

/// Set `cancel` on the first termination signal
async fn watch_signals(cancel: Arc<AtomicBool>) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    info!("Received {}, stopping", name);
    cancel.store(true, Ordering::Release);
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    let lower_phy_config = config.lower_phy_config()?;
    let ssb = config.ssb_config()?;
    info!("Cell: {} RB at {} kHz, {}", config.cell.bandwidth_rb, config.cell.scs_khz, ssb);

    let workers = LowerPhyWorkers::new(config.lower_phy.thread_profile)?;
    let radio_events = Arc::new(RadioNotificationCounter::new());
    let radio = create_radio_factory(&config.radio.driver)?.create(
        &config.radio_config(),
        workers.async_executor(),
        radio_events.clone(),
    )?;

    let (upper_phy, mut slots) = UpperPhyStub::new(UpperPhyConfig {
        sector: 0,
        scs: lower_phy_config.scs,
        bandwidth_rb: config.cell.bandwidth_rb,
        symbols_per_slot: lower_phy_config.cp.symbols_per_slot(),
        nof_ports: config.cell.nof_ports,
        nof_grids: 2 * lower_phy_config.max_processing_delay_slots + 4,
        random_data: config.test.random_data,
        modulation: config.test.modulation,
        enable_ul: config.test.enable_ul,
        enable_prach: config.test.enable_prach,
        prach_format: layers::phy::PrachFormat::Format0,
    });

    let lower_phy = create_lower_phy(
        &lower_phy_config,
        LowerPhyDependencies {
            radio: radio.clone(),
            executors: workers.executors(),
            rx_symbol_notifier: upper_phy.clone(),
            timing_notifier: upper_phy.clone(),
            error_notifier: upper_phy.clone(),
        },
    )?;
    upper_phy.connect(lower_phy.rg_handler(), lower_phy.request_handler());

    let cancel = Arc::new(AtomicBool::new(false));
    let signals = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_signals(cancel).await {
                error!("Cannot install signal handlers: {}", e);
            }
        })
    };

    let controller = lower_phy.controller();
    controller.start(radio.read_current_time())?;

    let duration = config.test.duration_slots;
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        if duration > 0 && upper_phy.nof_slots() >= duration {
            info!("Ran for {} slots", upper_phy.nof_slots());
            break;
        }
        tokio::select! {
            changed = slots.changed() => {
                if changed.is_err() {
                    break;
                }
                let slot = *slots.borrow_and_update();
                if let Some(slot) = slot {
                    if slot.slot_index() == 0 && slot.sfn() % REPORT_FRAMES == 0 {
                        info!("Slot {}: {}", slot, upper_phy.counters());
                    }
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    signals.abort();

    // Stopping joins threads; keep it off the async workers
    let teardown = tokio::task::spawn_blocking(move || {
        controller.stop();
        workers.stop();
        lower_phy
    });
    let lower_phy = teardown.await?;

    radio_events.print_summary();
    info!("Upper PHY: {}", upper_phy.counters());
    for (sector, metrics) in lower_phy.amplitude_metrics().iter().enumerate() {
        info!("Sector {} amplitude: {}", sector, metrics.summary());
    }
    debug!("Lower PHY example finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting lower PHY example with profile {:?}", args.profile);
    let config = AppConfig::resolve(&args)?;
    if let Err(e) = run(config).await {
        error!("Lower PHY example failed: {:#}", e);
        return Err(e);
    }
    info!("Lower PHY example stopped");
    Ok(())
}
