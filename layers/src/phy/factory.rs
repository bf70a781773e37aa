//! Lower PHY Factory
//!
//! Builds the per-sector processing chains and the controller driving them.

use super::amplitude_control::{create_amplitude_controller, AmplitudeMetricsCollector};
use super::baseband_processor::{BasebandProcessor, BasebandProcessorConfig, BasebandProcessorExecutors};
use super::config::{LowerPhyConfiguration, LowerPhyDependencies, SectorDescription};
use super::controller::LowerPhyController;
use super::dft::{DftDirection, DftFactory};
use super::downlink::DownlinkProcessor;
use super::frame_structure::SymbolTiming;
use super::notifiers::{
    LowerPhyRequestHandler, LowerPhyRgHandler, LowerPhyTimingNotifier, NullTimingNotifier, ResourceGridContext,
};
use super::ofdm::{OfdmConfig, OfdmSymbolDemodulator, OfdmSymbolModulator};
use super::pdxch::{PdxchProcessor, PdxchRequestHandler};
use super::prach::{PrachBufferContext, PrachDemodulator};
use super::prach_processor::{PrachProcessor, PrachRequestHandler};
use super::puxch::{PuxchProcessor, PuxchRequestHandler};
use super::resource_grid::PooledGrid;
use super::uplink::UplinkProcessor;
use crate::LayerError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffers per direction on top of two per slot of processing delay
const MIN_BUFFERS: usize = 4;

/// A constructed lower PHY
pub struct LowerPhy {
    controller: Arc<LowerPhyController>,
    rg_handler: Arc<SectorRgRouter>,
    request_handler: Arc<SectorRequestRouter>,
    amplitude_metrics: Vec<Arc<AmplitudeMetricsCollector>>,
}

impl LowerPhy {
    pub fn controller(&self) -> Arc<LowerPhyController> {
        self.controller.clone()
    }

    /// Entry point for downlink resource grids
    pub fn rg_handler(&self) -> Arc<dyn LowerPhyRgHandler> {
        self.rg_handler.clone()
    }

    /// Entry point for uplink slot and PRACH window requests
    pub fn request_handler(&self) -> Arc<dyn LowerPhyRequestHandler> {
        self.request_handler.clone()
    }

    /// Transmit amplitude metrics, one collector per sector
    pub fn amplitude_metrics(&self) -> &[Arc<AmplitudeMetricsCollector>] {
        &self.amplitude_metrics
    }
}

/// Dispatches downlink grids to the sector they belong to
struct SectorRgRouter {
    sectors: Vec<Arc<PdxchRequestHandler>>,
}

impl LowerPhyRgHandler for SectorRgRouter {
    fn handle_resource_grid(&self, context: &ResourceGridContext, grid: PooledGrid) {
        match self.sectors.get(context.sector) {
            Some(handler) => handler.handle_resource_grid(context, grid),
            None => warn!("Dropping downlink grid for unknown sector {}", context.sector),
        }
    }
}

/// Dispatches uplink requests to the sector they belong to
struct SectorRequestRouter {
    prach: Vec<Arc<PrachRequestHandler>>,
    puxch: Vec<Arc<PuxchRequestHandler>>,
}

impl LowerPhyRequestHandler for SectorRequestRouter {
    fn request_prach_window(&self, context: &PrachBufferContext) {
        match self.prach.get(context.sector) {
            Some(handler) => handler.handle_request(context),
            None => warn!("Ignoring PRACH request for unknown sector {}", context.sector),
        }
    }

    fn request_uplink_slot(&self, context: &ResourceGridContext, grid: PooledGrid) {
        match self.puxch.get(context.sector) {
            Some(handler) => handler.handle_request(context, grid),
            None => warn!("Dropping uplink grid for unknown sector {}", context.sector),
        }
    }
}

struct SectorChain {
    baseband: BasebandProcessor,
    prach: Arc<PrachProcessor>,
    pdxch_handler: Arc<PdxchRequestHandler>,
    puxch_handler: Arc<PuxchRequestHandler>,
    prach_handler: Arc<PrachRequestHandler>,
    metrics: Arc<AmplitudeMetricsCollector>,
}

/// Build a lower PHY for every configured sector
pub fn create_lower_phy(config: &LowerPhyConfiguration, deps: LowerPhyDependencies) -> Result<LowerPhy, LayerError> {
    config.validate()?;
    let timing = SymbolTiming::new(config.srate, config.scs, config.cp)?;
    let dft_factory = DftFactory::best_available();
    info!(
        "Creating lower PHY: {} sectors, {} at {}, DFT size {} ({:?})",
        config.sectors.len(),
        config.scs,
        config.srate,
        timing.dft_size(),
        dft_factory.backend()
    );

    let chains = config
        .sectors
        .iter()
        .enumerate()
        .map(|(index, sector)| create_sector(config, &deps, &timing, dft_factory, index, sector))
        .collect::<Result<Vec<_>, _>>()?;

    let mut basebands = Vec::with_capacity(chains.len());
    let mut prach = Vec::with_capacity(chains.len());
    let mut rg_router = SectorRgRouter { sectors: Vec::new() };
    let mut request_router = SectorRequestRouter {
        prach: Vec::new(),
        puxch: Vec::new(),
    };
    let mut amplitude_metrics = Vec::with_capacity(chains.len());
    for chain in chains {
        basebands.push(chain.baseband);
        prach.push(chain.prach);
        rg_router.sectors.push(chain.pdxch_handler);
        request_router.prach.push(chain.prach_handler);
        request_router.puxch.push(chain.puxch_handler);
        amplitude_metrics.push(chain.metrics);
    }

    let controller = LowerPhyController::new(deps.radio.clone(), basebands, prach, config.start_delay_samples());
    Ok(LowerPhy {
        controller: Arc::new(controller),
        rg_handler: Arc::new(rg_router),
        request_handler: Arc::new(request_router),
        amplitude_metrics,
    })
}

fn create_sector(
    config: &LowerPhyConfiguration,
    deps: &LowerPhyDependencies,
    timing: &SymbolTiming,
    dft_factory: DftFactory,
    index: usize,
    sector: &SectorDescription,
) -> Result<SectorChain, LayerError> {
    let gateway = deps
        .radio
        .baseband_gateway(index)
        .ok_or_else(|| LayerError::InitializationFailed(format!("Radio has no baseband gateway for sector {}", index)))?;

    let dft_size = timing.dft_size();
    let ofdm = |center_freq_hz: f64| OfdmConfig {
        scs: config.scs,
        dft_size,
        cp: config.cp,
        bw_rb: sector.bandwidth_rb,
        scale: 1.0,
        center_freq_hz,
        window_offset: config.dft_window_offset,
    };
    let modulator = OfdmSymbolModulator::new(
        ofdm(sector.dl_freq_hz),
        dft_factory.create(dft_size, DftDirection::Inverse)?,
    )?;
    let demodulator = OfdmSymbolDemodulator::new(
        ofdm(sector.ul_freq_hz),
        dft_factory.create(dft_size, DftDirection::Forward)?,
    )?;

    let symbols_per_slot = timing.symbols_per_slot();
    let delay = config.max_processing_delay_slots;
    let pdxch = PdxchProcessor::new(index, symbols_per_slot, delay, modulator, deps.error_notifier.clone());
    let puxch = PuxchProcessor::new(
        index,
        symbols_per_slot,
        delay,
        demodulator,
        deps.rx_symbol_notifier.clone(),
        deps.error_notifier.clone(),
    );
    let prach = Arc::new(PrachProcessor::new(
        index,
        config.srate,
        timing.clone(),
        sector.nof_rx_ports,
        PrachDemodulator::new(config.srate, dft_factory),
        deps.executors.prach.clone(),
        deps.rx_symbol_notifier.clone(),
        deps.error_notifier.clone(),
    ));

    // A single stream of timing events reaches the upper layers
    let timing_notifier: Arc<dyn LowerPhyTimingNotifier> = if index == 0 {
        deps.timing_notifier.clone()
    } else {
        Arc::new(NullTimingNotifier)
    };

    let metrics = Arc::new(AmplitudeMetricsCollector::new());
    let pdxch_handler = pdxch.request_handler();
    let puxch_handler = puxch.request_handler();
    let prach_handler = prach.request_handler();

    let uplink = UplinkProcessor::new(
        index,
        timing.clone(),
        sector.nof_rx_ports,
        puxch,
        prach.clone(),
        timing_notifier.clone(),
    );
    let downlink = DownlinkProcessor::new(
        index,
        timing.clone(),
        sector.nof_tx_ports,
        delay,
        pdxch,
        create_amplitude_controller(&config.amplitude, sector.bandwidth_rb),
        metrics.clone(),
        timing_notifier,
    );

    let slot_size = timing.nominal_slot_size();
    let baseband_config = BasebandProcessorConfig {
        sector: index,
        nof_tx_ports: sector.nof_tx_ports,
        nof_rx_ports: sector.nof_rx_ports,
        buffer_size: config
            .buffer_size_policy
            .buffer_size(slot_size, gateway.optimal_buffer_size()),
        tx_time_offset: (delay * slot_size) as u64,
        nof_buffers: MIN_BUFFERS + 2 * delay,
    };
    let executors = BasebandProcessorExecutors {
        rx: deps.executors.rx.clone(),
        tx: deps.executors.tx.clone(),
        ul: deps.executors.ul.clone(),
        dl: deps.executors.dl.clone(),
    };
    let baseband = BasebandProcessor::new(
        &baseband_config,
        timing.clone(),
        gateway.receiver(),
        gateway.transmitter(),
        executors,
        uplink,
        downlink,
        deps.error_notifier.clone(),
    );
    debug!(
        "Sector {}: {} samples per buffer, transmit {} samples ahead",
        index,
        baseband.buffer_size(),
        baseband.tx_time_offset()
    );

    info!(
        "Sector {}: {} RB, DL {:.3} MHz, UL {:.3} MHz, {} tx / {} rx ports",
        index,
        sector.bandwidth_rb,
        sector.dl_freq_hz / 1e6,
        sector.ul_freq_hz / 1e6,
        sector.nof_tx_ports,
        sector.nof_rx_ports
    );
    Ok(SectorChain {
        baseband,
        prach,
        pdxch_handler,
        puxch_handler,
        prach_handler,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::amplitude_control::AmplitudeControllerConfig;
    use crate::phy::baseband_processor::BufferSizePolicy;
    use crate::phy::config::LowerPhyExecutors;
    use crate::phy::controller::ControllerState;
    use crate::phy::resource_grid::ResourceGridPool;
    use crate::phy::test_doubles::{CountingErrors, RecordingRx, RecordingTiming};
    use common::executor::{TaskWorker, WorkerConfig};
    use common::types::{CyclicPrefix, SamplingRate, SlotPoint, SubcarrierSpacing};
    use interfaces::{create_radio_factory, RadioConfig, RadioNotificationCounter, RadioSectorConfig};
    use std::thread;
    use std::time::Duration;

    const SCS: SubcarrierSpacing = SubcarrierSpacing::Scs15;

    fn config(nof_sectors: usize) -> LowerPhyConfiguration {
        LowerPhyConfiguration {
            srate: SamplingRate::from_mhz(3.84),
            scs: SCS,
            cp: CyclicPrefix::Normal,
            max_processing_delay_slots: 2,
            dft_window_offset: 0.5,
            start_delay_ms: None,
            buffer_size_policy: BufferSizePolicy::Slot,
            amplitude: AmplitudeControllerConfig::default(),
            sectors: vec![
                SectorDescription {
                    bandwidth_rb: 6,
                    dl_freq_hz: 2.68e9,
                    ul_freq_hz: 2.56e9,
                    nof_tx_ports: 1,
                    nof_rx_ports: 1,
                };
                nof_sectors
            ],
        }
    }

    struct Pipeline {
        phy: LowerPhy,
        timing: Arc<RecordingTiming>,
        rx: Arc<RecordingRx>,
        errors: Arc<CountingErrors>,
        workers: Vec<Arc<TaskWorker>>,
    }

    impl Pipeline {
        fn shutdown(self) {
            self.phy.controller().stop();
            for worker in &self.workers {
                worker.stop();
            }
        }
    }

    fn pipeline(config: &LowerPhyConfiguration) -> Result<Pipeline, LayerError> {
        pipeline_on(config, "virtual", "loopback=1,realtime=0,timeout_ms=5")
    }

    fn pipeline_on(config: &LowerPhyConfiguration, driver: &str, device_args: &str) -> Result<Pipeline, LayerError> {
        let workers: Vec<_> = ["rx", "tx", "ul", "dl", "prach"]
            .iter()
            .map(|name| TaskWorker::new(WorkerConfig::new(format!("test_{}", name), 64)).unwrap())
            .collect();
        let radio_config = RadioConfig {
            driver: driver.into(),
            device_args: device_args.into(),
            srate: config.srate,
            sectors: config
                .sectors
                .iter()
                .map(|s| RadioSectorConfig {
                    tx_freq_hz: s.dl_freq_hz,
                    rx_freq_hz: s.ul_freq_hz,
                    nof_tx_channels: s.nof_tx_ports,
                    nof_rx_channels: s.nof_rx_ports,
                    tx_gain_db: 0.0,
                    rx_gain_db: 0.0,
                })
                .collect(),
        };
        let radio = create_radio_factory(driver)
            .unwrap()
            .create(&radio_config, workers[4].clone(), Arc::new(RadioNotificationCounter::new()))
            .unwrap();

        let timing = Arc::new(RecordingTiming::default());
        let rx = Arc::new(RecordingRx::default());
        let errors = Arc::new(CountingErrors::default());
        let deps = LowerPhyDependencies {
            radio,
            executors: LowerPhyExecutors {
                rx: workers[0].clone(),
                tx: workers[1].clone(),
                ul: workers[2].clone(),
                dl: workers[3].clone(),
                prach: workers[4].clone(),
            },
            rx_symbol_notifier: rx.clone(),
            timing_notifier: timing.clone(),
            error_notifier: errors.clone(),
        };
        let phy = create_lower_phy(config, deps)?;
        Ok(Pipeline {
            phy,
            timing,
            rx,
            errors,
            workers,
        })
    }

    #[test]
    fn test_pipeline_runs_and_stops() {
        let p = pipeline(&config(1)).unwrap();
        let controller = p.phy.controller();
        controller.start(0).unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        thread::sleep(Duration::from_millis(300));
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);

        let tti = p.timing.tti.lock().unwrap().clone();
        let ul_symbols = p.rx.symbols.lock().unwrap().len();
        // Nothing is processed once stop has returned
        thread::sleep(Duration::from_millis(50));
        assert_eq!(p.timing.tti.lock().unwrap().len(), tti.len());
        assert_eq!(p.rx.symbols.lock().unwrap().len(), ul_symbols);
        assert!(!tti.is_empty());
        // TTI boundaries announce slots ahead of the air time, in order
        for pair in tti.windows(2) {
            assert!(pair[1].slot.diff(&pair[0].slot) > 0);
            assert!(pair[1].time > pair[0].time);
        }
        // Slot announced = slot on air + processing delay
        for context in &tti {
            assert_eq!(context.slot.count() as u64, (context.time / 3840 + 2) % 10240);
        }
        assert!(!p.timing.full_slot.lock().unwrap().is_empty());
        assert_eq!(CountingErrors::get(&p.errors.late_grid), 0);
        p.shutdown();
    }

    #[test]
    fn test_zmq_loopback_pipeline_makes_progress() {
        let p = pipeline_on(
            &config(1),
            "zmq",
            "tx_port0=tcp://127.0.0.1:25330,rx_port0=tcp://127.0.0.1:25330,timeout_ms=20",
        )
        .unwrap();
        let controller = p.phy.controller();
        controller.start(0).unwrap();
        thread::sleep(Duration::from_millis(1000));
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);

        let tti = p.timing.tti.lock().unwrap().clone();
        assert!(!tti.is_empty());
        assert!(!p.timing.full_slot.lock().unwrap().is_empty());
        for context in &tti {
            assert_eq!(context.slot.count() as u64, (context.time / 3840 + 2) % 10240);
        }
        p.shutdown();
    }

    #[test]
    fn test_uplink_grid_is_demodulated() {
        let p = pipeline(&config(1)).unwrap();
        let pool = ResourceGridPool::new(2, 1, 14, 72);
        let context = ResourceGridContext {
            slot: SlotPoint::new(SCS, 0, 3),
            sector: 0,
        };
        p.phy.request_handler().request_uplink_slot(&context, pool.get().unwrap());
        // Unknown sectors are dropped
        p.phy.request_handler().request_uplink_slot(
            &ResourceGridContext { sector: 7, ..context },
            pool.get().unwrap(),
        );

        let controller = p.phy.controller();
        controller.start(0).unwrap();
        thread::sleep(Duration::from_millis(300));
        controller.stop();

        let symbols = p.rx.symbols.lock().unwrap();
        let slot3: Vec<_> = symbols.iter().filter(|(c, _)| c.slot == context.slot).collect();
        assert_eq!(slot3.len(), 14);
        drop(symbols);
        assert_eq!(pool.available(), 2);
        p.shutdown();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let p = pipeline(&config(1)).unwrap();
        let controller = p.phy.controller();
        controller.start(0).unwrap();
        assert!(matches!(controller.start(0), Err(LayerError::InvalidState(_))));
        controller.stop();
        assert!(matches!(controller.start(0), Err(LayerError::InvalidState(_))));
        p.shutdown();
    }

    #[test]
    fn test_concurrent_stop_on_two_sectors() {
        let p = pipeline(&config(2)).unwrap();
        assert_eq!(p.phy.amplitude_metrics().len(), 2);
        let controller = p.phy.controller();
        controller.start(0).unwrap();
        thread::sleep(Duration::from_millis(100));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let controller = controller.clone();
                thread::spawn(move || controller.stop())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(controller.state(), ControllerState::Stopped);
        controller.stop();
        p.shutdown();
    }

    #[test]
    fn test_stop_before_start() {
        let p = pipeline(&config(1)).unwrap();
        let controller = p.phy.controller();
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(controller.start(0).is_err());
        p.shutdown();
    }

    #[test]
    fn test_invalid_sampling_rate() {
        let mut config = config(1);
        config.srate = SamplingRate::from_mhz(3.8);
        assert!(matches!(pipeline(&config), Err(LayerError::InvalidConfiguration(_))));
    }
}
