//! Wiring: config file to running orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use log::info;

use crate::dispatch::adapters::fleet::http::HttpFleetApi;
use crate::dispatch::adapters::modbus::modbus_tcp::ModbusTcpGateway;
use crate::dispatch::adapters::plc::mc_client::McClient;
use crate::dispatch::adapters::storage;
use crate::dispatch::adapters::store::RackStore;
use crate::dispatch::adapters::ui::UiPorts;
use crate::dispatch::core::config::DispatchConfigV1;

use super::orchestrator::{MissionOrchestrator, OrchestratorDeps, PollLoopHandle};
use super::policy::PlcRetryPolicy;

/// Loads `dispatch.v1.json`, writing the defaults first when it is missing.
pub fn load_or_init_config(base_dir: &Path) -> anyhow::Result<DispatchConfigV1> {
    if let Some(config) = storage::load_config(base_dir)
        .with_context(|| format!("load config from {}", base_dir.display()))?
    {
        return Ok(config);
    }
    let config = DispatchConfigV1::default();
    storage::save_config(base_dir, &config)
        .with_context(|| format!("write default config to {}", base_dir.display()))?;
    info!("[agv][boot] default config written to {}", base_dir.display());
    Ok(config)
}

/// Builds the orchestrator over the network adapters named in `config`.
/// The rack store and the UI are supplied by the host application.
pub fn build_orchestrator(
    config: &DispatchConfigV1,
    store: Arc<dyn RackStore>,
    ui: UiPorts,
) -> anyhow::Result<Arc<MissionOrchestrator>> {
    let fleet = HttpFleetApi::new(&config.fleet)
        .with_context(|| format!("build fleet client for {}", config.fleet.base_url))?;
    let deps = OrchestratorDeps {
        fleet: Arc::new(fleet),
        plc: Arc::new(McClient::new(config.plc.clone())),
        gateway: Arc::new(ModbusTcpGateway::new(config.modbus.clone())),
        store,
        ui,
    };
    let orchestrator = MissionOrchestrator::new(deps, config.orchestrator.clone())
        .with_plc_retry(PlcRetryPolicy::from_config(&config.plc));
    Ok(Arc::new(orchestrator))
}

pub struct Dispatcher {
    pub orchestrator: Arc<MissionOrchestrator>,
    base_dir: PathBuf,
    poll_loop: PollLoopHandle,
}

impl Dispatcher {
    /// Loads config from `base_dir`, wires the adapters and starts polling.
    pub fn start(
        base_dir: impl Into<PathBuf>,
        store: Arc<dyn RackStore>,
        ui: UiPorts,
    ) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        let config = load_or_init_config(&base_dir)?;
        let orchestrator = build_orchestrator(&config, store, ui)?;
        let poll_loop = orchestrator.spawn_poll_loop();
        info!(
            "[agv][boot] started plc={}:{} fleet={} poll={}ms",
            config.plc.host,
            config.plc.port,
            config.fleet.base_url,
            config.orchestrator.poll_interval_ms
        );
        Ok(Self {
            orchestrator,
            base_dir,
            poll_loop,
        })
    }

    /// Stops polling and writes the last snapshots for diagnostics.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if !self.poll_loop.stop().await {
            log::warn!("[agv][boot] poll loop did not stop within 1s");
        }
        let snapshots = self.orchestrator.snapshots();
        storage::save_snapshots(&self.base_dir, &snapshots)
            .with_context(|| format!("write snapshots to {}", self.base_dir.display()))?;
        info!("[agv][boot] stopped, {} snapshot(s) saved", snapshots.len());
        Ok(())
    }
}
