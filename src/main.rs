use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use env_logger::Env;
use log::info;

use cubicle_monitor::{
    control::ActuatorOutput,
    persistence::{RemoteStore, SqliteRemote},
    sampling::{SimulatedOccupancy, SimulatedTransport},
    Backends, CoreController, MonitorConfig,
};

/// Relay output that only logs the level change. Stands in for the GPIO
/// expander on a bench run; the appliance build swaps in the real driver.
struct LoggingOutput {
    name: &'static str,
}

impl ActuatorOutput for LoggingOutput {
    fn set_active(&self, active: bool) -> Result<()> {
        info!("{} -> {}", self.name, if active { "ON" } else { "OFF" });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config_path = std::env::var("CUBICLE_MONITOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("cubicle-monitor.json"));
    let config = MonitorConfig::load(&config_path)?;

    let remote: Option<Arc<dyn RemoteStore>> = match &config.remote_db_path {
        Some(path) => Some(Arc::new(SqliteRemote::open(path.clone())?)),
        None => None,
    };

    let backends = Backends {
        transport: Arc::new(SimulatedTransport::new(config.valid_min, config.valid_max)),
        occupancy: Arc::new(SimulatedOccupancy::new()),
        fan: Arc::new(LoggingOutput { name: "fan" }),
        freshener: Arc::new(LoggingOutput { name: "freshener" }),
        remote,
    };

    let controller = CoreController::start(config, backends).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    controller.stop().await;

    Ok(())
}
