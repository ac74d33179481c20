mod calibration;
mod camera;
mod connectivity;
mod eventlog;
mod net;
mod orchestrator;
mod portal;
mod power;
mod rtc;
mod sensors;
mod store;
mod uplink;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use fieldstation_common::StationConfig;

use crate::camera::RpicamStill;
use crate::eventlog::EventLog;
use crate::net::NetworkManagerControl;
use crate::orchestrator::{CycleResult, DutyCycle};
use crate::portal::ProvisioningServer;
use crate::power::{HostPower, SystemPower};
use crate::rtc::RtcLink;
use crate::sensors::I2cSensors;
use crate::store::ConfigStore;
use crate::uplink::{DataUploader, LOG_DIR_NAME};

/// Everything that can fail lives in here; `main` itself has exactly
/// one exit, through the power-off tail.
async fn run_station(
    store: ConfigStore,
    config: &StationConfig,
    upload_dir: &Path,
) -> anyhow::Result<CycleResult> {
    let telemetry_addr =
        std::env::var("STATION_TELEMETRY_ADDR").unwrap_or_else(|_| "150.89.233.1:9090".to_string());
    let upload_base_url = std::env::var("STATION_UPLOAD_URL")
        .unwrap_or_else(|_| "http://150.89.233.1".to_string());

    let events = EventLog::new(&upload_dir.join(LOG_DIR_NAME))?;
    events.info("M90", "station starting");

    // Let the supply rails and peripherals settle after cold power-on.
    tokio::time::sleep(Duration::from_secs(config.delays.startup_secs)).await;

    let mut cycle = DutyCycle {
        net: NetworkManagerControl::new()?,
        portal: ProvisioningServer::new(
            store.clone(),
            Duration::from_secs(config.delays.provisioning_timeout_secs),
        ),
        camera: RpicamStill::new(upload_dir.to_path_buf()),
        sensors: I2cSensors::new(),
        transport: DataUploader::new(config.device.id.clone(), telemetry_addr, upload_base_url)?,
        clock: RtcLink::new(events.clone()),
        store,
        events: events.clone(),
        upload_dir: upload_dir.to_path_buf(),
    };

    let result = cycle.run().await;
    match &result {
        Ok(CycleResult::Completed(outcome)) => {
            info!(?outcome, "cycle complete");
            events.info("M91", "cycle complete, draining before power off");
        }
        Ok(CycleResult::ShutdownRequested) => {
            events.info("M92", "shutdown requested, powering off");
        }
        Err(err) => {
            events.error("E90", &format!("cycle failed: {err:#}"));
        }
    }
    result
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("STATION_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/home/pi/station"));
    let upload_dir = data_dir.join("uploads");

    let store = ConfigStore::new(data_dir.join("station.json"));
    let config = match store.load().await {
        Ok(config) => config,
        Err(err) => {
            warn!("config load failed, using defaults: {err:#}");
            StationConfig::default()
        }
    };

    let drain = match run_station(store, &config, &upload_dir).await {
        Ok(CycleResult::Completed(_)) => true,
        Ok(CycleResult::ShutdownRequested) => false,
        Err(err) => {
            warn!("station run failed: {err:#}");
            true
        }
    };

    // The drain window gives an operator a chance to SSH in and stop the
    // service before the halt lands.
    if drain {
        tokio::time::sleep(Duration::from_secs(config.delays.shutdown_drain_secs)).await;
    }

    if let Err(err) = SystemPower.power_off().await {
        warn!("power off failed: {err:#}");
    }
}
