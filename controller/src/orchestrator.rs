//! One duty cycle, start to power-off.
//!
//! The ordering invariant: whatever happens mid-cycle, the camera is
//! stopped exactly once after it was started, newly calibrated values
//! are persisted, sensors and transport are closed, and the caller
//! always learns whether to drain-and-halt. Partial results still count;
//! a cycle that only managed a sensor reading still uploads it next
//! time it is online.

use chrono::{Local, Timelike};
use tracing::{info, warn};

use fieldstation_common::{
    AggregatedReading, CycleOutcome, ExecutionConfig, LinkMetrics, StationConfig,
};

use crate::calibration::CalibrationEngine;
use crate::camera::ImagingDevice;
use crate::connectivity::{ConnectivityOutcome, ConnectivityStateMachine, ProvisioningPortal};
use crate::eventlog::EventLog;
use crate::net::NetworkControl;
use crate::rtc::ClockSync;
use crate::sensors::{collect_samples, EnvironmentSensors};
use crate::store::ConfigStore;
use crate::uplink::{clean_upload_dir, pending_uploads, DeviceMetrics, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Completed(CycleOutcome),
    /// Provisioning timed out; skip the drain delay and halt promptly.
    ShutdownRequested,
}

pub struct DutyCycle<N, P, D, S, T, C> {
    pub net: N,
    pub portal: P,
    pub camera: D,
    pub sensors: S,
    pub transport: T,
    pub clock: C,
    pub store: ConfigStore,
    pub events: EventLog,
    pub upload_dir: std::path::PathBuf,
}

/// The imaging step only runs during configured daylight hours; night
/// cycles still record and upload sensor readings.
pub fn imaging_window_open(execution: &ExecutionConfig, hour: u8) -> bool {
    execution.contains_hour(hour)
}

impl<N, P, D, S, T, C> DutyCycle<N, P, D, S, T, C>
where
    N: NetworkControl + Sync,
    P: ProvisioningPortal + Sync,
    D: ImagingDevice + Send,
    S: EnvironmentSensors,
    T: Transport,
    C: ClockSync,
{
    pub async fn run(&mut self) -> anyhow::Result<CycleResult> {
        let hour = Local::now().hour() as u8;
        self.run_at(hour).await
    }

    pub async fn run_at(&mut self, hour: u8) -> anyhow::Result<CycleResult> {
        let result = self.run_cycle(hour).await;
        self.release_resources().await;
        result
    }

    async fn run_cycle(&mut self, hour: u8) -> anyhow::Result<CycleResult> {
        let mut outcome = CycleOutcome::default();
        let config = self.store.load().await?;

        let machine =
            ConnectivityStateMachine::new(&self.net, &self.portal, &self.store, &self.events);
        let mut metrics = match machine.acquire().await? {
            ConnectivityOutcome::Connected(metrics) => {
                outcome.connected = true;
                metrics
            }
            ConnectivityOutcome::Offline => None,
            ConnectivityOutcome::ShutdownRequested => return Ok(CycleResult::ShutdownRequested),
        };

        if outcome.connected && imaging_window_open(&config.execution, hour) {
            outcome.image_captured = self.imaging_step(&config).await;
        } else if outcome.connected {
            info!(hour, "outside imaging window, skipping capture");
        }

        // Metrics can have aged across calibration; refresh before they
        // go out in telemetry.
        if outcome.connected {
            metrics = self
                .net
                .query_link_metrics(config.device.mode.interface())
                .await
                .or(metrics);
        }

        let reading = self.sensing_step(&config).await;
        outcome.reading_recorded =
            reading.temperature.is_some() || reading.humidity.is_some() || reading.lux.is_some();

        if outcome.connected {
            outcome.uploaded = self.upload_step(&reading, metrics.as_ref()).await;
        }

        Ok(CycleResult::Completed(outcome))
    }

    /// Start, calibrate, shoot. The stop and the config write-back run
    /// unconditionally once the camera started, even when calibration or
    /// capture failed partway.
    async fn imaging_step(&mut self, config: &StationConfig) -> bool {
        if let Err(err) = self.camera.start().await {
            self.events
                .error("E21", &format!("camera start failed: {err:#}"));
            return false;
        }

        let mut camera_config = config.camera.clone();
        let engine = CalibrationEngine::new(&config.delays, &self.events);

        let mut captured = false;
        match engine.calibrate(&mut self.camera, &mut camera_config).await {
            Ok(()) => match engine.capture_image(&mut self.camera, &config.device.id).await {
                Ok(path) => {
                    self.events
                        .info("M20", &format!("image captured: {}", path.display()));
                    captured = true;
                }
                Err(err) => {
                    self.events
                        .error("E22", &format!("image capture failed: {err:#}"));
                }
            },
            Err(err) => {
                self.events
                    .error("E23", &format!("calibration failed: {err:#}"));
            }
        }

        let mut updated = config.clone();
        updated.camera = camera_config;
        if let Err(err) = self.store.save(&updated).await {
            warn!("failed to persist calibration values: {err:#}");
        }

        if let Err(err) = self.camera.stop().await {
            warn!("camera stop failed: {err:#}");
        }
        captured
    }

    async fn sensing_step(&mut self, config: &StationConfig) -> AggregatedReading {
        let samples = collect_samples(
            &mut self.sensors,
            config.delays.sensor_sample_count,
            std::time::Duration::from_millis(config.delays.sensor_sample_interval_ms),
        )
        .await;
        let reading = samples.aggregate();

        if !reading.climate_valid() {
            self.events
                .error("E20", "temperature or humidity channel produced no reading");
        }
        if !reading.lux_valid() {
            self.events.error("E20", "lux channel produced no reading");
        }

        reading
    }

    async fn upload_step(
        &mut self,
        reading: &AggregatedReading,
        metrics: Option<&LinkMetrics>,
    ) -> bool {
        let device = DeviceMetrics::gather().await;
        let mut uploaded = false;

        match self.transport.send_telemetry(reading, metrics, &device).await {
            Ok(()) => {
                self.events.info("M21", "telemetry sent");
                uploaded = true;
            }
            Err(err) => {
                self.events
                    .error("E24", &format!("telemetry send failed: {err:#}"));
            }
        }

        match pending_uploads(&self.upload_dir).await {
            Ok(pending) => {
                for path in pending {
                    match self.transport.send_file(&path).await {
                        Ok(_) => uploaded = true,
                        Err(err) => {
                            self.events.error(
                                "E25",
                                &format!("upload of {} failed: {err:#}", path.display()),
                            );
                        }
                    }
                }
            }
            Err(err) => {
                self.events
                    .error("E25", &format!("upload directory scan failed: {err:#}"));
            }
        }

        if uploaded {
            if let Err(err) = clean_upload_dir(&self.upload_dir).await {
                warn!("upload directory cleanup failed: {err:#}");
            }
        }
        uploaded
    }

    async fn release_resources(&mut self) {
        self.sensors.close();
        self.transport.close().await;
        if let Err(err) = self.clock.sync().await {
            warn!("rtc sync failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use fieldstation_common::{Frame, Region};

    use crate::connectivity::PortalOutcome;
    use crate::uplink::LOG_DIR_NAME;

    struct FakeNet {
        reachable: bool,
    }

    impl NetworkControl for FakeNet {
        async fn start_ap(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop_ap(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn join_network(&self, _ssid: &str, _password: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn restart_auto_connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn query_link_metrics(&self, interface: &str) -> Option<LinkMetrics> {
            Some(LinkMetrics::Wifi {
                interface: interface.to_string(),
                link_quality_percent: 80,
                signal_level_dbm: Some(-40),
            })
        }
        async fn probe_reachability(&self, _url: &str) -> bool {
            self.reachable
        }
    }

    struct FakePortal {
        outcome: PortalOutcome,
    }

    impl ProvisioningPortal for FakePortal {
        async fn run(&self) -> anyhow::Result<PortalOutcome> {
            Ok(self.outcome)
        }
    }

    struct FakeCamera {
        upload_dir: PathBuf,
        exposure_us: u32,
        starts: u32,
        stops: u32,
        fail_frames: bool,
    }

    impl FakeCamera {
        fn new(upload_dir: PathBuf) -> Self {
            Self {
                upload_dir,
                exposure_us: 0,
                starts: 0,
                stops: 0,
                fail_frames: false,
            }
        }
    }

    impl ImagingDevice for FakeCamera {
        fn resolution(&self) -> (u32, u32) {
            (64, 64)
        }
        async fn start(&mut self) -> anyhow::Result<()> {
            self.starts += 1;
            Ok(())
        }
        async fn stop(&mut self) -> anyhow::Result<()> {
            self.stops += 1;
            Ok(())
        }
        fn set_focus_window(&mut self, _window: Region) {}
        fn set_focus_position(&mut self, _lens_position: f32) {}
        fn set_white_balance_gains(&mut self, _red: f32, _blue: f32) {}
        fn set_exposure_controls(&mut self, exposure_us: u32, _gain: f32) {
            self.exposure_us = exposure_us;
        }
        async fn auto_focus(&mut self) -> anyhow::Result<f32> {
            Ok(4.25)
        }
        async fn enable_auto_white_balance(&mut self) -> anyhow::Result<(f32, f32)> {
            Ok((1.8, 1.4))
        }
        async fn capture_frame(&mut self) -> anyhow::Result<Frame> {
            if self.fail_frames {
                anyhow::bail!("sensor timeout");
            }
            let value = ((f64::from(self.exposure_us) * 0.0008).round() as u32).min(255) as u8;
            Ok(Frame::new(64, 64, vec![value; 64 * 64 * 3])?)
        }
        async fn save_image(&mut self, prefix: &str) -> anyhow::Result<PathBuf> {
            let path = self.upload_dir.join(format!("{prefix}.jpg"));
            tokio::fs::write(&path, b"jpeg").await?;
            Ok(path)
        }
    }

    struct FakeSensors {
        temperature: Option<f64>,
        closed: bool,
    }

    impl EnvironmentSensors for FakeSensors {
        fn read_temperature(&mut self) -> Option<f64> {
            self.temperature
        }
        fn read_humidity(&mut self) -> Option<f64> {
            Some(60.0)
        }
        fn read_lux(&mut self) -> Option<f64> {
            Some(12.5)
        }
        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        telemetry: AtomicUsize,
        files: Mutex<Vec<PathBuf>>,
        closed: AtomicBool,
    }

    impl Transport for FakeTransport {
        async fn send_telemetry(
            &self,
            _reading: &AggregatedReading,
            _link: Option<&LinkMetrics>,
            _device: &DeviceMetrics,
        ) -> anyhow::Result<()> {
            self.telemetry.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn send_file(&self, path: &Path) -> anyhow::Result<String> {
            self.files.lock().unwrap().push(path.to_path_buf());
            Ok("OK".to_string())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeClock {
        syncs: AtomicUsize,
    }

    impl ClockSync for FakeClock {
        async fn sync(&self) -> anyhow::Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        cycle: DutyCycle<FakeNet, FakePortal, FakeCamera, FakeSensors, FakeTransport, FakeClock>,
    }

    async fn fixture(reachable: bool, with_credentials: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        tokio::fs::create_dir_all(upload_dir.join(LOG_DIR_NAME)).await.unwrap();

        let store = ConfigStore::new(dir.path().join("station.json"));
        let mut config = StationConfig::default();
        config.delays.stabilize_secs = 0;
        config.delays.sensor_sample_interval_ms = 0;
        config.delays.sensor_sample_count = 4;
        config.delays.exposure_settle_ms = 0;
        config.delays.capture_warmup_frames = 1;
        config.delays.capture_warmup_interval_ms = 0;
        if with_credentials {
            config.network.ssid = "field-ap".to_string();
            config.network.password = "hunter2".to_string();
        }
        store.save(&config).await.unwrap();

        let events = EventLog::new(&upload_dir.join(LOG_DIR_NAME)).unwrap();
        let cycle = DutyCycle {
            net: FakeNet { reachable },
            portal: FakePortal {
                outcome: PortalOutcome::TimedOut,
            },
            camera: FakeCamera::new(upload_dir.clone()),
            sensors: FakeSensors {
                temperature: Some(20.1),
                closed: false,
            },
            transport: FakeTransport::default(),
            clock: FakeClock::default(),
            store,
            events,
            upload_dir,
        };
        Fixture { dir, cycle }
    }

    #[tokio::test]
    async fn full_cycle_captures_records_and_uploads() {
        let mut fixture = fixture(true, true).await;

        let result = fixture.cycle.run_at(12).await.unwrap();

        assert_eq!(
            result,
            CycleResult::Completed(CycleOutcome {
                connected: true,
                image_captured: true,
                reading_recorded: true,
                uploaded: true,
            })
        );
        assert_eq!(fixture.cycle.camera.starts, 1);
        assert_eq!(fixture.cycle.camera.stops, 1);
        assert_eq!(fixture.cycle.transport.telemetry.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.cycle.transport.files.lock().unwrap().len(), 1);

        // Upload dir cleaned, log dir preserved.
        assert!(!fixture.cycle.upload_dir.join("NODE1.jpg").exists());
        assert!(fixture.cycle.upload_dir.join(LOG_DIR_NAME).exists());

        // Measured calibration values were written back.
        let config = fixture.cycle.store.load().await.unwrap();
        assert_eq!(config.camera.focus_lens_position, Some(4.25));
        assert_eq!(config.camera.awb_gains(), Some((1.8, 1.4)));
    }

    #[tokio::test]
    async fn calibration_failure_still_persists_and_stops_camera_once() {
        let mut fixture = fixture(true, true).await;
        fixture.cycle.camera.fail_frames = true;

        let result = fixture.cycle.run_at(12).await.unwrap();

        let CycleResult::Completed(outcome) = result else {
            panic!("unexpected shutdown request");
        };
        assert!(!outcome.image_captured);
        assert!(outcome.reading_recorded);
        assert_eq!(fixture.cycle.camera.starts, 1);
        assert_eq!(fixture.cycle.camera.stops, 1);

        // Focus and white balance succeeded before the frame failure and
        // must survive the cycle.
        let config = fixture.cycle.store.load().await.unwrap();
        assert_eq!(config.camera.focus_lens_position, Some(4.25));
    }

    #[tokio::test]
    async fn night_cycle_skips_imaging_but_still_uploads() {
        let mut fixture = fixture(true, true).await;

        let result = fixture.cycle.run_at(2).await.unwrap();

        let CycleResult::Completed(outcome) = result else {
            panic!("unexpected shutdown request");
        };
        assert!(outcome.connected);
        assert!(!outcome.image_captured);
        assert!(outcome.reading_recorded);
        assert!(outcome.uploaded);
        assert_eq!(fixture.cycle.camera.starts, 0);
    }

    #[tokio::test]
    async fn missing_sensor_channel_does_not_abort() {
        let mut fixture = fixture(true, true).await;
        fixture.cycle.sensors.temperature = None;

        let result = fixture.cycle.run_at(12).await.unwrap();

        let CycleResult::Completed(outcome) = result else {
            panic!("unexpected shutdown request");
        };
        assert!(outcome.reading_recorded);

        let errors = std::fs::read_to_string(
            fixture.cycle.upload_dir.join(LOG_DIR_NAME).join("errors.log"),
        )
        .unwrap();
        assert!(errors.contains("[E20]"));
    }

    #[tokio::test]
    async fn provisioning_timeout_still_releases_resources() {
        let mut fixture = fixture(true, false).await;

        let result = fixture.cycle.run_at(12).await.unwrap();

        assert_eq!(result, CycleResult::ShutdownRequested);
        assert!(fixture.cycle.sensors.closed);
        assert!(fixture.cycle.transport.closed.load(Ordering::SeqCst));
        assert_eq!(fixture.cycle.clock.syncs.load(Ordering::SeqCst), 1);
        let _ = &fixture.dir;
    }
}
