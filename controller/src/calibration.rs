//! Camera auto-calibration: focus, white balance, then exposure, each
//! skipped when a previously measured value is already on file. Focus
//! and white balance are fail-soft; a camera that cannot produce frames
//! at all aborts the imaging step instead.

use std::time::Duration;

use tracing::info;

use fieldstation_common::{
    focus_window, CameraConfig, DelayConfig, ExposureSearch, ExposureStep,
};

use crate::camera::ImagingDevice;
use crate::eventlog::EventLog;

/// Normalized bounds of the autofocus window, covering the center of
/// the scene and excluding sky and frame edges.
const FOCUS_WINDOW: (f64, f64, f64, f64) = (0.3, 0.3, 0.7, 0.7);

pub struct CalibrationEngine<'a> {
    delays: &'a DelayConfig,
    events: &'a EventLog,
}

impl<'a> CalibrationEngine<'a> {
    pub fn new(delays: &'a DelayConfig, events: &'a EventLog) -> Self {
        Self { delays, events }
    }

    /// Run all three calibration stages, writing newly measured values
    /// into `config` so the caller can persist them.
    pub async fn calibrate<D: ImagingDevice + Send>(
        &self,
        device: &mut D,
        config: &mut CameraConfig,
    ) -> anyhow::Result<()> {
        self.calibrate_focus(device, config).await;
        self.calibrate_white_balance(device, config).await;
        self.calibrate_exposure(device, config.target_brightness).await
    }

    /// A blurry image is still worth uploading, so focus failures only
    /// log.
    async fn calibrate_focus<D: ImagingDevice + Send>(
        &self,
        device: &mut D,
        config: &mut CameraConfig,
    ) {
        if let Some(position) = config.focus_lens_position {
            device.set_focus_position(position);
            info!(lens_position = position, "focus restored from config");
            return;
        }

        let (width, height) = device.resolution();
        let (x1, y1, x2, y2) = FOCUS_WINDOW;
        match focus_window(width, height, x1, y1, x2, y2) {
            Ok(window) => device.set_focus_window(window),
            Err(err) => {
                self.events
                    .error("E10", &format!("focus window rejected: {err}"));
                return;
            }
        }

        match device.auto_focus().await {
            Ok(position) => {
                config.focus_lens_position = Some(position);
                self.events
                    .info("M10", &format!("autofocus calibrated, lens position {position:.3}"));
            }
            Err(err) => {
                self.events
                    .error("E10", &format!("autofocus failed: {err:#}"));
            }
        }
    }

    async fn calibrate_white_balance<D: ImagingDevice + Send>(
        &self,
        device: &mut D,
        config: &mut CameraConfig,
    ) {
        if let Some((red, blue)) = config.awb_gains() {
            device.set_white_balance_gains(red, blue);
            info!(red, blue, "white balance restored from config");
            return;
        }

        match device.enable_auto_white_balance().await {
            Ok((red, blue)) => {
                config.awb_gain_r = Some(red);
                config.awb_gain_b = Some(blue);
                self.events.info(
                    "M11",
                    &format!("white balance calibrated, gains {red:.3}/{blue:.3}"),
                );
            }
            Err(err) => {
                self.events
                    .error("E11", &format!("auto white balance failed: {err:#}"));
            }
        }
    }

    /// Exposure is never persisted; light changes between cycles, so the
    /// search runs fresh each time.
    async fn calibrate_exposure<D: ImagingDevice + Send>(
        &self,
        device: &mut D,
        target_brightness: u8,
    ) -> anyhow::Result<()> {
        let mut search = ExposureSearch::new(target_brightness);
        let (exposure_us, gain) = search.initial_controls();
        device.set_exposure_controls(exposure_us, gain);

        loop {
            let frame = device.capture_frame().await?;
            let brightness = frame.gray_card_brightness();

            match search.step(brightness) {
                ExposureStep::Converged => {
                    self.events.info(
                        "M12",
                        &format!(
                            "exposure converged at brightness {brightness:.1} after {} iterations",
                            search.iterations()
                        ),
                    );
                    return Ok(());
                }
                ExposureStep::Apply { exposure_us, gain } => {
                    device.set_exposure_controls(exposure_us, gain);
                    tokio::time::sleep(Duration::from_millis(self.delays.exposure_settle_ms))
                        .await;
                }
                ExposureStep::AtBoundary => {
                    self.events.info(
                        "M13",
                        &format!("exposure clamp reached at brightness {brightness:.1}"),
                    );
                    return Ok(());
                }
                ExposureStep::IterationsExhausted => {
                    self.events.info(
                        "M14",
                        &format!(
                            "exposure search exhausted at brightness {brightness:.1}"
                        ),
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Warm the pipeline with throwaway frames, then take the real shot.
    pub async fn capture_image<D: ImagingDevice + Send>(
        &self,
        device: &mut D,
        prefix: &str,
    ) -> anyhow::Result<std::path::PathBuf> {
        for _ in 0..self.delays.capture_warmup_frames {
            device.capture_frame().await?;
            tokio::time::sleep(Duration::from_millis(self.delays.capture_warmup_interval_ms))
                .await;
        }
        device.save_image(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use fieldstation_common::{Frame, Region};

    /// Camera model whose brightness responds linearly to exposure time.
    struct FakeDevice {
        width: u32,
        height: u32,
        exposure_us: u32,
        autofocus_calls: u32,
        awb_calls: u32,
        focus_window: Option<Region>,
        lens_position: Option<f32>,
        awb_gains: Option<(f32, f32)>,
        saved: Vec<PathBuf>,
        fail_autofocus: bool,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self {
                width: 640,
                height: 480,
                exposure_us: 0,
                autofocus_calls: 0,
                awb_calls: 0,
                focus_window: None,
                lens_position: None,
                awb_gains: None,
                saved: Vec::new(),
                fail_autofocus: false,
            }
        }

        fn brightness(&self) -> u8 {
            ((f64::from(self.exposure_us) * 0.0008).round() as u32).min(255) as u8
        }
    }

    impl ImagingDevice for FakeDevice {
        fn resolution(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn set_focus_window(&mut self, window: Region) {
            self.focus_window = Some(window);
        }

        fn set_focus_position(&mut self, lens_position: f32) {
            self.lens_position = Some(lens_position);
        }

        fn set_white_balance_gains(&mut self, red: f32, blue: f32) {
            self.awb_gains = Some((red, blue));
        }

        fn set_exposure_controls(&mut self, exposure_us: u32, _gain: f32) {
            self.exposure_us = exposure_us;
        }

        async fn auto_focus(&mut self) -> anyhow::Result<f32> {
            self.autofocus_calls += 1;
            if self.fail_autofocus {
                anyhow::bail!("autofocus scan failed");
            }
            self.lens_position = Some(4.25);
            Ok(4.25)
        }

        async fn enable_auto_white_balance(&mut self) -> anyhow::Result<(f32, f32)> {
            self.awb_calls += 1;
            self.awb_gains = Some((1.8, 1.4));
            Ok((1.8, 1.4))
        }

        async fn capture_frame(&mut self) -> anyhow::Result<Frame> {
            let value = self.brightness();
            let data = vec![value; self.width as usize * self.height as usize * 3];
            Ok(Frame::new(self.width, self.height, data)?)
        }

        async fn save_image(&mut self, prefix: &str) -> anyhow::Result<PathBuf> {
            let path = PathBuf::from(format!("/tmp/{prefix}.jpg"));
            self.saved.push(path.clone());
            Ok(path)
        }
    }

    fn zero_delays() -> DelayConfig {
        DelayConfig {
            exposure_settle_ms: 0,
            capture_warmup_interval_ms: 0,
            capture_warmup_frames: 2,
            ..DelayConfig::default()
        }
    }

    fn events() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(&dir.path().join("LOG")).unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn full_calibration_measures_and_records_values() {
        let delays = zero_delays();
        let (_dir, log) = events();
        let engine = CalibrationEngine::new(&delays, &log);

        let mut device = FakeDevice::new();
        let mut config = CameraConfig::default();

        engine.calibrate(&mut device, &mut config).await.unwrap();

        assert_eq!(config.focus_lens_position, Some(4.25));
        assert_eq!(config.awb_gains(), Some((1.8, 1.4)));
        assert_eq!(device.autofocus_calls, 1);
        assert_eq!(device.awb_calls, 1);
        let brightness = f64::from(device.brightness());
        assert!((brightness - 128.0).abs() <= 5.0);
    }

    #[tokio::test]
    async fn saved_values_skip_hardware_calibration() {
        let delays = zero_delays();
        let (_dir, log) = events();
        let engine = CalibrationEngine::new(&delays, &log);

        let mut device = FakeDevice::new();
        let mut config = CameraConfig {
            focus_lens_position: Some(2.0),
            awb_gain_r: Some(1.9),
            awb_gain_b: Some(1.3),
            target_brightness: 128,
        };

        engine.calibrate(&mut device, &mut config).await.unwrap();

        assert_eq!(device.autofocus_calls, 0);
        assert_eq!(device.awb_calls, 0);
        assert_eq!(device.lens_position, Some(2.0));
        assert_eq!(device.awb_gains, Some((1.9, 1.3)));
    }

    #[tokio::test]
    async fn autofocus_failure_does_not_abort_calibration() {
        let delays = zero_delays();
        let (dir, log) = events();
        let engine = CalibrationEngine::new(&delays, &log);

        let mut device = FakeDevice::new();
        device.fail_autofocus = true;
        let mut config = CameraConfig::default();

        engine.calibrate(&mut device, &mut config).await.unwrap();

        assert_eq!(config.focus_lens_position, None);
        // White balance and exposure still ran.
        assert_eq!(device.awb_calls, 1);
        let errors = std::fs::read_to_string(dir.path().join("LOG").join("errors.log")).unwrap();
        assert!(errors.contains("[E10]"));
    }

    #[tokio::test]
    async fn capture_warms_up_before_saving() {
        let delays = zero_delays();
        let (_dir, log) = events();
        let engine = CalibrationEngine::new(&delays, &log);

        let mut device = FakeDevice::new();
        device.set_exposure_controls(160_000, 1.0);

        let path = engine.capture_image(&mut device, "NODE1").await.unwrap();
        assert_eq!(path, PathBuf::from("/tmp/NODE1.jpg"));
        assert_eq!(device.saved.len(), 1);
    }
}
