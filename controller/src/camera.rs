//! Imaging hardware abstraction and the rpicam-still adapter.
//!
//! The adapter shells out for every capture rather than holding the
//! camera open: the station takes a handful of frames per cycle and a
//! fresh process per frame means a wedged capture can never leak the
//! camera across cycles.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use tokio::process::Command;
use tracing::{debug, info};

use fieldstation_common::{Frame, Region};

pub const SENSOR_WIDTH: u32 = 4608;
pub const SENSOR_HEIGHT: u32 = 2592;

const JPEG_QUALITY: u32 = 90;

pub trait ImagingDevice {
    fn resolution(&self) -> (u32, u32);

    fn start(&mut self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn stop(&mut self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    fn set_focus_window(&mut self, window: Region);
    fn set_focus_position(&mut self, lens_position: f32);
    fn set_white_balance_gains(&mut self, red: f32, blue: f32);
    fn set_exposure_controls(&mut self, exposure_us: u32, gain: f32);

    /// One-shot autofocus scan; returns the lens position it settled on.
    fn auto_focus(&mut self) -> impl std::future::Future<Output = anyhow::Result<f32>> + Send;
    /// One frame under hardware AWB; returns the (red, blue) gains the
    /// algorithm chose so they can be pinned for later captures.
    fn enable_auto_white_balance(
        &mut self,
    ) -> impl std::future::Future<Output = anyhow::Result<(f32, f32)>> + Send;

    fn capture_frame(&mut self) -> impl std::future::Future<Output = anyhow::Result<Frame>> + Send;
    /// Full-quality capture under the current controls, written into the
    /// upload directory with a timestamped name.
    fn save_image(
        &mut self,
        prefix: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<PathBuf>> + Send;
}

/// Controls pinned between captures. `None` means leave the hardware
/// algorithm in charge for that control.
#[derive(Debug, Clone, Copy, Default)]
struct PinnedControls {
    focus_window: Option<Region>,
    lens_position: Option<f32>,
    awb_gains: Option<(f32, f32)>,
    exposure: Option<(u32, f32)>,
}

pub struct RpicamStill {
    upload_dir: PathBuf,
    scratch_dir: PathBuf,
    controls: PinnedControls,
    started: bool,
}

impl RpicamStill {
    pub fn new(upload_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            scratch_dir: std::env::temp_dir(),
            controls: PinnedControls::default(),
            started: false,
        }
    }

    fn control_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some((exposure_us, gain)) = self.controls.exposure {
            args.push("--shutter".to_string());
            args.push(exposure_us.to_string());
            args.push("--gain".to_string());
            args.push(format!("{gain:.2}"));
        }
        if let Some((red, blue)) = self.controls.awb_gains {
            args.push("--awbgains".to_string());
            args.push(format!("{red:.3},{blue:.3}"));
        }
        if let Some(position) = self.controls.lens_position {
            args.push("--autofocus-mode".to_string());
            args.push("manual".to_string());
            args.push("--lens-position".to_string());
            args.push(format!("{position:.3}"));
        }
        args
    }

    async fn capture(&self, extra: &[String], output: &Path) -> anyhow::Result<String> {
        let mut command = Command::new("rpicam-still");
        command
            .arg("--nopreview")
            .arg("--immediate")
            .arg("--width")
            .arg(SENSOR_WIDTH.to_string())
            .arg("--height")
            .arg(SENSOR_HEIGHT.to_string())
            .args(extra)
            .arg("-o")
            .arg(output);

        debug!("rpicam-still {extra:?} -> {}", output.display());
        let result = command
            .output()
            .await
            .context("failed to spawn rpicam-still")?;
        if !result.status.success() {
            anyhow::bail!(
                "rpicam-still exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&result.stdout).into_owned())
    }

    /// Capture with metadata output and pull one numeric value out of
    /// the metadata JSON.
    async fn capture_metadata(&self, extra: &[String]) -> anyhow::Result<serde_json::Value> {
        let metadata_path = self.scratch_dir.join("capture-metadata.json");
        let image_path = self.scratch_dir.join("metadata-probe.jpg");

        let mut args = extra.to_vec();
        args.push("--metadata".to_string());
        args.push(metadata_path.to_string_lossy().into_owned());
        args.push("--metadata-format".to_string());
        args.push("json".to_string());

        self.capture(&args, &image_path).await?;

        let raw = tokio::fs::read(&metadata_path)
            .await
            .context("failed to read capture metadata")?;
        serde_json::from_slice(&raw).context("capture metadata is not valid JSON")
    }
}

impl ImagingDevice for RpicamStill {
    fn resolution(&self) -> (u32, u32) {
        (SENSOR_WIDTH, SENSOR_HEIGHT)
    }

    /// Verifies the capture stack is present. The camera itself is only
    /// opened per capture.
    async fn start(&mut self) -> anyhow::Result<()> {
        let result = Command::new("rpicam-still")
            .arg("--version")
            .output()
            .await
            .context("rpicam-still is not installed")?;
        if !result.status.success() {
            anyhow::bail!("rpicam-still --version failed");
        }
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }

    fn set_focus_window(&mut self, window: Region) {
        self.controls.focus_window = Some(window);
    }

    fn set_focus_position(&mut self, lens_position: f32) {
        self.controls.lens_position = Some(lens_position);
    }

    fn set_white_balance_gains(&mut self, red: f32, blue: f32) {
        self.controls.awb_gains = Some((red, blue));
    }

    fn set_exposure_controls(&mut self, exposure_us: u32, gain: f32) {
        self.controls.exposure = Some((exposure_us, gain));
    }

    async fn auto_focus(&mut self) -> anyhow::Result<f32> {
        let mut args = vec!["--autofocus-on-capture".to_string()];
        if let Some(window) = self.controls.focus_window {
            let (width, height) = self.resolution();
            args.push("--autofocus-window".to_string());
            args.push(format!(
                "{:.3},{:.3},{:.3},{:.3}",
                f64::from(window.x) / f64::from(width),
                f64::from(window.y) / f64::from(height),
                f64::from(window.width) / f64::from(width),
                f64::from(window.height) / f64::from(height),
            ));
        }

        let metadata = self.capture_metadata(&args).await?;
        let position = metadata
            .get("LensPosition")
            .and_then(serde_json::Value::as_f64)
            .context("autofocus metadata missing LensPosition")? as f32;

        self.controls.lens_position = Some(position);
        info!(lens_position = position, "autofocus settled");
        Ok(position)
    }

    async fn enable_auto_white_balance(&mut self) -> anyhow::Result<(f32, f32)> {
        let args = vec!["--awb".to_string(), "auto".to_string()];
        let metadata = self.capture_metadata(&args).await?;

        let gains = metadata
            .get("ColourGains")
            .and_then(serde_json::Value::as_array)
            .context("awb metadata missing ColourGains")?;
        let red = gains
            .first()
            .and_then(serde_json::Value::as_f64)
            .context("ColourGains missing red gain")? as f32;
        let blue = gains
            .get(1)
            .and_then(serde_json::Value::as_f64)
            .context("ColourGains missing blue gain")? as f32;

        self.controls.awb_gains = Some((red, blue));
        info!(red, blue, "auto white balance gains measured");
        Ok((red, blue))
    }

    async fn capture_frame(&mut self) -> anyhow::Result<Frame> {
        let raw_path = self.scratch_dir.join("calibration-frame.rgb");
        let mut args = self.control_args();
        args.push("--encoding".to_string());
        args.push("rgb".to_string());

        self.capture(&args, &raw_path).await?;

        let data = tokio::fs::read(&raw_path)
            .await
            .context("failed to read raw frame")?;
        Frame::new(SENSOR_WIDTH, SENSOR_HEIGHT, data).map_err(Into::into)
    }

    async fn save_image(&mut self, prefix: &str) -> anyhow::Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.upload_dir.join(format!("{prefix}_{stamp}.jpg"));

        let mut args = self.control_args();
        args.push("-q".to_string());
        args.push(JPEG_QUALITY.to_string());

        self.capture(&args, &path).await?;
        info!("image saved to {}", path.display());
        Ok(path)
    }
}
