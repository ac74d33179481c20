//! Telemetry datagrams and image upload.
//!
//! Readings go out as three colon-delimited UDP datagrams (one per
//! channel) to the collection server; images go up over HTTP multipart.
//! The wire format predates this station and is shared with other field
//! hardware, so field order and the 0-for-missing encoding are fixed.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::Local;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, info, warn};

use fieldstation_common::{AggregatedReading, LinkMetrics};

/// Subdirectory of the upload directory that survives cleanup.
pub const LOG_DIR_NAME: &str = "LOG";

const PACKET_SPACING: Duration = Duration::from_millis(200);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub trait Transport {
    fn send_telemetry(
        &self,
        reading: &AggregatedReading,
        link: Option<&LinkMetrics>,
        device: &DeviceMetrics,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn send_file(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = anyhow::Result<String>> + Send;
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Host health fields carried in every telemetry datagram.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetrics {
    pub cpu_temp_c: Option<f64>,
    pub disk_available: Option<String>,
}

impl DeviceMetrics {
    pub async fn gather() -> Self {
        Self {
            cpu_temp_c: read_cpu_temperature().await,
            disk_available: read_disk_available().await,
        }
    }
}

async fn read_cpu_temperature() -> Option<f64> {
    let raw = tokio::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")
        .await
        .ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

async fn read_disk_available() -> Option<String> {
    let output = Command::new("df").args(["-h", "/"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df_available(&String::from_utf8_lossy(&output.stdout))
}

/// Available-space column of `df -h /`, e.g. `13G`. The datagram
/// carries available space, not used percent; receivers expect it.
fn parse_df_available(output: &str) -> Option<String> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(3)
        .map(str::to_string)
}

pub struct DataUploader {
    device_id: String,
    telemetry_addr: String,
    upload_base_url: String,
    http: reqwest::Client,
}

impl DataUploader {
    pub fn new(
        device_id: String,
        telemetry_addr: String,
        upload_base_url: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("failed to build upload client")?;
        Ok(Self {
            device_id,
            telemetry_addr,
            upload_base_url,
            http,
        })
    }
}

impl Transport for DataUploader {
    async fn send_telemetry(
        &self,
        reading: &AggregatedReading,
        link: Option<&LinkMetrics>,
        device: &DeviceMetrics,
    ) -> anyhow::Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H-%M-%S").to_string();
        let packets = format_telemetry_packets(&self.device_id, &timestamp, reading, link, device);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind telemetry socket")?;

        for packet in &packets {
            socket
                .send_to(packet.as_bytes(), &self.telemetry_addr)
                .await
                .with_context(|| format!("telemetry send to {} failed", self.telemetry_addr))?;
            debug!("telemetry sent: {packet}");
            tokio::time::sleep(PACKET_SPACING).await;
        }
        Ok(())
    }

    async fn send_file(&self, path: &Path) -> anyhow::Result<String> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("upload path has no file name")?
            .to_string();
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let part = reqwest::multipart::Part::bytes(body).file_name(file_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!(
            "{}/ipm_web/PEST_IMAGES/RX_IMG.php?node=1&location={}_GH_1",
            self.upload_base_url, self.device_id
        );
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("image upload request failed")?
            .error_for_status()
            .context("image upload rejected by server")?;

        let reply = response.text().await.unwrap_or_default();
        info!(file = %file_name, "image uploaded");
        Ok(reply)
    }

    async fn close(&self) {
        // Sockets are per-send and the HTTP client pools close on drop.
    }
}

/// One datagram per channel, T then H then L. Missing readings encode
/// as 0 on the wire, a sentinel older receivers expect.
pub fn format_telemetry_packets(
    device_id: &str,
    timestamp: &str,
    reading: &AggregatedReading,
    link: Option<&LinkMetrics>,
    device: &DeviceMetrics,
) -> Vec<String> {
    let (quality, signal) = link.map(LinkMetrics::telemetry_fields).unwrap_or((0, 0));
    let cpu = device
        .cpu_temp_c
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "0".to_string());
    let disk = device.disk_available.as_deref().unwrap_or("0");

    [
        ("T", reading.temperature),
        ("H", reading.humidity),
        ("L", reading.lux),
    ]
    .into_iter()
    .map(|(channel, value)| {
        format!(
            "PD:ENVI:{timestamp}:1:{channel}:{}:{device_id}_GH:0:{quality}:{signal}:{cpu}:{disk}:",
            value.unwrap_or(0.0)
        )
    })
    .collect()
}

/// Files waiting for upload, excluding the log directory.
pub async fn pending_uploads(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut pending = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_name() == LOG_DIR_NAME {
            continue;
        }
        if entry.file_type().await?.is_file() {
            pending.push(path);
        }
    }
    pending.sort();
    Ok(pending)
}

/// Remove everything from the upload directory except the log
/// directory. Failures on individual entries are logged and skipped so
/// one stuck file cannot block shutdown.
pub async fn clean_upload_dir(dir: &Path) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == LOG_DIR_NAME {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(err) = result {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
    Ok(())
}
