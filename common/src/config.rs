use serde::{Deserialize, Serialize};

use crate::types::StationMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub mode: StationMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "NODE1".to_string(),
            mode: StationMode::Wifi,
        }
    }
}

/// Hours of the day (local time) during which the imaging step runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub hours: Vec<u8>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            hours: (6..=18).collect(),
        }
    }
}

impl ExecutionConfig {
    pub fn contains_hour(&self, hour: u8) -> bool {
        self.hours.contains(&hour)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    pub priority: bool,
    pub link_quality_threshold: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            priority: false,
            link_quality_threshold: 50,
        }
    }
}

impl NetworkConfig {
    /// Absence of either credential is a state of its own, not an error.
    pub fn has_credentials(&self) -> bool {
        !self.ssid.trim().is_empty() && !self.password.trim().is_empty()
    }
}

/// Calibration values measured once and reused until explicitly cleared
/// from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub focus_lens_position: Option<f32>,
    pub awb_gain_r: Option<f32>,
    pub awb_gain_b: Option<f32>,
    pub target_brightness: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            focus_lens_position: None,
            awb_gain_r: None,
            awb_gain_b: None,
            target_brightness: 128,
        }
    }
}

impl CameraConfig {
    pub fn awb_gains(&self) -> Option<(f32, f32)> {
        match (self.awb_gain_r, self.awb_gain_b) {
            (Some(r), Some(b)) => Some((r, b)),
            _ => None,
        }
    }
}

/// Every wait duration in one place, so a single orchestrator can serve
/// deployments that previously differed only in timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    pub startup_secs: u64,
    pub stabilize_secs: u64,
    pub provisioning_timeout_secs: u64,
    pub shutdown_drain_secs: u64,
    pub sensor_sample_count: usize,
    pub sensor_sample_interval_ms: u64,
    pub capture_warmup_frames: u32,
    pub capture_warmup_interval_ms: u64,
    pub exposure_settle_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            startup_secs: 10,
            stabilize_secs: 20,
            provisioning_timeout_secs: 240,
            shutdown_drain_secs: 180,
            sensor_sample_count: 10,
            sensor_sample_interval_ms: 100,
            capture_warmup_frames: 5,
            capture_warmup_interval_ms: 300,
            exposure_settle_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub delays: DelayConfig,
}

impl StationConfig {
    pub fn sanitize(&mut self) {
        self.network.link_quality_threshold = self.network.link_quality_threshold.min(100);

        self.execution.hours.retain(|hour| *hour < 24);
        self.execution.hours.sort_unstable();
        self.execution.hours.dedup();

        if self.delays.sensor_sample_count == 0 {
            self.delays.sensor_sample_count = 1;
        }
    }
}
