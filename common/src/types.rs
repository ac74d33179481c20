use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StationMode {
    Wifi,
    Wired,
}

impl StationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wifi => "WIFI",
            Self::Wired => "WIRED",
        }
    }

    /// Interface the station reads link metrics from in this mode.
    pub fn interface(self) -> &'static str {
        match self {
            Self::Wifi => "wlan0",
            Self::Wired => "eth0",
        }
    }
}

/// Snapshot of the active link. Recomputed on every query, never cached
/// across cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkMetrics {
    Wifi {
        interface: String,
        #[serde(rename = "linkQualityPercent")]
        link_quality_percent: u8,
        #[serde(rename = "signalLevelDbm")]
        signal_level_dbm: Option<i32>,
    },
    Wired {
        interface: String,
        #[serde(rename = "linkDetected")]
        link_detected: bool,
        #[serde(rename = "speedMbps")]
        speed_mbps: Option<u32>,
    },
}

impl LinkMetrics {
    pub fn interface(&self) -> &str {
        match self {
            Self::Wifi { interface, .. } | Self::Wired { interface, .. } => interface,
        }
    }

    pub fn wifi_quality(&self) -> Option<u8> {
        match self {
            Self::Wifi {
                link_quality_percent,
                ..
            } => Some(*link_quality_percent),
            Self::Wired { .. } => None,
        }
    }

    /// (link quality, signal level) pair for the telemetry datagram.
    /// Fields that do not apply report 0, matching the wire format.
    pub fn telemetry_fields(&self) -> (u8, i32) {
        match self {
            Self::Wifi {
                link_quality_percent,
                signal_level_dbm,
                ..
            } => (*link_quality_percent, signal_level_dbm.unwrap_or(0)),
            Self::Wired { link_detected, .. } => (u8::from(*link_detected) * 100, 0),
        }
    }
}

/// Robust means of one sample window. `None` means the channel produced
/// no valid reading this cycle; the telemetry layer encodes it as 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregatedReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub lux: Option<f64>,
}

impl AggregatedReading {
    pub fn climate_valid(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some()
    }

    pub fn lux_valid(&self) -> bool {
        self.lux.is_some()
    }
}

/// Transient per-cycle record; only consulted for shutdown timing and
/// log codes, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub connected: bool,
    pub image_captured: bool,
    pub reading_recorded: bool,
    pub uploaded: bool,
}
