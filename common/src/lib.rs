pub mod aggregate;
pub mod config;
pub mod exposure;
pub mod frame;
pub mod types;

pub use aggregate::{filter_outliers, robust_mean, SensorSampleSet};
pub use config::{
    CameraConfig, DelayConfig, DeviceConfig, ExecutionConfig, NetworkConfig, StationConfig,
};
pub use exposure::{ExposureSearch, ExposureStep};
pub use frame::{focus_window, gray_card_region, Frame, Region};
pub use types::{AggregatedReading, CycleOutcome, LinkMetrics, StationMode};
