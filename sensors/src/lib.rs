//! FermWatch Sensor Fusion and Control Library
//!
//! Turns raw hydrometer samples into filtered, confidence-scored readings
//! and keeps linked batches inside their temperature band.

pub mod anomaly;
pub mod calibration;
pub mod control;
pub mod control_loop;
pub mod fusion;
pub mod hub;
pub mod kalman;
pub mod linker;
pub mod manager;
pub mod recording;
pub mod store;
pub mod trend;

use chrono::{DateTime, Utc};
use fermwatch_hal::HalError;
use serde::{Deserialize, Serialize};

pub use anomaly::AnomalyKind;
pub use calibration::{calibrate, CalibrationCurve, Channel, DeviceCalibration};
pub use fusion::{FusionConfig, FusionPipeline};
pub use manager::PipelineManager;
pub use store::ReadingStore;

/// A sample after calibration, in the units the fusion pipeline expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSample {
    pub device_id: String,
    pub sg: f64,
    pub temp_c: f64,
    pub signal_strength: i32,
    pub observed_at: DateTime<Utc>,
}

/// Health of the fusion path for one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingCondition {
    #[default]
    Nominal,
    /// The sample itself carried non-finite values
    InvalidInput,
    /// The filter diverged; values are unfiltered
    FilterFault,
    /// The trend fit failed; no completion estimate
    FitFault,
}

/// Filtered output of a device's fusion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedReading {
    pub device_id: String,
    pub sg_filtered: f64,
    pub temp_filtered_c: f64,
    /// 0 means the values are unfiltered and must not drive control
    pub confidence: f64,
    pub anomaly: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<AnomalyKind>,
    pub predicted_completion: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub condition: ReadingCondition,
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Batch directory error: {0}")]
    Directory(String),

    #[error("Recording error: {0}")]
    Recording(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;
