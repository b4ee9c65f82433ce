//! FermWatch Hardware Abstraction Layer
//!
//! Everything that touches the outside world on the way in (hydrometers) and
//! on the way out (heater/cooler switches) lives here.
//!
//! # Modules
//!
//! - [`scanner`] - the scanner contract and the retrying scan loop
//! - [`tilt`] - iBeacon decoding and the live BLE scanner
//! - [`mock`] - simulated fermentation for running without hardware
//! - [`replay`] - replays a recorded `samples.jsonl` file
//! - [`relay`] - polls another FermWatch instance
//! - [`ingest`] - JSON payloads posted by iSpindel / GravityMon devices
//! - [`actuator`] - control surfaces (Home Assistant, dry run)
//! - [`clock`] - injectable wall clock
//! - [`retry`] - backoff policy shared by the scan loop
//!
//! # Example
//!
//! ```rust,no_run
//! use fermwatch_hal::{mock::MockScanner, scanner::run_scanner, retry::RetryPolicy, clock::SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scanner = MockScanner::new(vec!["tilt:red".into()], Arc::new(SystemClock));
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!
//!     tokio::spawn(run_scanner(Box::new(scanner), tx, RetryPolicy::default(), shutdown));
//!
//!     while let Some(sample) = rx.recv().await {
//!         println!("{}: {:.4} SG {:.1}°C", sample.device_id, sample.sg_raw, sample.temp_raw);
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod actuator;
pub mod clock;
pub mod ingest;
pub mod mock;
pub mod relay;
pub mod replay;
pub mod retry;
pub mod scanner;
pub mod tilt;

// Re-exports for convenience
pub use actuator::{ControlSurface, DryRunSurface, HomeAssistantSurface};
pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{Backoff, RetryPolicy};
pub use scanner::{run_scanner, ScanMode, Scanner};
pub use tilt::{TiltColor, TiltReading};

/// Boxed future returned by the object-safe async traits in this crate.
pub use futures::future::BoxFuture;

/// Hydrometer families, each with its own wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    /// BLE iBeacon hydrometer
    Tilt {
        color: TiltColor,
        /// Tilt Pro: SG x 10000 and temperature x 10
        high_resolution: bool,
    },
    /// Wi-Fi hydrometer posting JSON
    #[serde(rename = "ispindel")]
    ISpindel,
    /// GravityMon firmware (iSpindel-compatible JSON)
    #[serde(rename = "gravitymon")]
    GravityMon,
    /// Produced by the mock scanner
    Simulated,
}

/// One raw observation from a hydrometer.
///
/// `temp_raw` is always Celsius; adapters convert before emitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub device_id: String,
    pub kind: DeviceKind,
    pub sg_raw: f64,
    pub temp_raw: f64,
    pub signal_strength: i32,
    pub observed_at: DateTime<Utc>,
}

/// Convert Fahrenheit to Celsius
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// HAL Error types
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Scanner disconnected: {0}")]
    Disconnected(String),

    #[error("Timeout")]
    Timeout,
}

impl HalError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, HalError::InvalidConfig(_) | HalError::DeviceNotFound(_))
    }
}
