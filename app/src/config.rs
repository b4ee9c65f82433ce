// Application Configuration

use anyhow::{bail, Context, Result};
use fermwatch_hal::{RetryPolicy, ScanMode};
use fermwatch_sensors::control::ControllerConfig;
use fermwatch_sensors::linker::BatchRecord;
use fermwatch_sensors::{CalibrationCurve, DeviceCalibration, FusionConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Human-readable or JSON logs
    #[serde(default)]
    pub log_format: LogFormat,

    /// Batch records read from this file instead of `[[batches]]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batches_file: Option<PathBuf>,

    /// How often the batch directory is re-read (seconds)
    #[serde(default = "default_batch_refresh")]
    pub batch_refresh_secs: u64,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Backoff for scanner failures
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub control: ControllerConfig,

    /// Switches are only logged when this is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_assistant: Option<HomeAssistantConfig>,

    #[serde(default)]
    pub recording: RecordingConfig,

    /// Per-device calibration curves
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Inline batch records
    #[serde(default)]
    pub batches: Vec<BatchRecord>,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Queue depth per websocket client
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scan_mode")]
    pub mode: ScanMode,

    /// Advertisements weaker than this are ignored (dBm)
    #[serde(default = "default_rssi_floor")]
    pub rssi_floor: i32,

    /// Helper printing `<address> <rssi> <hex>` lines (live mode)
    #[serde(default = "default_scan_command")]
    pub scan_command: Vec<String>,

    /// Recorded `samples.jsonl` (replay mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_file: Option<PathBuf>,

    /// Replay and mock speed-up; 0 replays without pauses
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,

    /// Remote FermWatch base URL (relay mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Simulated devices (mock mode)
    #[serde(default = "default_mock_devices")]
    pub mock_devices: Vec<String>,

    /// Pause between simulated samples in milliseconds
    #[serde(default = "default_mock_interval")]
    pub mock_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    pub url: String,

    /// Long-lived access token; prefer `token_env` outside of testing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_ha_timeout")]
    pub timeout_secs: u64,
}

impl HomeAssistantConfig {
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }
        std::env::var(&self.token_env)
            .with_context(|| format!("Home Assistant token not set (expected ${})", self.token_env))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Record samples, readings and control events on launch
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_data_dir")]
    pub path: PathBuf,

    #[serde(default = "default_session")]
    pub session_name: String,
}

/// Calibration of one hydrometer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,

    /// (raw, actual) pairs
    #[serde(default, skip_serializing_if = "CalibrationCurve::is_identity")]
    pub gravity: CalibrationCurve,

    #[serde(default, skip_serializing_if = "CalibrationCurve::is_identity")]
    pub temperature: CalibrationCurve,
}

impl DeviceConfig {
    pub fn calibration(&self) -> DeviceCalibration {
        DeviceCalibration {
            gravity: self.gravity.clone(),
            temperature: self.temperature.clone(),
        }
    }
}

fn default_batch_refresh() -> u64 { 300 }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_hub_capacity() -> usize { 64 }
fn default_scan_mode() -> ScanMode { ScanMode::Mock }
fn default_rssi_floor() -> i32 { -100 }
fn default_scan_command() -> Vec<String> { vec!["fermwatch-blescan".to_string()] }
fn default_time_scale() -> f64 { 1.0 }
fn default_poll_interval() -> u64 { 30 }
fn default_mock_devices() -> Vec<String> { vec!["tilt:red".to_string()] }
fn default_mock_interval() -> u64 { 5_000 }
fn default_token_env() -> String { "FERMWATCH_HA_TOKEN".to_string() }
fn default_ha_timeout() -> u64 { 10 }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/fermwatch/sessions") }
fn default_session() -> String { "fermentation".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: default_scan_mode(),
            rssi_floor: default_rssi_floor(),
            scan_command: default_scan_command(),
            replay_file: None,
            time_scale: default_time_scale(),
            relay_url: None,
            poll_interval_secs: default_poll_interval(),
            mock_devices: default_mock_devices(),
            mock_interval_ms: default_mock_interval(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_data_dir(),
            session_name: default_session(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            batches_file: None,
            batch_refresh_secs: default_batch_refresh(),
            server: ServerConfig::default(),
            scanner: ScannerConfig::default(),
            retry: RetryPolicy::default(),
            fusion: FusionConfig::default(),
            control: ControllerConfig::default(),
            home_assistant: None,
            recording: RecordingConfig::default(),
            devices: Vec::new(),
            batches: Vec::new(),
            config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("/etc/fermwatch/config.toml"),
            dirs::config_dir()
                .map(|p| p.join("fermwatch/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from(path);
            }
        }

        // config_path stays empty so the caller can tell
        Ok(Self::default())
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks serde cannot express on its own
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                bail!("device {} is configured twice", device.id);
            }
        }

        match self.scanner.mode {
            ScanMode::Replay if self.scanner.replay_file.is_none() => {
                bail!("scanner.mode = \"replay\" needs scanner.replay_file")
            }
            ScanMode::Relay if self.scanner.relay_url.is_none() => {
                bail!("scanner.mode = \"relay\" needs scanner.relay_url")
            }
            ScanMode::Live if self.scanner.scan_command.is_empty() => {
                bail!("scanner.mode = \"live\" needs scanner.scan_command")
            }
            _ => {}
        }

        if self.batches_file.is_some() && !self.batches.is_empty() {
            bail!("use either batches_file or [[batches]], not both");
        }
        if self.server.hub_capacity == 0 {
            bail!("server.hub_capacity must be at least 1");
        }
        Ok(())
    }

    /// Calibration per device id; unknown devices use identity curves
    pub fn calibrations(&self) -> HashMap<String, DeviceCalibration> {
        self.devices
            .iter()
            .map(|d| (d.id.clone(), d.calibration()))
            .collect()
    }

    /// Generate example configuration
    pub fn example() -> String {
        let mut config = Self {
            home_assistant: Some(HomeAssistantConfig {
                url: "http://homeassistant.local:8123".to_string(),
                token: None,
                token_env: default_token_env(),
                timeout_secs: default_ha_timeout(),
            }),
            devices: Vec::new(),
            batches: vec![BatchRecord {
                id: "batch-042".to_string(),
                name: "Saison".to_string(),
                status: fermwatch_sensors::linker::BatchStatus::Fermenting,
                device_id: Some("tilt:red".to_string()),
                target_temp_c: Some(20.0),
                target_sg: Some(1.006),
                hysteresis_c: None,
                heater_entity: Some("switch.fermenter_heat_mat".to_string()),
                cooler_entity: Some("switch.fermenter_fridge".to_string()),
            }],
            ..Default::default()
        };
        config.recording.enabled = true;

        if let (Ok(gravity), Ok(temperature)) = (
            CalibrationCurve::new(vec![(1.000, 1.000), (1.050, 1.048)]),
            CalibrationCurve::new(vec![(20.0, 19.6)]),
        ) {
            config.devices.push(DeviceConfig {
                id: "tilt:red".to_string(),
                gravity,
                temperature,
            });
        }

        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.scanner.mode, ScanMode::Mock);
        assert_eq!(config.control.min_cycle_secs, 300);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert!(config.home_assistant.is_none());
    }

    #[test]
    fn example_parses_back() {
        let config = AppConfig::parse(&AppConfig::example()).unwrap();
        assert_eq!(config.batches.len(), 1);
        assert_eq!(config.batches[0].target_temp_c, Some(20.0));
        let calibration = &config.calibrations()["tilt:red"];
        assert!((calibration.gravity.apply(1.025) - 1.024).abs() < 1e-12);
    }

    #[test]
    fn bad_curve_is_rejected_at_load() {
        let doc = r#"
            [[devices]]
            id = "tilt:red"
            gravity = [[1.0, 1.0], [1.0, 1.01]]
        "#;
        assert!(AppConfig::parse(doc).is_err());
    }

    #[test]
    fn scanner_mode_needs_its_source() {
        assert!(AppConfig::parse("[scanner]\nmode = \"replay\"").is_err());
        assert!(AppConfig::parse("[scanner]\nmode = \"relay\"").is_err());
        let ok = AppConfig::parse("[scanner]\nmode = \"relay\"\nrelay_url = \"http://cellar:8080\"").unwrap();
        assert_eq!(ok.scanner.relay_url.as_deref(), Some("http://cellar:8080"));
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let doc = "[[devices]]\nid = \"tilt:red\"\n[[devices]]\nid = \"tilt:red\"\n";
        assert!(AppConfig::parse(doc).is_err());
    }

    #[test]
    fn inline_token_wins_over_environment() {
        let ha = HomeAssistantConfig {
            url: "http://ha".into(),
            token: Some("abc".into()),
            token_env: "FERMWATCH_TEST_UNSET_TOKEN".into(),
            timeout_secs: 5,
        };
        assert_eq!(ha.resolve_token().unwrap(), "abc");
        let missing = HomeAssistantConfig { token: None, ..ha };
        assert!(missing.resolve_token().is_err());
    }
}
