//! Payloads posted by Wi-Fi hydrometers (iSpindel, GravityMon).

use crate::{fahrenheit_to_celsius, DeviceKind, HalError, RawSample};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// JSON body as sent by iSpindel-compatible firmware.
///
/// Only the fields FermWatch uses are declared; the rest are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpPayload {
    /// Explicit id, preferred when present
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "ID")]
    pub chip_id: Option<serde_json::Value>,
    pub gravity: f64,
    pub temperature: f64,
    #[serde(default)]
    pub temp_units: Option<String>,
    #[serde(default, rename = "RSSI")]
    pub rssi: Option<i32>,
    /// GravityMon adds its own token field
    #[serde(default)]
    pub token: Option<String>,
}

impl HttpPayload {
    fn kind(&self) -> DeviceKind {
        match self.token.as_deref() {
            Some(t) if t.to_ascii_lowercase().contains("gravitymon") => DeviceKind::GravityMon,
            _ => DeviceKind::ISpindel,
        }
    }

    fn identity(&self) -> Option<String> {
        if let Some(id) = self.device_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(id.trim().to_string());
        }
        if let Some(name) = self.name.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(format!("ispindel:{}", name.trim()));
        }
        match &self.chip_id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(format!("ispindel:{}", s)),
            Some(serde_json::Value::Number(n)) => Some(format!("ispindel:{}", n)),
            _ => None,
        }
    }

    /// Convert into a sample observed at `received_at`.
    pub fn into_sample(self, received_at: DateTime<Utc>) -> Result<RawSample, HalError> {
        let device_id = self
            .identity()
            .ok_or_else(|| HalError::MalformedPayload("payload has no device identifier".to_string()))?;

        if !self.gravity.is_finite() || !self.temperature.is_finite() {
            return Err(HalError::MalformedPayload(format!("non-finite values from {}", device_id)));
        }

        let temp_c = match self.temp_units.as_deref() {
            None | Some("C") | Some("c") => self.temperature,
            Some("F") | Some("f") => fahrenheit_to_celsius(self.temperature),
            Some(other) => {
                return Err(HalError::MalformedPayload(format!("unsupported temp_units {}", other)))
            }
        };

        Ok(RawSample {
            kind: self.kind(),
            device_id,
            sg_raw: self.gravity,
            temp_raw: temp_c,
            signal_strength: self.rssi.unwrap_or(0),
            observed_at: received_at,
        })
    }
}

/// Parse a posted JSON body into a sample.
pub fn parse_http_payload(body: &[u8], received_at: DateTime<Utc>) -> Result<RawSample, HalError> {
    let payload: HttpPayload = serde_json::from_slice(body)?;
    payload.into_sample(received_at)
}
