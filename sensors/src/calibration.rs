//! Calibration curves
//!
//! Hydrometers drift; users record pairs of (what the device said, what a
//! reference instrument said) and readings are corrected by interpolating
//! between those pairs.

use crate::{CalibratedSample, Result, SensorError};
use fermwatch_hal::RawSample;
use serde::{Deserialize, Serialize};

/// Which quantity a curve corrects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Gravity,
    Temperature,
}

/// Validated reference points, sorted by raw value.
///
/// Construction is the only place a curve can be rejected; applying one
/// never fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CalibrationCurve {
    points: Vec<(f64, f64)>,
}

impl CalibrationCurve {
    /// Build a curve from (raw, actual) pairs in any order.
    pub fn new(mut points: Vec<(f64, f64)>) -> Result<Self> {
        if points.iter().any(|(raw, actual)| !raw.is_finite() || !actual.is_finite()) {
            return Err(SensorError::InvalidCalibration("non-finite calibration point".to_string()));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(w) = points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(SensorError::InvalidCalibration(format!(
                "duplicate raw value {} in calibration curve",
                w[0].0
            )));
        }
        Ok(Self { points })
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn is_identity(&self) -> bool {
        self.points.is_empty()
    }

    /// Corrected value for `raw`.
    pub fn apply(&self, raw: f64) -> f64 {
        match self.points.as_slice() {
            [] => raw,
            [(raw0, actual0)] => raw + (actual0 - raw0),
            points => {
                // Segment whose right end is the first point above `raw`,
                // clamped to the first/last segment for extrapolation.
                let upper = points
                    .iter()
                    .position(|(r, _)| *r > raw)
                    .unwrap_or(points.len() - 1)
                    .clamp(1, points.len() - 1);
                let (x0, y0) = points[upper - 1];
                let (x1, y1) = points[upper];
                y0 + (raw - x0) * (y1 - y0) / (x1 - x0)
            }
        }
    }
}

impl<'de> Deserialize<'de> for CalibrationCurve {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let points = Vec::<(f64, f64)>::deserialize(deserializer)?;
        CalibrationCurve::new(points).map_err(serde::de::Error::custom)
    }
}

/// Apply `curve` to a raw value of `channel`.
pub fn calibrate(channel: Channel, raw: f64, curve: &CalibrationCurve) -> f64 {
    let actual = curve.apply(raw);
    tracing::trace!(?channel, raw, actual, "calibrated");
    actual
}

/// Both curves of one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCalibration {
    pub gravity: CalibrationCurve,
    pub temperature: CalibrationCurve,
}

impl DeviceCalibration {
    pub fn apply(&self, sample: &RawSample) -> CalibratedSample {
        CalibratedSample {
            device_id: sample.device_id.clone(),
            sg: calibrate(Channel::Gravity, sample.sg_raw, &self.gravity),
            temp_c: calibrate(Channel::Temperature, sample.temp_raw, &self.temperature),
            signal_strength: sample.signal_strength,
            observed_at: sample.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn no_points_is_identity() {
        assert_eq!(calibrate(Channel::Gravity, 1.043, &CalibrationCurve::identity()), 1.043);
    }

    #[test]
    fn single_point_is_an_offset() {
        let curve = CalibrationCurve::new(vec![(20.0, 19.4)]).unwrap();
        assert_relative_eq!(curve.apply(25.0), 24.4, epsilon = 1e-12);
    }

    #[test]
    fn interpolates_between_points() {
        let curve = CalibrationCurve::new(vec![(1.000, 1.000), (1.050, 1.048)]).unwrap();
        assert_relative_eq!(calibrate(Channel::Gravity, 1.025, &curve), 1.024, epsilon = 1e-12);
    }

    #[test]
    fn extrapolates_with_nearest_segment() {
        let curve = CalibrationCurve::new(vec![(1.060, 1.058), (1.000, 1.000), (1.030, 1.030)]).unwrap();
        // below range: first segment has slope 1
        assert_relative_eq!(curve.apply(0.990), 0.990, epsilon = 1e-12);
        // above range: last segment (1.030 -> 1.060) has slope 28/30
        assert_relative_eq!(curve.apply(1.090), 1.058 + 0.030 * 28.0 / 30.0, epsilon = 1e-12);
        // exactly on a point
        assert_relative_eq!(curve.apply(1.030), 1.030, epsilon = 1e-12);
    }

    #[test]
    fn rejects_malformed_curves() {
        assert!(CalibrationCurve::new(vec![(1.0, 1.0), (1.0, 1.1)]).is_err());
        assert!(CalibrationCurve::new(vec![(f64::NAN, 1.0)]).is_err());
    }

    #[test]
    fn deserializing_validates() {
        let ok: DeviceCalibration = toml::from_str("gravity = [[1.0, 1.0], [1.05, 1.048]]").unwrap();
        assert_eq!(ok.gravity.points().len(), 2);
        assert!(ok.temperature.is_identity());

        let bad = toml::from_str::<DeviceCalibration>("gravity = [[1.0, 1.0], [1.0, 1.1]]");
        assert!(bad.is_err());
    }
}
