//! Per-device sensor fusion pipeline
//!
//! Kalman smoothing, anomaly detection and trend fitting for one device.
//! Nothing in here returns an error: faults degrade the reading (unfiltered
//! values, confidence 0, a condition tag) and are logged.

use crate::anomaly::{check_timing, AnomalyConfig, AnomalyKind, InnovationTracker};
use crate::kalman::{Estimate, KalmanFilter, KalmanParams, MotionModel};
use crate::trend::{Prediction, TrendConfig, TrendFitter};
use crate::{CalibratedSample, FusedReading, ReadingCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for the fusion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub gravity: KalmanParams,
    pub temperature: KalmanParams,
    /// Gravity standard deviation at which confidence is one half
    pub gravity_confidence_scale: f64,
    /// Temperature standard deviation (°C) at which confidence is one half
    pub temperature_confidence_scale: f64,
    pub anomaly: AnomalyConfig,
    pub trend: TrendConfig,
    /// Pipelines idle longer than this are evicted (seconds)
    pub idle_eviction_secs: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gravity: KalmanParams {
                model: MotionModel::ConstantVelocity,
                process_noise: 1e-13,
                measurement_noise: 1e-6,
                initial_variance: 1e-4,
                initial_rate_variance: 1e-10,
            },
            temperature: KalmanParams {
                model: MotionModel::ConstantValue,
                process_noise: 1e-4,
                measurement_noise: 0.04,
                initial_variance: 1.0,
                initial_rate_variance: 0.0,
            },
            gravity_confidence_scale: 0.002,
            temperature_confidence_scale: 0.5,
            anomaly: AnomalyConfig::default(),
            trend: TrendConfig::default(),
            idle_eviction_secs: 24 * 3600,
        }
    }
}

fn confidence(variance: f64, scale: f64) -> f64 {
    if !variance.is_finite() || scale <= 0.0 {
        return 0.0;
    }
    (1.0 / (1.0 + variance.max(0.0).sqrt() / scale)).clamp(0.0, 1.0)
}

/// One scalar channel: its filter and innovation history.
#[derive(Debug, Clone)]
struct ChannelState {
    params: KalmanParams,
    filter: Option<KalmanFilter>,
    innovations: InnovationTracker,
}

impl ChannelState {
    fn new(params: KalmanParams, anomaly: &AnomalyConfig) -> Self {
        Self {
            params,
            filter: None,
            innovations: InnovationTracker::new(anomaly.window),
        }
    }

    /// Returns the estimate and whether the innovation was an outlier.
    fn update(&mut self, measurement: f64, dt: f64, anomaly: &AnomalyConfig) -> Option<(Estimate, bool)> {
        let Some(filter) = self.filter.as_mut() else {
            let filter = KalmanFilter::new(self.params, measurement);
            let estimate = Estimate {
                value: measurement,
                variance: filter.variance(),
                innovation: 0.0,
                innovation_variance: filter.variance() + self.params.measurement_noise,
            };
            self.filter = Some(filter);
            return Some((estimate, false));
        };

        match filter.update(measurement, dt) {
            Ok(estimate) => {
                let outlier = self
                    .innovations
                    .observe(estimate.innovation, estimate.innovation_variance, anomaly);
                Some((estimate, outlier))
            }
            Err(_) => {
                // Re-seed from the next good measurement
                self.filter = None;
                None
            }
        }
    }
}

/// Fusion state for one device
#[derive(Debug, Clone)]
pub struct FusionPipeline {
    device_id: String,
    config: FusionConfig,
    gravity: ChannelState,
    temperature: ChannelState,
    trend: TrendFitter,
    last_observed: Option<DateTime<Utc>>,
    samples_seen: u64,
}

impl FusionPipeline {
    pub fn new(device_id: &str, config: FusionConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            gravity: ChannelState::new(config.gravity, &config.anomaly),
            temperature: ChannelState::new(config.temperature, &config.anomaly),
            trend: TrendFitter::new(config.trend.clone()),
            config,
            last_observed: None,
            samples_seen: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.last_observed
    }

    pub fn trend(&self) -> &TrendFitter {
        &self.trend
    }

    /// Fold one calibrated sample into the device state.
    pub fn process(&mut self, sample: &CalibratedSample, target_sg: Option<f64>) -> FusedReading {
        self.samples_seen += 1;

        if !sample.sg.is_finite() || !sample.temp_c.is_finite() {
            tracing::warn!(
                device_id = %self.device_id,
                sg = sample.sg,
                temp_c = sample.temp_c,
                "Discarding non-finite sample"
            );
            return self.degraded(sample, ReadingCondition::InvalidInput);
        }

        let mut anomalies = Vec::new();
        let elapsed = match self.last_observed {
            Some(prev) => {
                let dt = (sample.observed_at - prev).num_milliseconds() as f64 / 1000.0;
                anomalies.extend(check_timing(dt, &self.config.anomaly));
                dt
            }
            None => 0.0,
        };
        self.last_observed = Some(match self.last_observed {
            Some(prev) if prev > sample.observed_at => prev,
            _ => sample.observed_at,
        });

        let anomaly_cfg = &self.config.anomaly;
        let gravity = self.gravity.update(sample.sg, elapsed, anomaly_cfg);
        let temperature = self.temperature.update(sample.temp_c, elapsed, anomaly_cfg);

        let (Some((sg, sg_outlier)), Some((temp, temp_outlier))) = (gravity, temperature) else {
            tracing::warn!(device_id = %self.device_id, "Kalman filter diverged, emitting raw values");
            return self.degraded(sample, ReadingCondition::FilterFault);
        };
        if sg_outlier {
            anomalies.push(AnomalyKind::GravityOutlier);
        }
        if temp_outlier {
            anomalies.push(AnomalyKind::TemperatureOutlier);
        }
        let anomaly = !anomalies.is_empty();
        if anomaly {
            tracing::debug!(device_id = %self.device_id, ?anomalies, "Anomalous reading");
        }

        if !anomaly {
            self.trend.push(sample.observed_at, sg.value);
        }
        if let Err(e) = self.trend.refresh() {
            tracing::warn!(device_id = %self.device_id, error = %e, "Trend fit failed, emitting raw values");
            return self.degraded(sample, ReadingCondition::FitFault);
        }
        let predicted_completion = target_sg
            .map(|target| self.trend.predict(sg.value, target))
            .and_then(|p| match p {
                Prediction::Reached => Some(sample.observed_at),
                other => other.eta(),
            });

        let confidence = confidence(sg.variance, self.config.gravity_confidence_scale)
            .min(confidence(temp.variance, self.config.temperature_confidence_scale));

        FusedReading {
            device_id: self.device_id.clone(),
            sg_filtered: sg.value,
            temp_filtered_c: temp.value,
            confidence,
            anomaly,
            anomalies,
            predicted_completion,
            observed_at: sample.observed_at,
            condition: ReadingCondition::Nominal,
        }
    }

    /// Current completion estimate without feeding a sample.
    pub fn prediction(&self, target_sg: f64) -> Prediction {
        match self.gravity.filter.as_ref() {
            Some(filter) => self.trend.predict(filter.value(), target_sg),
            None => Prediction::InsufficientData,
        }
    }

    fn degraded(&self, sample: &CalibratedSample, condition: ReadingCondition) -> FusedReading {
        FusedReading {
            device_id: self.device_id.clone(),
            sg_filtered: sample.sg,
            temp_filtered_c: sample.temp_c,
            confidence: 0.0,
            anomaly: false,
            anomalies: Vec::new(),
            predicted_completion: None,
            observed_at: sample.observed_at,
            condition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn sample(minutes: i64, sg: f64, temp_c: f64) -> CalibratedSample {
        CalibratedSample {
            device_id: "tilt:red".into(),
            sg,
            temp_c,
            signal_strength: -60,
            observed_at: at(minutes),
        }
    }

    #[test]
    fn first_sample_seeds_the_filter() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        let reading = pipeline.process(&sample(0, 1.050, 19.0), None);
        assert_eq!(reading.sg_filtered, 1.050);
        assert_eq!(reading.temp_filtered_c, 19.0);
        assert!(reading.confidence > 0.0 && reading.confidence < 1.0);
        assert!(!reading.anomaly);
        assert_eq!(reading.condition, ReadingCondition::Nominal);
    }

    #[test]
    fn confidence_grows_as_filter_settles() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        let first = pipeline.process(&sample(0, 1.050, 19.0), None).confidence;
        let mut last = first;
        for i in 1..30 {
            last = pipeline.process(&sample(i * 5, 1.050, 19.0), None).confidence;
        }
        assert!(last > first);
    }

    #[test]
    fn non_finite_sample_degrades_without_touching_state() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        pipeline.process(&sample(0, 1.050, 19.0), None);
        let bad = pipeline.process(&sample(5, f64::NAN, 19.0), None);
        assert_eq!(bad.confidence, 0.0);
        assert_eq!(bad.condition, ReadingCondition::InvalidInput);
        assert_eq!(pipeline.last_observed(), Some(at(0)));

        let good = pipeline.process(&sample(10, 1.049, 19.1), None);
        assert!(good.confidence > 0.0);
    }

    #[test]
    fn clock_skew_and_spikes_are_flagged() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        for i in 0..20 {
            let wobble = if i % 2 == 0 { 0.0002 } else { -0.0002 };
            pipeline.process(&sample(i * 5, 1.050 + wobble, 19.0), None);
        }
        let skewed = pipeline.process(&sample(50, 1.050, 19.0), None);
        assert!(skewed.anomalies.contains(&AnomalyKind::ClockSkew));

        let spike = pipeline.process(&sample(105, 1.090, 19.0), None);
        assert!(spike.anomaly);
        assert!(spike.anomalies.contains(&AnomalyKind::GravityOutlier));
    }

    #[test]
    fn anomalous_readings_stay_out_of_the_trend() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        pipeline.process(&sample(0, 1.050, 19.0), None);
        let before = pipeline.trend().len();
        // same timestamp again: clock skew
        pipeline.process(&sample(0, 1.050, 19.0), None);
        assert_eq!(pipeline.trend().len(), before);
    }

    #[test]
    fn singular_fit_emits_raw_values() {
        // a one-point window can never be fitted
        let config = FusionConfig {
            trend: TrendConfig { window: 1, min_points: 1, min_span_secs: 0.0, refit_every: 1, ..Default::default() },
            ..Default::default()
        };
        let mut pipeline = FusionPipeline::new("tilt:red", config);
        let first = pipeline.process(&sample(0, 1.050, 19.0), Some(1.010));
        assert_eq!(first.condition, ReadingCondition::FitFault);

        let reading = pipeline.process(&sample(5, 1.049, 19.4), Some(1.010));
        assert_eq!(reading.condition, ReadingCondition::FitFault);
        assert_eq!(reading.confidence, 0.0);
        assert_eq!(reading.sg_filtered, 1.049);
        assert_eq!(reading.temp_filtered_c, 19.4);
        assert!(reading.predicted_completion.is_none());
        assert_eq!(pipeline.prediction(1.010), Prediction::InsufficientData);
    }

    #[test]
    fn predicts_completion_once_enough_history_exists() {
        let mut pipeline = FusionPipeline::new("tilt:red", FusionConfig::default());
        let mut reading = None;
        for i in 0..72 {
            let hours = i as f64;
            let sg = 1.010 + 0.040 * (-hours / 48.0).exp();
            reading = Some(pipeline.process(&sample(i * 60, sg, 19.0), Some(1.012)));
        }
        let reading = reading.unwrap();
        let eta = reading.predicted_completion.expect("completion estimate");
        assert!(eta > reading.observed_at);
    }
}
