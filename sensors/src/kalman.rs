//! One-dimensional Kalman filter
//!
//! Gravity and temperature are filtered as independent scalar processes.
//! The state is `[value, rate]`; with [`MotionModel::ConstantValue`] the
//! rate is pinned to zero.

use nalgebra::{Matrix1x2, Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Process model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionModel {
    /// Value drifts as a random walk
    ConstantValue,
    /// Value moves with a slowly changing rate (white-noise acceleration)
    ConstantVelocity,
}

/// Noise parameters for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KalmanParams {
    pub model: MotionModel,
    /// Spectral density of the process noise (per second)
    pub process_noise: f64,
    /// Variance of one measurement
    pub measurement_noise: f64,
    /// Variance of the value when the filter is seeded
    pub initial_variance: f64,
    /// Variance of the rate when the filter is seeded
    pub initial_rate_variance: f64,
}

/// Filter output for one update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub value: f64,
    pub variance: f64,
    /// Measurement minus prediction
    pub innovation: f64,
    /// Variance of the innovation
    pub innovation_variance: f64,
}

/// The filter produced a non-finite state
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("kalman filter diverged")]
pub struct Diverged;

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    params: KalmanParams,
    x: Vector2<f64>,
    p: Matrix2<f64>,
}

impl KalmanFilter {
    /// Seed from a first measurement: zero rate, wide covariance.
    pub fn new(params: KalmanParams, first: f64) -> Self {
        let rate_variance = match params.model {
            MotionModel::ConstantValue => 0.0,
            MotionModel::ConstantVelocity => params.initial_rate_variance,
        };
        Self {
            params,
            x: Vector2::new(first, 0.0),
            p: Matrix2::new(params.initial_variance, 0.0, 0.0, rate_variance),
        }
    }

    pub fn value(&self) -> f64 {
        self.x[0]
    }

    pub fn rate(&self) -> f64 {
        self.x[1]
    }

    pub fn variance(&self) -> f64 {
        self.p[(0, 0)]
    }

    fn transition(&self, dt: f64) -> (Matrix2<f64>, Matrix2<f64>) {
        let q = self.params.process_noise;
        match self.params.model {
            MotionModel::ConstantValue => (
                Matrix2::new(1.0, 0.0, 0.0, 0.0),
                Matrix2::new(q * dt, 0.0, 0.0, 0.0),
            ),
            MotionModel::ConstantVelocity => (
                Matrix2::new(1.0, dt, 0.0, 1.0),
                Matrix2::new(
                    q * dt.powi(3) / 3.0,
                    q * dt.powi(2) / 2.0,
                    q * dt.powi(2) / 2.0,
                    q * dt,
                ),
            ),
        }
    }

    /// Predict forward `dt` seconds and fold in `measurement`.
    ///
    /// On divergence the previous state is kept.
    pub fn update(&mut self, measurement: f64, dt: f64) -> Result<Estimate, Diverged> {
        if !measurement.is_finite() || !dt.is_finite() {
            return Err(Diverged);
        }
        let dt = dt.max(0.0);
        let (f, q) = self.transition(dt);
        let h = Matrix1x2::new(1.0, 0.0);
        let r = self.params.measurement_noise;

        let x_pred = f * self.x;
        let p_pred = f * self.p * f.transpose() + q;

        let innovation = measurement - x_pred[0];
        let s = p_pred[(0, 0)] + r;

        let (mut x_new, p_new) = if s > f64::EPSILON * f64::EPSILON {
            let k = p_pred * h.transpose() / s;
            let x_new = x_pred + k * innovation;
            let p_new = (Matrix2::identity() - k * h) * p_pred;
            (x_new, p_new)
        } else {
            // Nothing uncertain about either side; trust the measurement
            (Vector2::new(measurement, x_pred[1]), p_pred)
        };

        // With a noiseless sensor the posterior is the measurement itself
        if r == 0.0 {
            x_new[0] = measurement;
        }

        if x_new.iter().chain(p_new.iter()).any(|v| !v.is_finite()) {
            return Err(Diverged);
        }

        self.x = x_new;
        // Keep the covariance symmetric against rounding drift
        self.p = (p_new + p_new.transpose()) * 0.5;

        Ok(Estimate {
            value: self.x[0],
            variance: self.p[(0, 0)].max(0.0),
            innovation,
            innovation_variance: s.max(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params(model: MotionModel, q: f64, r: f64) -> KalmanParams {
        KalmanParams {
            model,
            process_noise: q,
            measurement_noise: r,
            initial_variance: 1.0,
            initial_rate_variance: 1e-4,
        }
    }

    #[test]
    fn noiseless_filter_is_pass_through() {
        for model in [MotionModel::ConstantValue, MotionModel::ConstantVelocity] {
            let mut kf = KalmanFilter::new(params(model, 0.0, 0.0), 1.050);
            for (i, z) in [1.049, 1.047, 1.047, 1.043, 1.051].into_iter().enumerate() {
                let est = kf.update(z, 60.0 * (i as f64 + 1.0)).unwrap();
                assert_eq!(est.value, z);
            }
        }
    }

    #[test]
    fn smooths_noisy_constant_signal() {
        let mut kf = KalmanFilter::new(params(MotionModel::ConstantValue, 1e-8, 0.01), 20.0);
        let noisy = [20.3, 19.8, 20.1, 19.7, 20.2, 20.0, 19.9, 20.4, 19.6, 20.1];
        let mut last = 0.0;
        for z in noisy {
            last = kf.update(z, 60.0).unwrap().value;
        }
        assert!((last - 20.0).abs() < 0.15);
        assert!(kf.variance() < 0.01);
    }

    #[test]
    fn tracks_a_ramp_with_velocity_model() {
        let mut kf = KalmanFilter::new(params(MotionModel::ConstantVelocity, 1e-10, 1e-6), 1.060);
        let mut est = None;
        for i in 1..=50 {
            let z = 1.060 - 0.0001 * i as f64;
            est = Some(kf.update(z, 60.0).unwrap());
        }
        let est = est.unwrap();
        assert_relative_eq!(est.value, 1.055, epsilon = 5e-4);
        // rate is per second
        assert!(kf.rate() < 0.0);
    }

    #[test]
    fn rejects_non_finite_input_and_keeps_state() {
        let mut kf = KalmanFilter::new(params(MotionModel::ConstantValue, 1e-6, 1e-4), 1.040);
        assert_eq!(kf.update(f64::NAN, 10.0), Err(Diverged));
        assert_eq!(kf.value(), 1.040);
        assert!(kf.update(1.041, f64::INFINITY).is_err());
    }
}
