//! Simulated hydrometers.
//!
//! Each simulated device follows an exponential attenuation curve from its
//! original gravity towards its final gravity while temperature drifts
//! around a set point. Noise comes from a seeded generator so runs are
//! reproducible.

use crate::clock::Clock;
use crate::scanner::{ScanMode, Scanner};
use crate::{BoxFuture, DeviceKind, HalError, RawSample};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Shape of one simulated fermentation
#[derive(Debug, Clone)]
pub struct MockProfile {
    pub original_gravity: f64,
    pub final_gravity: f64,
    /// Attenuation rate per simulated hour
    pub rate_per_hour: f64,
    pub temp_c: f64,
    /// Peak-to-peak temperature swing
    pub temp_swing_c: f64,
    pub sg_noise: f64,
    pub temp_noise_c: f64,
}

impl Default for MockProfile {
    fn default() -> Self {
        Self {
            original_gravity: 1.055,
            final_gravity: 1.012,
            rate_per_hour: 0.03,
            temp_c: 19.5,
            temp_swing_c: 1.5,
            sg_noise: 0.0005,
            temp_noise_c: 0.1,
        }
    }
}

struct MockDevice {
    device_id: String,
    profile: MockProfile,
}

/// Scanner producing simulated samples, one device per call in turn.
pub struct MockScanner {
    devices: Vec<MockDevice>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    time_scale: f64,
    started_at: DateTime<Utc>,
    cursor: usize,
    seed: u64,
}

impl MockScanner {
    pub fn new(device_ids: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        let devices = device_ids
            .into_iter()
            .enumerate()
            .map(|(i, device_id)| MockDevice {
                device_id,
                profile: MockProfile {
                    // Spread devices out so they are easy to tell apart
                    original_gravity: 1.050 + 0.004 * i as f64,
                    temp_c: 19.0 + 0.5 * i as f64,
                    ..MockProfile::default()
                },
            })
            .collect();

        Self {
            devices,
            clock,
            interval: Duration::from_secs(5),
            time_scale: 1.0,
            started_at,
            cursor: 0,
            seed: 0x5EED_F00D,
        }
    }

    /// Pause between samples (real time). Zero disables pacing.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Simulated hours pass `time_scale` times faster than real ones.
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_profile(mut self, device_id: &str, profile: MockProfile) -> Self {
        if let Some(device) = self.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.profile = profile;
        }
        self
    }

    /// Uniform noise in [-1, 1)
    fn noise(&mut self) -> f64 {
        self.seed = self.seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.seed >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }

    fn generate(&mut self, now: DateTime<Utc>) -> Option<RawSample> {
        if self.devices.is_empty() {
            return None;
        }
        let index = self.cursor % self.devices.len();
        self.cursor = self.cursor.wrapping_add(1);

        let elapsed_secs = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let hours = elapsed_secs * self.time_scale / 3600.0;

        let sg_noise = self.noise();
        let temp_noise = self.noise();
        let device = &self.devices[index];
        let p = &device.profile;

        let sg = p.final_gravity
            + (p.original_gravity - p.final_gravity) * (-p.rate_per_hour * hours).exp()
            + sg_noise * p.sg_noise;
        let temp = p.temp_c
            + 0.5 * p.temp_swing_c * (hours * std::f64::consts::TAU / 24.0).sin()
            + temp_noise * p.temp_noise_c;

        Some(RawSample {
            device_id: device.device_id.clone(),
            kind: DeviceKind::Simulated,
            sg_raw: sg,
            temp_raw: temp,
            signal_strength: -65,
            observed_at: now,
        })
    }
}

impl Scanner for MockScanner {
    fn mode(&self) -> ScanMode {
        ScanMode::Mock
    }

    fn next_sample(&mut self) -> BoxFuture<'_, Result<Option<RawSample>, HalError>> {
        Box::pin(async move {
            if self.devices.is_empty() {
                return Err(HalError::InvalidConfig("mock scanner has no devices".to_string()));
            }
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            let now = self.clock.now();
            Ok(self.generate(now))
        })
    }
}
