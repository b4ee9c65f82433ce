//! Latest-value store shared between the dispatcher, the control loop and
//! the HTTP API.

use crate::FusedReading;
use fermwatch_hal::RawSample;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct ReadingStore {
    readings: RwLock<HashMap<String, FusedReading>>,
    samples: RwLock<HashMap<String, RawSample>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `reading` unless a newer one for the same device is already stored.
    pub fn put_reading(&self, reading: FusedReading) {
        let mut readings = self.readings.write().unwrap_or_else(|e| e.into_inner());
        match readings.get(&reading.device_id) {
            Some(existing) if existing.observed_at > reading.observed_at => {}
            _ => {
                readings.insert(reading.device_id.clone(), reading);
            }
        }
    }

    pub fn put_sample(&self, sample: RawSample) {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        match samples.get(&sample.device_id) {
            Some(existing) if existing.observed_at > sample.observed_at => {}
            _ => {
                samples.insert(sample.device_id.clone(), sample);
            }
        }
    }

    pub fn latest(&self, device_id: &str) -> Option<FusedReading> {
        self.readings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// All latest readings, ordered by device id.
    pub fn readings(&self) -> Vec<FusedReading> {
        let mut all: Vec<FusedReading> = self
            .readings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// All latest raw samples, ordered by device id.
    pub fn samples(&self) -> Vec<RawSample> {
        let mut all: Vec<RawSample> = self
            .samples
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn forget(&self, device_id: &str) {
        self.readings.write().unwrap_or_else(|e| e.into_inner()).remove(device_id);
        self.samples.write().unwrap_or_else(|e| e.into_inner()).remove(device_id);
    }
}
