//! Pipeline manager
//!
//! Owns one [`FusionPipeline`] per device. Samples from different devices
//! never share state, and samples from one device are folded in one at a
//! time, so interleaving devices never changes any device's output.

use crate::fusion::{FusionConfig, FusionPipeline};
use crate::trend::Prediction;
use crate::{CalibratedSample, FusedReading};
use chrono::{DateTime, Duration, Utc};
use fermwatch_hal::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

struct Slot {
    pipeline: FusionPipeline,
    target_sg: Option<f64>,
    last_touched: DateTime<Utc>,
}

/// Per-device pipelines, created on first sample
pub struct PipelineManager {
    config: FusionConfig,
    clock: Arc<dyn Clock>,
    pipelines: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl PipelineManager {
    pub fn new(config: FusionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            pipelines: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
        {
            return slot.clone();
        }

        let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
        pipelines
            .entry(device_id.to_string())
            .or_insert_with(|| {
                tracing::info!(device_id, "Creating fusion pipeline");
                Arc::new(Mutex::new(Slot {
                    pipeline: FusionPipeline::new(device_id, self.config.clone()),
                    target_sg: None,
                    last_touched: self.clock.now(),
                }))
            })
            .clone()
    }

    /// Route a calibrated sample to its device's pipeline.
    pub fn process(&self, sample: &CalibratedSample) -> FusedReading {
        let slot = self.slot(&sample.device_id);
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.last_touched = self.clock.now();
        let target = slot.target_sg;
        slot.pipeline.process(sample, target)
    }

    /// Target gravity used for completion estimates, typically from the linked batch.
    pub fn set_target_gravity(&self, device_id: &str, target_sg: Option<f64>) {
        let slot = self.slot(device_id);
        slot.lock().unwrap_or_else(|e| e.into_inner()).target_sg = target_sg;
    }

    pub fn prediction(&self, device_id: &str) -> Option<Prediction> {
        let slot = self
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)?
            .clone();
        let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.target_sg.map(|target| slot.pipeline.prediction(target))
    }

    pub fn devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, device_id: &str) -> bool {
        let removed = self
            .pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
            .is_some();
        if removed {
            tracing::info!(device_id, "Removed fusion pipeline");
        }
        removed
    }

    /// Drop pipelines that have not seen a sample within the idle window.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let max_idle = Duration::seconds(self.config.idle_eviction_secs as i64);
        let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
        let idle: Vec<String> = pipelines
            .iter()
            .filter(|(_, slot)| {
                let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                now - slot.last_touched > max_idle
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            pipelines.remove(id);
            tracing::info!(device_id = %id, "Evicted idle fusion pipeline");
        }
        idle
    }
}
