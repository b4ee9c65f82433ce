//! Sample dispatcher
//!
//! Single consumer of every scanner and of `/api/ingest`, so samples of one
//! device reach their pipeline in arrival order.

use fermwatch_hal::RawSample;
use fermwatch_sensors::hub::BroadcastHub;
use fermwatch_sensors::linker::BatchLinker;
use fermwatch_sensors::recording::SessionRecorder;
use fermwatch_sensors::{DeviceCalibration, FusedReading, PipelineManager, ReadingStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct Dispatcher {
    pub calibrations: HashMap<String, DeviceCalibration>,
    pub manager: Arc<PipelineManager>,
    pub linker: Arc<BatchLinker>,
    pub store: Arc<ReadingStore>,
    pub hub: Arc<BroadcastHub>,
    pub recorder: Option<Arc<Mutex<SessionRecorder>>>,
}

impl Dispatcher {
    /// Calibrate, fuse and publish one sample.
    pub fn handle(&self, sample: RawSample) -> FusedReading {
        self.store.put_sample(sample.clone());
        self.with_recorder(|r| r.record_sample(&sample).map_err(|e| e.to_string()));

        let calibrated = match self.calibrations.get(&sample.device_id) {
            Some(calibration) => calibration.apply(&sample),
            None => DeviceCalibration::default().apply(&sample),
        };

        let target_sg = self
            .linker
            .linked_batch(&sample.device_id)
            .and_then(|batch| batch.target_sg);
        self.manager.set_target_gravity(&sample.device_id, target_sg);

        let reading = self.manager.process(&calibrated);
        tracing::debug!(
            device_id = %reading.device_id,
            sg = reading.sg_filtered,
            temp_c = reading.temp_filtered_c,
            confidence = reading.confidence,
            "Fused reading"
        );

        self.store.put_reading(reading.clone());
        self.with_recorder(|r| r.record_reading(&reading).map_err(|e| e.to_string()));
        self.hub.publish_reading(&reading);
        reading
    }

    fn with_recorder(&self, f: impl FnOnce(&mut SessionRecorder) -> Result<(), String>) {
        if let Some(recorder) = &self.recorder {
            let mut recorder = recorder.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = f(&mut recorder) {
                tracing::warn!(error = %e, "Failed to record");
            }
        }
    }

    /// Drain `rx` until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<RawSample>) {
        tracing::info!(devices = self.calibrations.len(), "Dispatcher started");
        while let Some(sample) = rx.recv().await {
            self.handle(sample);
        }
        tracing::info!("Dispatcher stopped");
    }
}
