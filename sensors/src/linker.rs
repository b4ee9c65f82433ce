//! Batch linker
//!
//! Maps a hydrometer to the batch it currently sits in. Lookups hit an
//! in-memory snapshot; the snapshot is rebuilt from a [`BatchDirectory`] at
//! most once per refresh interval.

use crate::{Result, SensorError};
use chrono::{DateTime, Duration, Utc};
use fermwatch_hal::{BoxFuture, Clock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Planning,
    Fermenting,
    Conditioning,
    Completed,
    Archived,
}

impl BatchStatus {
    /// Devices link to, and controllers run for, active batches only.
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Fermenting | BatchStatus::Conditioning)
    }
}

/// What the controller and the fusion pipeline need to know about a batch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: BatchStatus,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub target_temp_c: Option<f64>,
    /// Expected final gravity, used for completion estimates
    #[serde(default)]
    pub target_sg: Option<f64>,
    /// Deadband half-width; the controller default applies when unset
    #[serde(default)]
    pub hysteresis_c: Option<f64>,
    #[serde(default)]
    pub heater_entity: Option<String>,
    #[serde(default)]
    pub cooler_entity: Option<String>,
}

/// Source of batch records
pub trait BatchDirectory: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Vec<BatchRecord>>>;
}

/// Batches fixed at startup (from the config file)
#[derive(Debug, Clone, Default)]
pub struct StaticBatchDirectory {
    batches: Vec<BatchRecord>,
}

impl StaticBatchDirectory {
    pub fn new(batches: Vec<BatchRecord>) -> Self {
        Self { batches }
    }
}

impl BatchDirectory for StaticBatchDirectory {
    fn load(&self) -> BoxFuture<'_, Result<Vec<BatchRecord>>> {
        let batches = self.batches.clone();
        Box::pin(async move { Ok(batches) })
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchFile {
    #[serde(default)]
    batches: Vec<BatchRecord>,
}

/// Batches kept in a TOML (`[[batches]]`) or JSON (array) file, re-read on
/// every refresh so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct FileBatchDirectory {
    path: PathBuf,
}

impl FileBatchDirectory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Result<Vec<BatchRecord>> {
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(content)
                .map_err(|e| SensorError::Directory(format!("{}: {}", self.path.display(), e)))
        } else {
            toml::from_str::<BatchFile>(content)
                .map(|file| file.batches)
                .map_err(|e| SensorError::Directory(format!("{}: {}", self.path.display(), e)))
        }
    }
}

impl BatchDirectory for FileBatchDirectory {
    fn load(&self) -> BoxFuture<'_, Result<Vec<BatchRecord>>> {
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| SensorError::Directory(format!("{}: {}", self.path.display(), e)))?;
            self.parse(&content)
        })
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    batches: HashMap<String, BatchRecord>,
    bindings: HashMap<String, String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn build(records: Vec<BatchRecord>, at: DateTime<Utc>) -> Self {
        let mut active: Vec<BatchRecord> = records.into_iter().filter(|b| b.status.is_active()).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));

        let mut bindings = HashMap::new();
        for batch in &active {
            let Some(device_id) = batch.device_id.as_ref() else {
                continue;
            };
            if let Some(existing) = bindings.get(device_id) {
                tracing::warn!(
                    device_id = %device_id,
                    batch_id = %batch.id,
                    linked = %existing,
                    "Device bound to more than one active batch, keeping the first"
                );
                continue;
            }
            bindings.insert(device_id.clone(), batch.id.clone());
        }

        Self {
            batches: active.into_iter().map(|b| (b.id.clone(), b)).collect(),
            bindings,
            refreshed_at: Some(at),
        }
    }
}

pub struct BatchLinker {
    directory: Arc<dyn BatchDirectory>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
}

impl BatchLinker {
    pub fn new(directory: Arc<dyn BatchDirectory>, clock: Arc<dyn Clock>, refresh_interval: Duration) -> Self {
        Self {
            directory,
            clock,
            refresh_interval,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Batch the device is bound to, if that batch is active.
    pub fn link(&self, device_id: &str) -> Option<String> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .bindings
            .get(device_id)
            .cloned()
    }

    /// Record of the batch the device is bound to.
    pub fn linked_batch(&self, device_id: &str) -> Option<BatchRecord> {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        let batch_id = snapshot.bindings.get(device_id)?;
        snapshot.batches.get(batch_id).cloned()
    }

    pub fn batch(&self, batch_id: &str) -> Option<BatchRecord> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .batches
            .get(batch_id)
            .cloned()
    }

    /// Active batches, ordered by id.
    pub fn active_batches(&self) -> Vec<BatchRecord> {
        let mut batches: Vec<BatchRecord> = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .batches
            .values()
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.id.cmp(&b.id));
        batches
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).refreshed_at
    }

    /// Reload from the directory. On failure the previous snapshot stays.
    pub async fn refresh(&self) -> Result<()> {
        let now = self.clock.now();
        match self.directory.load().await {
            Ok(records) => {
                let snapshot = Snapshot::build(records, now);
                tracing::debug!(
                    batches = snapshot.batches.len(),
                    bindings = snapshot.bindings.len(),
                    "Batch bindings refreshed"
                );
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Batch refresh failed, keeping previous bindings");
                // retry no sooner than the normal interval
                self.snapshot.write().unwrap_or_else(|e| e.into_inner()).refreshed_at = Some(now);
                Err(e)
            }
        }
    }

    /// Refresh when the snapshot is older than the interval. Returns whether
    /// a refresh was attempted.
    pub async fn refresh_if_due(&self) -> bool {
        let due = match self.refreshed_at() {
            Some(at) => self.clock.now() - at >= self.refresh_interval,
            None => true,
        };
        if due {
            let _ = self.refresh().await;
        }
        due
    }
}
