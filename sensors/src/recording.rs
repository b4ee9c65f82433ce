//! Session Recording
//!
//! Append-only JSONL logs of everything that flows through the service.
//! Each session is a directory:
//!
//! ```text
//! <base>/<session id>/
//!     session.json     metadata
//!     samples.jsonl    raw samples (replayable with the replay scanner)
//!     readings.jsonl   fused readings
//!     control.jsonl    controller events
//! ```

use crate::control::ControlEvent;
use crate::{FusedReading, Result, SensorError};
use chrono::{DateTime, Utc};
use fermwatch_hal::RawSample;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const SAMPLES_FILE: &str = "samples.jsonl";
pub const READINGS_FILE: &str = "readings.jsonl";
pub const CONTROL_FILE: &str = "control.jsonl";
const METADATA_FILE: &str = "session.json";

/// Recording session metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub reading_count: usize,
    pub event_count: usize,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl RecordingSession {
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("session_{}", now.format("%Y%m%dT%H%M%SZ")),
            name: name.to_string(),
            start_time: now,
            end_time: None,
            sample_count: 0,
            reading_count: 0,
            event_count: 0,
            notes: Vec::new(),
        }
    }

    pub fn duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }
}

struct Writers {
    samples: BufWriter<File>,
    readings: BufWriter<File>,
    control: BufWriter<File>,
}

/// JSONL session recorder
pub struct SessionRecorder {
    base_path: PathBuf,
    session: Option<RecordingSession>,
    writers: Option<Writers>,
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(BufWriter::new)
        .map_err(|e| SensorError::Recording(format!("Failed to open {}: {}", path.display(), e)))
}

fn write_line<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| SensorError::Recording(format!("Serialization error: {}", e)))?;
    writeln!(writer, "{}", json).map_err(|e| SensorError::Recording(format!("Write error: {}", e)))
}

impl SessionRecorder {
    pub fn new(base_path: &Path) -> Result<Self> {
        create_dir_all(base_path)
            .map_err(|e| SensorError::Recording(format!("Failed to create directory: {}", e)))?;

        Ok(Self {
            base_path: base_path.to_path_buf(),
            session: None,
            writers: None,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(session_id)
    }

    /// Start a new session, ending the current one first.
    pub fn start_session(&mut self, name: &str, now: DateTime<Utc>) -> Result<&RecordingSession> {
        if self.session.is_some() {
            self.end_session(now)?;
        }

        let mut session = RecordingSession::new(name, now);
        let mut suffix = 1;
        while self.session_path(&session.id).exists() {
            suffix += 1;
            session.id = format!("{}_{}", RecordingSession::new(name, now).id, suffix);
        }
        let session_path = self.session_path(&session.id);
        create_dir_all(&session_path)
            .map_err(|e| SensorError::Recording(format!("Failed to create session dir: {}", e)))?;

        let writers = Writers {
            samples: open_append(&session_path.join(SAMPLES_FILE))?,
            readings: open_append(&session_path.join(READINGS_FILE))?,
            control: open_append(&session_path.join(CONTROL_FILE))?,
        };
        self.write_metadata(&session)?;

        tracing::info!(session = %session.id, name, "Recording session started");
        self.writers = Some(writers);
        Ok(self.session.insert(session))
    }

    /// End the current session and persist its final metadata.
    pub fn end_session(&mut self, now: DateTime<Utc>) -> Result<Option<RecordingSession>> {
        self.flush()?;
        self.writers = None;
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        session.end_time = Some(now);
        self.write_metadata(&session)?;
        tracing::info!(
            session = %session.id,
            samples = session.sample_count,
            readings = session.reading_count,
            events = session.event_count,
            "Recording session ended"
        );
        Ok(Some(session))
    }

    fn write_metadata(&self, session: &RecordingSession) -> Result<()> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| SensorError::Recording(format!("Failed to serialize session: {}", e)))?;
        std::fs::write(self.session_path(&session.id).join(METADATA_FILE), json)
            .map_err(|e| SensorError::Recording(format!("Failed to write metadata: {}", e)))
    }

    pub fn record_sample(&mut self, sample: &RawSample) -> Result<()> {
        if let (Some(writers), Some(session)) = (self.writers.as_mut(), self.session.as_mut()) {
            write_line(&mut writers.samples, sample)?;
            session.sample_count += 1;
        }
        Ok(())
    }

    pub fn record_reading(&mut self, reading: &FusedReading) -> Result<()> {
        if let (Some(writers), Some(session)) = (self.writers.as_mut(), self.session.as_mut()) {
            write_line(&mut writers.readings, reading)?;
            session.reading_count += 1;
        }
        Ok(())
    }

    /// Control events are rare and matter; they are flushed immediately.
    pub fn record_event(&mut self, event: &ControlEvent) -> Result<()> {
        if let (Some(writers), Some(session)) = (self.writers.as_mut(), self.session.as_mut()) {
            write_line(&mut writers.control, event)?;
            writers
                .control
                .flush()
                .map_err(|e| SensorError::Recording(format!("Flush error: {}", e)))?;
            session.event_count += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writers) = self.writers.as_mut() {
            for writer in [&mut writers.samples, &mut writers.readings, &mut writers.control] {
                writer
                    .flush()
                    .map_err(|e| SensorError::Recording(format!("Flush error: {}", e)))?;
            }
        }
        Ok(())
    }

    pub fn add_note(&mut self, note: &str, now: DateTime<Utc>) {
        if let Some(session) = self.session.as_mut() {
            session.notes.push(format!("[{}] {}", now.format("%H:%M:%S"), note));
        }
    }

    /// All sessions under the base path, newest first.
    pub fn list_sessions(&self) -> Result<Vec<RecordingSession>> {
        let mut sessions = Vec::new();

        for entry in std::fs::read_dir(&self.base_path)
            .map_err(|e| SensorError::Recording(format!("Read dir error: {}", e)))?
        {
            let entry = entry.map_err(|e| SensorError::Recording(format!("Entry error: {}", e)))?;
            let metadata_path = entry.path().join(METADATA_FILE);
            if !metadata_path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&metadata_path)
                .map_err(|e| SensorError::Recording(format!("Read error: {}", e)))?;
            match serde_json::from_str::<RecordingSession>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(path = %metadata_path.display(), error = %e, "Skipping unreadable session"),
            }
        }

        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }

    fn load_lines<T: DeserializeOwned>(&self, session_id: &str, file: &str) -> Result<Vec<T>> {
        let path = self.session_path(session_id).join(file);
        let file = File::open(&path)
            .map_err(|e| SensorError::Recording(format!("Open error {}: {}", path.display(), e)))?;

        let mut items = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| SensorError::Recording(format!("Read error: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            // a torn last line after a crash is expected
            if let Ok(item) = serde_json::from_str::<T>(&line) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn load_samples(&self, session_id: &str) -> Result<Vec<RawSample>> {
        self.load_lines(session_id, SAMPLES_FILE)
    }

    pub fn load_readings(&self, session_id: &str) -> Result<Vec<FusedReading>> {
        self.load_lines(session_id, READINGS_FILE)
    }

    pub fn load_events(&self, session_id: &str) -> Result<Vec<ControlEvent>> {
        self.load_lines(session_id, CONTROL_FILE)
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
