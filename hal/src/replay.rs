//! Replays a recorded `samples.jsonl` file.

use crate::scanner::{ScanMode, Scanner};
use crate::{BoxFuture, HalError, RawSample};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Finite scanner over a JSON-lines file of [`RawSample`]s.
///
/// Gaps between recorded timestamps are reproduced divided by
/// `time_scale`; a scale of zero replays as fast as possible.
/// Lines that fail to parse are skipped with a warning.
pub struct ReplayScanner {
    path: PathBuf,
    time_scale: f64,
    lines: Option<Lines<BufReader<File>>>,
    last_observed: Option<DateTime<Utc>>,
    line_no: usize,
}

impl ReplayScanner {
    pub fn new(path: &Path, time_scale: f64) -> Self {
        Self {
            path: path.to_path_buf(),
            time_scale: time_scale.max(0.0),
            lines: None,
            last_observed: None,
            line_no: 0,
        }
    }

    async fn open(&mut self) -> Result<(), HalError> {
        let file = File::open(&self.path).await?;
        tracing::info!(path = ?self.path, "Replaying samples");
        self.lines = Some(BufReader::new(file).lines());
        Ok(())
    }

    fn pacing(&self, next: DateTime<Utc>) -> Duration {
        if self.time_scale <= 0.0 {
            return Duration::ZERO;
        }
        match self.last_observed {
            Some(prev) if next > prev => {
                let gap = (next - prev).to_std().unwrap_or_default();
                gap.div_f64(self.time_scale)
            }
            _ => Duration::ZERO,
        }
    }
}

impl Scanner for ReplayScanner {
    fn mode(&self) -> ScanMode {
        ScanMode::Replay
    }

    fn next_sample(&mut self) -> BoxFuture<'_, Result<Option<RawSample>, HalError>> {
        Box::pin(async move {
            if self.lines.is_none() {
                self.open().await?;
            }

            loop {
                let next = match self.lines.as_mut() {
                    Some(lines) => lines.next_line().await?,
                    None => return Ok(None),
                };
                let Some(line) = next else {
                    return Ok(None);
                };
                self.line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let sample: RawSample = match serde_json::from_str(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(line = self.line_no, error = %e, "Skipping unreadable sample");
                        continue;
                    }
                };

                let delay = self.pacing(sample.observed_at);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.last_observed = Some(sample.observed_at);
                return Ok(Some(sample));
            }
        })
    }

    /// Restart from the beginning of the file.
    fn reconnect(&mut self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async move {
            self.lines = None;
            self.last_observed = None;
            self.line_no = 0;
            self.open().await
        })
    }
}
