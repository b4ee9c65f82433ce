//! Relay mode: mirror the samples of another FermWatch instance.
//!
//! The remote serves its latest raw sample per device at
//! `GET /api/samples/latest`. Each poll re-emits samples that have not been
//! seen before; a failed poll returns an error to the scan loop, which owns
//! the backoff.

use crate::scanner::{ScanMode, Scanner};
use crate::{BoxFuture, HalError, RawSample};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Fetches the remote's latest samples.
pub trait SampleFetcher: Send {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Vec<RawSample>, HalError>>;
}

/// HTTP fetcher backed by reqwest
pub struct HttpSampleFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpSampleFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fermwatch-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/api/samples/latest", base_url.trim_end_matches('/')),
        })
    }
}

impl SampleFetcher for HttpSampleFetcher {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Vec<RawSample>, HalError>> {
        Box::pin(async move {
            let response = self.client.get(&self.url).send().await?.error_for_status()?;
            Ok(response.json::<Vec<RawSample>>().await?)
        })
    }
}

/// Scanner that polls a remote instance.
pub struct RelayScanner<F: SampleFetcher> {
    fetcher: F,
    poll_interval: Duration,
    pending: VecDeque<RawSample>,
    last_seen: HashMap<String, DateTime<Utc>>,
    polled_once: bool,
}

impl<F: SampleFetcher> RelayScanner<F> {
    pub fn new(fetcher: F, poll_interval: Duration) -> Self {
        Self {
            fetcher,
            poll_interval,
            pending: VecDeque::new(),
            last_seen: HashMap::new(),
            polled_once: false,
        }
    }

    /// Queue samples newer than what was already relayed for their device.
    fn accept(&mut self, mut samples: Vec<RawSample>) -> usize {
        samples.sort_by_key(|s| s.observed_at);
        let mut fresh = 0;
        for sample in samples {
            let newer = self
                .last_seen
                .get(&sample.device_id)
                .map_or(true, |seen| sample.observed_at > *seen);
            if newer {
                self.last_seen.insert(sample.device_id.clone(), sample.observed_at);
                self.pending.push_back(sample);
                fresh += 1;
            }
        }
        fresh
    }
}

impl<F: SampleFetcher> Scanner for RelayScanner<F> {
    fn mode(&self) -> ScanMode {
        ScanMode::Relay
    }

    fn next_sample(&mut self) -> BoxFuture<'_, Result<Option<RawSample>, HalError>> {
        Box::pin(async move {
            loop {
                if let Some(sample) = self.pending.pop_front() {
                    return Ok(Some(sample));
                }
                if self.polled_once && !self.poll_interval.is_zero() {
                    tokio::time::sleep(self.poll_interval).await;
                }
                self.polled_once = true;

                let samples = self.fetcher.fetch().await?;
                let fresh = self.accept(samples);
                tracing::debug!(fresh, "Relay poll complete");
            }
        })
    }
}
