//! Scanner contract and the scan loop that drives it.

use crate::retry::RetryPolicy;
use crate::{BoxFuture, HalError, RawSample};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// Ingestion modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// BLE radio scan
    Live,
    /// Simulated fermentation
    Mock,
    /// Recorded sample file
    Replay,
    /// Another FermWatch instance
    Relay,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanMode::Live => "live",
            ScanMode::Mock => "mock",
            ScanMode::Replay => "replay",
            ScanMode::Relay => "relay",
        };
        f.write_str(name)
    }
}

/// A lazy source of raw samples.
///
/// `next_sample` resolves to `Ok(None)` only when a finite source is
/// exhausted. Live sources never end; an error means the underlying
/// adapter needs a `reconnect`.
pub trait Scanner: Send {
    fn mode(&self) -> ScanMode;

    fn next_sample(&mut self) -> BoxFuture<'_, Result<Option<RawSample>, HalError>>;

    /// Re-establish the underlying connection after a failure.
    fn reconnect(&mut self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Why a scan loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanExit {
    /// Finite source ran out
    Exhausted,
    /// Shutdown was requested
    Shutdown,
    /// The receiving side went away
    ReceiverClosed,
    /// Retry budget spent or a non-transient error
    GaveUp,
}

/// Pull samples from `scanner` into `tx` until the source ends, the
/// receiver closes or `shutdown` flips to true.
///
/// Failures are logged and retried according to `policy`; a failed poll
/// yields nothing for that round.
pub async fn run_scanner(
    mut scanner: Box<dyn Scanner>,
    tx: mpsc::Sender<RawSample>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> ScanExit {
    let mode = scanner.mode();
    let mut backoff = policy.backoff();
    tracing::info!(%mode, "Scanner started");

    loop {
        if *shutdown.borrow() {
            return ScanExit::Shutdown;
        }

        let next = tokio::select! {
            next = scanner.next_sample() => next,
            _ = shutdown.changed() => return ScanExit::Shutdown,
        };

        match next {
            Ok(Some(sample)) => {
                backoff.record_success();
                if tx.send(sample).await.is_err() {
                    tracing::warn!(%mode, "Sample receiver closed, stopping scanner");
                    return ScanExit::ReceiverClosed;
                }
            }
            Ok(None) => {
                tracing::info!(%mode, "Scanner source exhausted");
                return ScanExit::Exhausted;
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(%mode, error = %e, "Scanner failed permanently");
                return ScanExit::GaveUp;
            }
            Err(e) => {
                let Some(delay) = backoff.record_failure() else {
                    tracing::error!(%mode, attempts = backoff.attempts(), "Scanner retry budget exhausted");
                    return ScanExit::GaveUp;
                };
                tracing::warn!(
                    %mode,
                    error = %e,
                    attempt = backoff.attempts(),
                    "Scan failed, retrying in {:?}",
                    delay
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return ScanExit::Shutdown,
                }

                if let Err(e) = scanner.reconnect().await {
                    tracing::warn!(%mode, error = %e, "Reconnect failed");
                }
            }
        }
    }
}
