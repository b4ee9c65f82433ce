//! FermWatch Fermentation Monitor
//!
//! Main application entry point: scanners, fusion, batch control and the
//! HTTP/websocket server in one process.

use anyhow::Result;
use clap::Parser;
use fermwatch_hal::actuator::{ControlSurface, DryRunSurface, HomeAssistantSurface};
use fermwatch_hal::mock::MockScanner;
use fermwatch_hal::relay::{HttpSampleFetcher, RelayScanner};
use fermwatch_hal::replay::ReplayScanner;
use fermwatch_hal::tilt::{CommandAdvertisementSource, LiveScanner};
use fermwatch_hal::{run_scanner, Clock, ScanMode, Scanner, SystemClock};
use fermwatch_sensors::control_loop::ControlLoop;
use fermwatch_sensors::hub::BroadcastHub;
use fermwatch_sensors::linker::{BatchDirectory, BatchLinker, FileBatchDirectory, StaticBatchDirectory};
use fermwatch_sensors::recording::SessionRecorder;
use fermwatch_sensors::{PipelineManager, ReadingStore};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod config;
mod dispatch;
mod server;

use config::{AppConfig, LogFormat, ScannerConfig};
use dispatch::Dispatcher;
use server::AppState;

/// Depth of the queue between scanners and the dispatcher
const SAMPLE_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "fermwatch")]
#[command(author = "FermWatch Team")]
#[command(version = "0.1.0")]
#[command(about = "Fermentation monitor and temperature controller")]
struct Args {
    /// Configuration file (default: standard search paths)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.bind
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    // Initialize logging
    init_logging(config.log_format);

    tracing::info!("╔══════════════════════════════════════════╗");
    tracing::info!("║      FermWatch Fermentation Monitor      ║");
    tracing::info!("║            Version 0.1.0                 ║");
    tracing::info!("╚══════════════════════════════════════════╝");

    if config.config_path.as_os_str().is_empty() {
        tracing::warn!("No configuration file found, using defaults");
    } else {
        tracing::info!("Configuration loaded from {:?}", config.config_path);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Fusion
    let manager = Arc::new(PipelineManager::new(config.fusion.clone(), clock.clone()));
    let store = Arc::new(ReadingStore::new());
    let hub = Arc::new(BroadcastHub::new(config.server.hub_capacity));

    // Batches
    let directory: Arc<dyn BatchDirectory> = match &config.batches_file {
        Some(path) => Arc::new(FileBatchDirectory::new(path)),
        None => Arc::new(StaticBatchDirectory::new(config.batches.clone())),
    };
    let linker = Arc::new(BatchLinker::new(
        directory,
        clock.clone(),
        chrono::Duration::seconds(config.batch_refresh_secs.max(1) as i64),
    ));
    if let Err(e) = linker.refresh().await {
        tracing::warn!(error = %e, "Initial batch refresh failed, retrying on the control tick");
    }
    tracing::info!("{} active batches", linker.active_batches().len());

    // Recorder
    let recorder = if config.recording.enabled {
        let mut recorder = SessionRecorder::new(&config.recording.path)?;
        recorder.start_session(&config.recording.session_name, clock.now())?;
        recorder.add_note(
            &format!("{} scanner, listening on {}", config.scanner.mode, config.server.bind),
            clock.now(),
        );
        Some(Arc::new(Mutex::new(recorder)))
    } else {
        None
    };

    let surface = build_surface(&config)?;
    let scanner = build_scanner(&config.scanner, clock.clone())?;

    print_config_summary(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_QUEUE);

    let mut scanner_task = tokio::spawn(run_scanner(
        scanner,
        sample_tx.clone(),
        config.retry.clone(),
        shutdown_rx.clone(),
    ));

    let dispatcher = Dispatcher {
        calibrations: config.calibrations(),
        manager: manager.clone(),
        linker: linker.clone(),
        store: store.clone(),
        hub: hub.clone(),
        recorder: recorder.clone(),
    };
    let dispatch_task = tokio::spawn(dispatcher.run(sample_rx));

    let (mut control, control_handle) = ControlLoop::new(
        config.control.clone(),
        linker.clone(),
        store.clone(),
        surface,
        clock.clone(),
    );
    control = control.with_hub(hub.clone()).with_manager(manager.clone());
    if let Some(recorder) = &recorder {
        control = control.with_recorder(recorder.clone());
    }
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));

    let state = AppState {
        ingest: sample_tx,
        store: store.clone(),
        hub: hub.clone(),
        control: control_handle,
        clock: clock.clone(),
    };
    let bind = config.server.bind.clone();
    let server_shutdown = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move { server::serve(&bind, state, server_shutdown).await });

    tracing::info!("FermWatch is monitoring");
    tracing::info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    let mut scanner_done = false;
    let mut server_done = false;
    while !server_done {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            exit = &mut scanner_task, if !scanner_done => {
                scanner_done = true;
                match exit {
                    Ok(exit) => {
                        tracing::info!(?exit, "Scanner stopped, still serving ingest and control");
                        note(recorder.as_ref(), &format!("scanner stopped: {:?}", exit), clock.now());
                    }
                    Err(e) => tracing::error!("Scanner task panicked: {}", e),
                }
            }
            result = &mut server_task => {
                server_done = true;
                match result {
                    Ok(Ok(())) => tracing::warn!("HTTP server ended unexpectedly"),
                    Ok(Err(e)) => {
                        tracing::error!("HTTP server failed: {:#}", e);
                        note(recorder.as_ref(), &format!("HTTP server failed: {:#}", e), clock.now());
                    }
                    Err(e) => tracing::error!("HTTP server task panicked: {}", e),
                }
            }
        }
    }

    // Cleanup
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    // A tick in progress finishes before the loop exits
    if let Err(e) = control_task.await {
        tracing::error!("Control task panicked: {}", e);
    }
    if !server_done {
        let _ = server_task.await;
    }
    if !scanner_done {
        let _ = scanner_task.await;
    }
    // All senders are gone now; let the dispatcher drain
    if tokio::time::timeout(Duration::from_secs(5), dispatch_task).await.is_err() {
        tracing::warn!("Dispatcher did not drain in time");
    }

    // End recording session
    if let Some(recorder) = &recorder {
        let mut recorder = recorder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = recorder.end_session(clock.now())? {
            tracing::info!(
                "Recording session ended: {} samples, {} readings, {} control events",
                session.sample_count,
                session.reading_count,
                session.event_count
            );
        }
    }

    tracing::info!("FermWatch shutdown complete");

    Ok(())
}

/// Annotate the recording session, if one is running.
fn note(recorder: Option<&Arc<Mutex<SessionRecorder>>>, text: &str, now: chrono::DateTime<chrono::Utc>) {
    if let Some(recorder) = recorder {
        recorder.lock().unwrap_or_else(|e| e.into_inner()).add_note(text, now);
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fermwatch=debug,fermwatch_hal=debug,fermwatch_sensors=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init(),
    }
}

fn build_scanner(config: &ScannerConfig, clock: Arc<dyn Clock>) -> Result<Box<dyn Scanner>> {
    let scanner: Box<dyn Scanner> = match config.mode {
        ScanMode::Live => {
            let source = CommandAdvertisementSource::new(&config.scan_command)?;
            Box::new(LiveScanner::new(source, config.rssi_floor, clock))
        }
        ScanMode::Mock => Box::new(
            MockScanner::new(config.mock_devices.clone(), clock)
                .with_interval(Duration::from_millis(config.mock_interval_ms))
                .with_time_scale(config.time_scale),
        ),
        ScanMode::Replay => {
            let path = config
                .replay_file
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("replay mode needs scanner.replay_file"))?;
            Box::new(ReplayScanner::new(path, config.time_scale))
        }
        ScanMode::Relay => {
            let url = config
                .relay_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("relay mode needs scanner.relay_url"))?;
            let fetcher = HttpSampleFetcher::new(url, Duration::from_secs(10))?;
            Box::new(RelayScanner::new(fetcher, Duration::from_secs(config.poll_interval_secs.max(1))))
        }
    };
    Ok(scanner)
}

fn build_surface(config: &AppConfig) -> Result<Arc<dyn ControlSurface>> {
    match &config.home_assistant {
        Some(ha) => {
            let token = ha.resolve_token()?;
            let surface = HomeAssistantSurface::new(&ha.url, &token, Duration::from_secs(ha.timeout_secs))?;
            tracing::info!(url = %ha.url, "Switching through Home Assistant");
            Ok(Arc::new(surface))
        }
        None => {
            tracing::warn!("No Home Assistant configured, switch commands are only logged");
            Ok(Arc::new(DryRunSurface))
        }
    }
}

fn print_config_summary(config: &AppConfig) {
    tracing::info!("╭──────────────── Configuration ────────────────╮");
    tracing::info!("│ Scanner: {:>36} │", config.scanner.mode.to_string());
    tracing::info!("│ Listening on: {:>31} │", config.server.bind);
    tracing::info!("│ Calibrated devices: {:>25} │", config.devices.len());
    tracing::info!("│ Control tick: {:>29} s │", config.control.tick_secs);
    tracing::info!("│ Hysteresis: {:>30} °C │", config.control.hysteresis_c);
    tracing::info!("│ Min cycle: {:>32} s │", config.control.min_cycle_secs);
    tracing::info!("│ Recording: {:>34} │", if config.recording.enabled { "on" } else { "off" });
    tracing::info!("╰───────────────────────────────────────────────╯");
}
