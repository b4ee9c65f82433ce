//! FermWatch CLI Tool
//!
//! Command-line interface for inspecting recorded sessions, decoding
//! beacon payloads and replaying sample files offline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fermwatch_hal::replay::ReplayScanner;
use fermwatch_hal::tilt::{decode_tilt, parse_hex};
use fermwatch_hal::{Scanner, SystemClock};
use fermwatch_sensors::control::ControlEventKind;
use fermwatch_sensors::recording::{RecordingSession, SessionRecorder};
use fermwatch_sensors::{DeviceCalibration, FusedReading, PipelineManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "fermwatch-cli")]
#[command(author = "FermWatch Team")]
#[command(version = "0.1.0")]
#[command(about = "FermWatch Fermentation Monitor CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Recording directory
    #[arg(short, long, default_value = "/var/lib/fermwatch/sessions")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List recording sessions
    Sessions {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show fused readings from a session
    Readings {
        /// Session ID
        session_id: String,

        /// Only this device
        #[arg(short, long)]
        device: Option<String>,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show control events from a session
    Events {
        /// Session ID
        session_id: String,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Run a recorded samples.jsonl through calibration and fusion
    Replay {
        /// Sample file
        file: PathBuf,

        /// Configuration with calibration curves and fusion settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only this device
        #[arg(short, long)]
        device: Option<String>,

        /// Final gravity for completion estimates (default: the target_sg of
        /// the device's active batch in the configuration)
        #[arg(long)]
        target_sg: Option<f64>,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Decode a Tilt iBeacon manufacturer payload
    Decode {
        /// Hex bytes, company id included
        hex: String,

        /// Signal strength to report alongside
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        rssi: i32,
    },

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sessions { verbose } => {
            list_sessions(&cli.data_dir, verbose)?;
        }

        Commands::Readings { session_id, device, format } => {
            show_readings(&cli.data_dir, &session_id, device.as_deref(), &format)?;
        }

        Commands::Events { session_id, format } => {
            show_events(&cli.data_dir, &session_id, &format)?;
        }

        Commands::Replay { file, config, device, target_sg, format } => {
            replay(&file, config.as_deref(), device.as_deref(), target_sg, &format)?;
        }

        Commands::Decode { hex, rssi } => {
            decode(&hex, rssi)?;
        }

        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn list_sessions(data_dir: &Path, verbose: bool) -> Result<()> {
    let recorder = SessionRecorder::new(data_dir)?;
    let sessions = recorder.list_sessions()?;

    if sessions.is_empty() {
        println!("No recording sessions found.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!("╭──────────────────────────────────────────────────────────────────────────────╮");
    println!("│                              Recording Sessions                              │");
    println!("├──────────────────────────┬──────────────────┬──────────┬──────────┬──────────┤");
    println!("│ Session ID               │ Name             │ Samples  │ Events   │ Duration │");
    println!("├──────────────────────────┼──────────────────┼──────────┼──────────┼──────────┤");

    for session in &sessions {
        println!("│ {:24} │ {:16} │ {:>8} │ {:>8} │ {:>8} │",
            truncate(&session.id, 24),
            truncate(&session.name, 16),
            session.sample_count,
            session.event_count,
            format_duration(session.duration(now)));
    }

    println!("╰──────────────────────────┴──────────────────┴──────────┴──────────┴──────────╯");

    if verbose {
        for session in &sessions {
            print_session(session);
        }
    }

    Ok(())
}

fn print_session(session: &RecordingSession) {
    println!("\n{}", "─".repeat(60));
    println!("Session: {}", session.id);
    println!("  Name: {}", session.name);
    println!("  Start: {}", session.start_time);
    match session.end_time {
        Some(end) => println!("  End: {}", end),
        None => println!("  End: (open)"),
    }
    println!("  Samples: {}", session.sample_count);
    println!("  Readings: {}", session.reading_count);
    println!("  Control events: {}", session.event_count);

    if !session.notes.is_empty() {
        println!("  Notes:");
        for note in &session.notes {
            println!("    - {}", note);
        }
    }
}

fn show_readings(data_dir: &Path, session_id: &str, device: Option<&str>, format: &str) -> Result<()> {
    let recorder = SessionRecorder::new(data_dir)?;
    let mut readings = recorder.load_readings(session_id)?;

    if let Some(device) = device {
        readings.retain(|r| r.device_id == device);
    }

    if readings.is_empty() {
        println!("No readings found matching criteria.");
        return Ok(());
    }

    print_readings(&readings, format)
}

fn print_readings(readings: &[FusedReading], format: &str) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(readings)?;
            println!("{}", json);
        }
        _ => {
            println!("╭──────────────────────────────────────────────────────────────────────────────────╮");
            println!("│                                  Fused Readings                                  │");
            println!("├─────────────────────┬──────────────────┬─────────┬─────────┬────────┬────────────┤");
            println!("│ Time (UTC)          │ Device           │ SG      │ Temp °C │ Conf   │ Flags      │");
            println!("├─────────────────────┼──────────────────┼─────────┼─────────┼────────┼────────────┤");

            for reading in readings {
                println!("│ {:19} │ {:16} │ {:>7.4} │ {:>7.2} │ {:>5.1}% │ {:10} │",
                    reading.observed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    truncate(&reading.device_id, 16),
                    reading.sg_filtered,
                    reading.temp_filtered_c,
                    reading.confidence * 100.0,
                    truncate(&reading_flags(reading), 10));
            }

            println!("╰─────────────────────┴──────────────────┴─────────┴─────────┴────────┴────────────╯");
            println!("\nTotal readings: {}", readings.len());
        }
    }

    Ok(())
}

/// Short marker column: anomaly and degraded conditions.
fn reading_flags(reading: &FusedReading) -> String {
    let mut flags = Vec::new();
    if reading.anomaly {
        flags.push("anomaly".to_string());
    }
    let condition = serde_json::to_value(reading.condition)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    if !condition.is_empty() && condition != "nominal" {
        flags.push(condition);
    }
    flags.join(",")
}

fn show_events(data_dir: &Path, session_id: &str, format: &str) -> Result<()> {
    let recorder = SessionRecorder::new(data_dir)?;
    let events = recorder.load_events(session_id)?;

    if events.is_empty() {
        println!("No control events recorded.");
        return Ok(());
    }

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&events)?;
            println!("{}", json);
        }
        _ => {
            println!("╭─────────────────────────────────────────────────────────────────────────╮");
            println!("│                              Control Log                                │");
            println!("├─────────────────────┬──────────────────┬────────────────────────────────┤");
            println!("│ Time (UTC)          │ Batch            │ Event                          │");
            println!("├─────────────────────┼──────────────────┼────────────────────────────────┤");

            for event in &events {
                println!("│ {:19} │ {:16} │ {:30} │",
                    event.at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    truncate(&event.batch_id, 16),
                    truncate(&describe(&event.kind), 30));
            }

            println!("╰─────────────────────┴──────────────────┴────────────────────────────────╯");
            println!("\nTotal events: {}", events.len());
        }
    }

    Ok(())
}

fn describe(kind: &ControlEventKind) -> String {
    match kind {
        ControlEventKind::Activated => "activated".to_string(),
        ControlEventKind::Deactivated => "deactivated".to_string(),
        ControlEventKind::Switched { role, state, temp_c, .. } => match temp_c {
            Some(t) => format!("{} {} at {:.2}°C", role, state, t),
            None => format!("{} {}", role, state),
        },
        ControlEventKind::ActuatorFailed { role, state, .. } => format!("{} {} FAILED", role, state),
        ControlEventKind::OverrideSet { role, state, expires_at } => {
            format!("override {} {} until {}", role, state, expires_at.format("%H:%M"))
        }
        ControlEventKind::OverrideCleared { role } => format!("override {} cleared", role),
        ControlEventKind::OverrideExpired { role } => format!("override {} expired", role),
        ControlEventKind::ConditionChanged { condition } => {
            let condition = serde_json::to_value(condition)
                .ok()
                .and_then(|v| v.get("condition").and_then(|c| c.as_str()).map(str::to_string))
                .unwrap_or_default();
            format!("condition {}", condition)
        }
    }
}

/// Target gravity used for `device_id` while replaying
fn replay_target(config: &AppConfig, device_id: &str, target_sg: Option<f64>) -> Option<f64> {
    target_sg.or_else(|| {
        config
            .batches
            .iter()
            .filter(|b| b.status.is_active() && b.device_id.as_deref() == Some(device_id))
            .find_map(|b| b.target_sg)
    })
}

fn replay(
    file: &Path,
    config_path: Option<&Path>,
    device: Option<&str>,
    target_sg: Option<f64>,
    format: &str,
) -> Result<()> {
    let config = match config_path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let calibrations = config.calibrations();
    let manager = PipelineManager::new(config.fusion.clone(), Arc::new(SystemClock));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let mut readings = Vec::new();
    runtime.block_on(async {
        let mut scanner = ReplayScanner::new(file, 0.0);
        while let Some(sample) = scanner
            .next_sample()
            .await
            .with_context(|| format!("reading {}", file.display()))?
        {
            let calibrated = match calibrations.get(&sample.device_id) {
                Some(calibration) => calibration.apply(&sample),
                None => DeviceCalibration::default().apply(&sample),
            };
            manager.set_target_gravity(&sample.device_id, replay_target(&config, &sample.device_id, target_sg));
            readings.push(manager.process(&calibrated));
        }
        anyhow::Ok(())
    })?;

    if let Some(device) = device {
        readings.retain(|r| r.device_id == device);
    }
    if readings.is_empty() {
        println!("No samples replayed.");
        return Ok(());
    }

    print_readings(&readings, format)?;

    if format != "json" {
        println!("\nDevices:");
        for id in manager.devices() {
            let last = readings.iter().rev().find(|r| r.device_id == id);
            if let Some(last) = last {
                let eta = last
                    .predicted_completion
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {}: {:.4} SG, {:.2}°C, completion {}", id, last.sg_filtered, last.temp_filtered_c, eta);
            }
        }
    }

    Ok(())
}

fn decode(hex: &str, rssi: i32) -> Result<()> {
    let bytes = parse_hex(hex)?;
    let reading = decode_tilt(&bytes)?;

    println!("╭──────────────────────────────────────────╮");
    println!("│             Tilt Advertisement           │");
    println!("╰──────────────────────────────────────────╯\n");
    println!("  Device: {}", reading.color.device_id());
    println!("  Color: {}", reading.color.name());
    println!("  Model: {}", if reading.high_resolution { "Tilt Pro" } else { "Tilt" });
    println!("  Gravity: {:.4}", reading.gravity);
    println!("  Temperature: {:.1}°F ({:.2}°C)", reading.temp_f, reading.temp_c());
    println!("  TX power: {} dBm", reading.tx_power);
    println!("  RSSI: {} dBm", rssi);

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = format!(
        "# FermWatch Configuration File\n\
         #\n\
         # Copy this file to /etc/fermwatch/config.toml or ~/.config/fermwatch/config.toml\n\n{}",
        AppConfig::example()
    );

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn format_duration(duration: chrono::Duration) -> String {
    format!("{}:{:02}:{:02}",
        duration.num_hours(),
        duration.num_minutes() % 60,
        duration.num_seconds() % 60)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
