//! Mock Scanner Example
//!
//! Runs a simulated fermentation at 3600x speed and prints raw samples.

use fermwatch_hal::mock::MockScanner;
use fermwatch_hal::scanner::{run_scanner, ScanExit};
use fermwatch_hal::{RetryPolicy, SystemClock};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("fermwatch_hal=info")
        .init();

    println!("╔══════════════════════════════════════╗");
    println!("║     FermWatch Mock Hydrometers       ║");
    println!("╚══════════════════════════════════════╝\n");

    let scanner = MockScanner::new(vec!["tilt:red".into(), "tilt:green".into()], Arc::new(SystemClock))
        .with_interval(Duration::from_millis(250))
        .with_time_scale(3600.0);

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(run_scanner(Box::new(scanner), tx, RetryPolicy::default(), shutdown));

    for _ in 0..20 {
        let Some(sample) = rx.recv().await else { break };
        println!("  {:12} SG {:.4}  {:5.2}°C  RSSI {} dBm",
            sample.device_id,
            sample.sg_raw,
            sample.temp_raw,
            sample.signal_strength);
    }

    stop.send(true)?;
    let exit: ScanExit = task.await?;
    println!("\nScanner stopped: {:?}", exit);

    Ok(())
}
