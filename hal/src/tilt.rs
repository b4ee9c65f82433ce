//! Tilt hydrometer iBeacon decoding and the live BLE scanner.
//!
//! A Tilt advertises an Apple iBeacon frame. The manufacturer data is
//!
//! ```text
//! 4C 00 | 02 15 | UUID (16) | major (2, BE) | minor (2, BE) | tx power (1)
//! ```
//!
//! The UUID encodes the color, major carries temperature in °F and minor
//! carries specific gravity x 1000. The Tilt Pro sends both fields with an
//! extra decimal (°F x 10, SG x 10000).

use crate::scanner::{ScanMode, Scanner};
use crate::{fahrenheit_to_celsius, BoxFuture, DeviceKind, HalError, RawSample};
use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Apple company id followed by the iBeacon type/length bytes.
pub const IBEACON_PREFIX: [u8; 4] = [0x4C, 0x00, 0x02, 0x15];

/// Manufacturer data length of a complete iBeacon frame.
pub const IBEACON_LEN: usize = 25;

/// Minor values above this can only come from a high-resolution device.
const HIGH_RES_MINOR_THRESHOLD: u16 = 2000;

/// Tilt UUIDs are `A495BB?0-C5B1-4B44-B512-1370F02D74DE` with the color in
/// the `?` nibble.
const TILT_UUID_HEAD: [u8; 3] = [0xA4, 0x95, 0xBB];
const TILT_UUID_TAIL: [u8; 12] = [
    0xC5, 0xB1, 0x4B, 0x44, 0xB5, 0x12, 0x13, 0x70, 0xF0, 0x2D, 0x74, 0xDE,
];

/// Tilt colors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiltColor {
    Red,
    Green,
    Black,
    Purple,
    Orange,
    Blue,
    Yellow,
    Pink,
}

impl TiltColor {
    pub const ALL: [TiltColor; 8] = [
        TiltColor::Red,
        TiltColor::Green,
        TiltColor::Black,
        TiltColor::Purple,
        TiltColor::Orange,
        TiltColor::Blue,
        TiltColor::Yellow,
        TiltColor::Pink,
    ];

    fn from_uuid_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(TiltColor::Red),
            0x20 => Some(TiltColor::Green),
            0x30 => Some(TiltColor::Black),
            0x40 => Some(TiltColor::Purple),
            0x50 => Some(TiltColor::Orange),
            0x60 => Some(TiltColor::Blue),
            0x70 => Some(TiltColor::Yellow),
            0x80 => Some(TiltColor::Pink),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TiltColor::Red => "red",
            TiltColor::Green => "green",
            TiltColor::Black => "black",
            TiltColor::Purple => "purple",
            TiltColor::Orange => "orange",
            TiltColor::Blue => "blue",
            TiltColor::Yellow => "yellow",
            TiltColor::Pink => "pink",
        }
    }

    /// Device id used throughout FermWatch
    pub fn device_id(&self) -> String {
        format!("tilt:{}", self.name())
    }
}

/// Decoded Tilt frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltReading {
    pub color: TiltColor,
    pub gravity: f64,
    pub temp_f: f64,
    pub tx_power: i8,
    pub high_resolution: bool,
}

impl TiltReading {
    pub fn temp_c(&self) -> f64 {
        fahrenheit_to_celsius(self.temp_f)
    }
}

/// Decode iBeacon manufacturer data (company id included).
pub fn decode_tilt(data: &[u8]) -> Result<TiltReading, HalError> {
    if data.len() < IBEACON_LEN {
        return Err(HalError::MalformedPayload(format!(
            "iBeacon frame too short: {} bytes",
            data.len()
        )));
    }
    if data[..4] != IBEACON_PREFIX {
        return Err(HalError::MalformedPayload("not an iBeacon frame".to_string()));
    }

    let uuid = &data[4..20];
    if uuid[..3] != TILT_UUID_HEAD || uuid[4..] != TILT_UUID_TAIL {
        return Err(HalError::MalformedPayload("not a Tilt UUID".to_string()));
    }
    let color = TiltColor::from_uuid_byte(uuid[3])
        .ok_or_else(|| HalError::MalformedPayload(format!("unknown Tilt color 0x{:02X}", uuid[3])))?;

    let major = u16::from_be_bytes([data[20], data[21]]);
    let minor = u16::from_be_bytes([data[22], data[23]]);
    let tx_power = data[24] as i8;

    let high_resolution = minor > HIGH_RES_MINOR_THRESHOLD;
    let (gravity, temp_f) = if high_resolution {
        (minor as f64 / 10_000.0, major as f64 / 10.0)
    } else {
        (minor as f64 / 1_000.0, major as f64)
    };

    Ok(TiltReading { color, gravity, temp_f, tx_power, high_resolution })
}

/// Parse a hex string (whitespace and `:` separators allowed).
pub fn parse_hex(text: &str) -> Result<Vec<u8>, HalError> {
    let digits: String = text.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let stray = text.chars().any(|c| !(c.is_ascii_hexdigit() || c.is_whitespace() || c == ':'));
    if stray || digits.len() % 2 != 0 {
        return Err(HalError::MalformedPayload(format!("invalid hex: {}", text)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| HalError::MalformedPayload(e.to_string()))
        })
        .collect()
}

/// One BLE advertisement as seen by the radio
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub rssi: i32,
    pub manufacturer_data: Vec<u8>,
}

/// Anything that yields raw BLE advertisements.
pub trait AdvertisementSource: Send {
    fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Advertisement, HalError>>;

    fn restart(&mut self) -> BoxFuture<'_, Result<(), HalError>>;
}

/// Advertisements read from a helper process.
///
/// The helper prints one advertisement per line as
/// `<address> <rssi> <manufacturer data hex>`.
pub struct CommandAdvertisementSource {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl CommandAdvertisementSource {
    pub fn new(command: &[String]) -> Result<Self, HalError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| HalError::InvalidConfig("empty scan command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            child: None,
            lines: None,
        })
    }

    fn spawn(&mut self) -> Result<(), HalError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HalError::CommunicationError("scan helper has no stdout".to_string()))?;
        tracing::info!(program = %self.program, "BLE scan helper started");
        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }
}

/// Parse one helper output line.
pub fn parse_advertisement_line(line: &str) -> Result<Advertisement, HalError> {
    let mut parts = line.split_whitespace();
    let (Some(address), Some(rssi), Some(hex)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(HalError::MalformedPayload(format!("bad advertisement line: {}", line)));
    };
    let rssi = rssi
        .parse::<i32>()
        .map_err(|_| HalError::MalformedPayload(format!("bad rssi: {}", rssi)))?;
    Ok(Advertisement {
        address: address.to_string(),
        rssi,
        manufacturer_data: parse_hex(hex)?,
    })
}

impl AdvertisementSource for CommandAdvertisementSource {
    fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Advertisement, HalError>> {
        Box::pin(async move {
            if self.lines.is_none() {
                self.spawn()?;
            }
            let lines = self
                .lines
                .as_mut()
                .ok_or_else(|| HalError::Disconnected("scan helper not running".to_string()))?;
            loop {
                match lines.next_line().await? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => return parse_advertisement_line(&line),
                    None => {
                        self.lines = None;
                        return Err(HalError::Disconnected("scan helper exited".to_string()));
                    }
                }
            }
        })
    }

    fn restart(&mut self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async move {
            self.lines = None;
            if let Some(mut child) = self.child.take() {
                let _ = child.kill().await;
            }
            self.spawn()
        })
    }
}

/// Live radio scanner for Tilt hydrometers.
pub struct LiveScanner<S: AdvertisementSource> {
    source: S,
    rssi_floor: i32,
    clock: Arc<dyn Clock>,
}

impl<S: AdvertisementSource> LiveScanner<S> {
    pub fn new(source: S, rssi_floor: i32, clock: Arc<dyn Clock>) -> Self {
        Self { source, rssi_floor, clock }
    }
}

impl<S: AdvertisementSource> Scanner for LiveScanner<S> {
    fn mode(&self) -> ScanMode {
        ScanMode::Live
    }

    fn next_sample(&mut self) -> BoxFuture<'_, Result<Option<RawSample>, HalError>> {
        Box::pin(async move {
            loop {
                let adv = self.source.next_advertisement().await?;

                // Other beacons share the air; only Tilt frames are ours.
                let reading = match decode_tilt(&adv.manufacturer_data) {
                    Ok(r) => r,
                    Err(_) => continue,
                };

                if adv.rssi < self.rssi_floor {
                    tracing::trace!(
                        device_id = %reading.color.device_id(),
                        rssi = adv.rssi,
                        "Dropping weak advertisement"
                    );
                    continue;
                }

                return Ok(Some(RawSample {
                    device_id: reading.color.device_id(),
                    kind: DeviceKind::Tilt {
                        color: reading.color,
                        high_resolution: reading.high_resolution,
                    },
                    sg_raw: reading.gravity,
                    temp_raw: reading.temp_c(),
                    signal_strength: adv.rssi,
                    observed_at: self.clock.now(),
                }));
            }
        })
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<(), HalError>> {
        self.source.restart()
    }
}

/// Build the manufacturer data a Tilt would send. Used by the CLI and tests.
pub fn encode_tilt(color: TiltColor, gravity: f64, temp_f: f64, high_resolution: bool) -> Vec<u8> {
    let (major, minor) = if high_resolution {
        ((temp_f * 10.0).round() as u16, (gravity * 10_000.0).round() as u16)
    } else {
        (temp_f.round() as u16, (gravity * 1_000.0).round() as u16)
    };
    let color_byte = match color {
        TiltColor::Red => 0x10,
        TiltColor::Green => 0x20,
        TiltColor::Black => 0x30,
        TiltColor::Purple => 0x40,
        TiltColor::Orange => 0x50,
        TiltColor::Blue => 0x60,
        TiltColor::Yellow => 0x70,
        TiltColor::Pink => 0x80,
    };

    let mut data = Vec::with_capacity(IBEACON_LEN);
    data.extend_from_slice(&IBEACON_PREFIX);
    data.extend_from_slice(&TILT_UUID_HEAD);
    data.push(color_byte);
    data.extend_from_slice(&TILT_UUID_TAIL);
    data.extend_from_slice(&major.to_be_bytes());
    data.extend_from_slice(&minor.to_be_bytes());
    data.push(0xC5);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;

    const RED_FRAME: &str = "4c000215a495bb10c5b14b44b5121370f02d74de00440414c5";

    #[test]
    fn decodes_standard_frame() {
        let data = parse_hex(RED_FRAME).unwrap();
        let reading = decode_tilt(&data).unwrap();
        assert_eq!(reading.color, TiltColor::Red);
        // major 0x0044 = 68 °F, minor 0x0414 = 1044
        assert_eq!(reading.temp_f, 68.0);
        assert!((reading.gravity - 1.044).abs() < 1e-9);
        assert!((reading.temp_c() - 20.0).abs() < 1e-9);
        assert!(!reading.high_resolution);
        assert_eq!(reading.tx_power, -59);
    }

    #[test]
    fn decodes_high_resolution_frame() {
        let data = encode_tilt(TiltColor::Blue, 1.0523, 67.4, true);
        let reading = decode_tilt(&data).unwrap();
        assert_eq!(reading.color, TiltColor::Blue);
        assert!(reading.high_resolution);
        assert!((reading.gravity - 1.0523).abs() < 1e-9);
        assert!((reading.temp_f - 67.4).abs() < 1e-9);
    }

    #[test]
    fn rejects_foreign_beacons() {
        let mut data = parse_hex(RED_FRAME).unwrap();
        data[5] = 0x00;
        assert!(matches!(decode_tilt(&data), Err(HalError::MalformedPayload(_))));
        assert!(decode_tilt(&data[..10]).is_err());

        let mut unknown_color = parse_hex(RED_FRAME).unwrap();
        unknown_color[7] = 0x90;
        assert!(decode_tilt(&unknown_color).is_err());
    }

    #[test]
    fn parses_helper_lines() {
        let adv = parse_advertisement_line(&format!("AA:BB:CC:DD:EE:FF -71 {}", RED_FRAME)).unwrap();
        assert_eq!(adv.rssi, -71);
        assert_eq!(adv.manufacturer_data.len(), IBEACON_LEN);
        assert!(parse_advertisement_line("AA:BB -71").is_err());
        assert!(parse_hex("zz").is_err());
    }

    struct Canned(VecDeque<Advertisement>);

    impl AdvertisementSource for Canned {
        fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Advertisement, HalError>> {
            let next = self
                .0
                .pop_front()
                .ok_or_else(|| HalError::Disconnected("no more advertisements".into()));
            Box::pin(async move { next })
        }

        fn restart(&mut self) -> BoxFuture<'_, Result<(), HalError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn live_scanner_filters_weak_and_foreign_frames() {
        let tilt = encode_tilt(TiltColor::Green, 1.050, 66.0, false);
        let source = Canned(VecDeque::from(vec![
            Advertisement { address: "a".into(), rssi: -60, manufacturer_data: vec![0x4C, 0x00] },
            Advertisement { address: "b".into(), rssi: -99, manufacturer_data: tilt.clone() },
            Advertisement { address: "c".into(), rssi: -70, manufacturer_data: tilt },
        ]));
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut scanner = LiveScanner::new(source, -90, Arc::new(ManualClock::new(start)));

        let sample = scanner.next_sample().await.unwrap().unwrap();
        assert_eq!(sample.device_id, "tilt:green");
        assert_eq!(sample.signal_strength, -70);
        assert!((sample.sg_raw - 1.050).abs() < 1e-9);
        assert!((sample.temp_raw - fahrenheit_to_celsius(66.0)).abs() < 1e-9);
        assert_eq!(sample.observed_at, start);

        assert!(scanner.next_sample().await.is_err());
    }
}
