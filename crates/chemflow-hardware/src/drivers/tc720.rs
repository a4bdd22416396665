//! TE Technology TC-720 thermoelectric temperature controller.
//!
//! Protocol Overview:
//! - Baud: 230400, 8N1, no flow control
//! - Command frame (10 bytes): `*` + 2-char command + 4 hex digits + 2 hex
//!   checksum + CR. The checksum is the byte sum of the six body characters,
//!   modulo 256, as two lowercase hex digits.
//! - Reply frame (8 bytes): `*` + 4 hex digits + 2 hex checksum of those four
//!   digits + `^`
//! - Values are signed 16-bit integers in hundredths of a degree
//!
//! Commands used here: `1c` write set point, `01` read input 1, `04` read input 2.
//! The controller paces poorly at full speed, so frames go out one byte at a time.

use async_trait::async_trait;
use chemflow_core::capabilities::{Sensor, TemperatureController};
use chemflow_core::serial::{PortOpener, SerialLink};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 230_400;

/// Set point applied by `stop()`.
pub const SAFE_SET_POINT_C: f64 = 25.0;

const SET_POINT: &str = "1c";
const REPLY_LEN: usize = 8;
const BYTE_PACING: Duration = Duration::from_millis(5);

/// Allowed set-point range (°C).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeRange {
    /// Lowest accepted set point
    pub min_c: f64,
    /// Highest accepted set point
    pub max_c: f64,
}

impl Default for SafeRange {
    fn default() -> Self {
        Self {
            min_c: -20.0,
            max_c: 100.0,
        }
    }
}

impl SafeRange {
    fn check(&self, celsius: f64) -> LabResult<()> {
        if celsius.is_finite() && (self.min_c..=self.max_c).contains(&celsius) {
            Ok(())
        } else {
            Err(LabError::validation(format!(
                "set point {celsius} °C outside safe range {}..={} °C",
                self.min_c, self.max_c
            )))
        }
    }
}

/// Sum of the bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a command frame for `command` with a signed payload.
pub fn encode_frame(command: &str, value: i16) -> Vec<u8> {
    let body = format!("{command}{:04x}", value as u16);
    let sum = checksum(body.as_bytes());
    format!("*{body}{sum:02x}\r").into_bytes()
}

/// Build the set-point frame for `celsius`.
pub fn encode_set_point(celsius: f64, range: &SafeRange) -> LabResult<Vec<u8>> {
    range.check(celsius)?;
    let hundredths = (celsius * 100.0).round() as i16;
    Ok(encode_frame(SET_POINT, hundredths))
}

/// Query frame for one sensor input.
pub fn encode_query(sensor: Sensor) -> Vec<u8> {
    let command = match sensor {
        Sensor::Input1 => "01",
        Sensor::Input2 => "04",
    };
    encode_frame(command, 0)
}

/// Decode and verify an 8-byte reply, returning degrees Celsius.
pub fn decode_reply(device: &str, reply: &[u8]) -> LabResult<f64> {
    if reply.len() != REPLY_LEN || reply[0] != b'*' || reply[REPLY_LEN - 1] != b'^' {
        return Err(LabError::parse(
            device,
            format!("malformed reply {:?}", String::from_utf8_lossy(reply)),
        ));
    }
    let data = &reply[1..5];
    let received = String::from_utf8_lossy(&reply[5..7]).into_owned();
    let expected = checksum(data);
    if received != format!("{expected:02x}") {
        return Err(LabError::Checksum {
            device: device.to_string(),
            expected,
            received,
        });
    }
    let digits = std::str::from_utf8(data)
        .map_err(|_| LabError::parse(device, "reply value is not ASCII"))?;
    let raw = u16::from_str_radix(digits, 16)
        .map_err(|_| LabError::parse(device, format!("reply value {digits:?} is not hex")))?;
    Ok(f64::from(raw as i16) / 100.0)
}

/// Split a command frame back into `(command, value)`, verifying its checksum.
pub fn decode_command_frame(frame: &[u8]) -> Option<(String, i16)> {
    if frame.len() != 10 || frame[0] != b'*' || frame[9] != b'\r' {
        return None;
    }
    let body = &frame[1..7];
    let sum = std::str::from_utf8(&frame[7..9]).ok()?;
    if sum != format!("{:02x}", checksum(body)) {
        return None;
    }
    let body = std::str::from_utf8(body).ok()?;
    let value = u16::from_str_radix(&body[2..], 16).ok()? as i16;
    Some((body[..2].to_string(), value))
}

/// Driver for a TC-720 controller.
pub struct Tc720 {
    name: String,
    link: SerialLink,
    state: ConnectionCell,
    range: SafeRange,
}

impl Tc720 {
    /// New, unconnected controller.
    pub fn new(
        name: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        timeout: Duration,
        range: SafeRange,
    ) -> Self {
        let name = name.into();
        Self {
            link: SerialLink::new(name.clone(), opener, timeout),
            name,
            state: ConnectionCell::new(),
            range,
        }
    }

    /// Configured set-point range.
    pub fn range(&self) -> SafeRange {
        self.range
    }

    async fn exchange(&self, frame: &[u8], drain: bool) -> LabResult<f64> {
        let command = String::from_utf8_lossy(frame).trim_end().to_string();
        let mut session = self.link.session().await?;
        if drain {
            session.drain(Duration::from_millis(20)).await;
        }
        for byte in frame {
            session.write_all(&[*byte]).await?;
            tokio::time::sleep(BYTE_PACING).await;
        }
        let reply = session.read_exact(REPLY_LEN, &command).await?;
        decode_reply(&self.name, &reply)
    }
}

#[async_trait]
impl Device for Tc720 {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[instrument(skip(self), fields(device = %self.name, port = self.link.address()), err)]
    async fn connect(&self) -> LabResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.link.open().await {
            self.state.set(ConnectionState::Error);
            return Err(e);
        }
        match self.read_temperature(Sensor::Input1).await {
            Ok(celsius) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, celsius, "temperature controller connected");
                Ok(())
            }
            Err(e) => {
                self.link.close().await;
                self.state.set(ConnectionState::Error);
                Err(LabError::connection(&self.name, format!("no answer to sensor probe: {e}")))
            }
        }
    }

    async fn close(&self) -> LabResult<()> {
        self.link.close().await;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn stop(&self) -> LabResult<()> {
        if !self.link.is_open().await {
            return Ok(());
        }
        self.set_temperature(SAFE_SET_POINT_C).await.map(|_| ())
    }
}

#[async_trait]
impl TemperatureController for Tc720 {
    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn set_temperature(&self, celsius: f64) -> LabResult<f64> {
        let frame = encode_set_point(celsius, &self.range)?;
        let echoed = self.exchange(&frame, false).await?;
        let requested = (celsius * 100.0).round() / 100.0;
        if (echoed - requested).abs() > 0.005 {
            return Err(LabError::parse(
                &self.name,
                format!("set point echo {echoed} °C does not match {requested} °C"),
            ));
        }
        tracing::info!(device = %self.name, set_point = echoed, "set point applied");
        Ok(echoed)
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn read_temperature(&self, sensor: Sensor) -> LabResult<f64> {
        self.exchange(&encode_query(sensor), true).await
    }
}
