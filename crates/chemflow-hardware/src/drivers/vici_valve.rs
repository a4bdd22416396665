//! VICI Valco multi-position selector valve (universal electric actuator).
//!
//! Protocol Overview:
//! - Format: ASCII commands terminated by CR (`\r`)
//! - Baud: 9600, 8N1, no flow control
//! - Mutating commands (`HM`, `GOnn`, `CW`, `CC`, ...) are write-only
//! - Queries (`CP`, `VR`) answer with one CR-terminated line, e.g. `CP03`
//!
//! The stator size is programmed with `NPnn` on every connect, so a valve that
//! was swapped between runs is reconfigured before the first move.

use async_trait::async_trait;
use chemflow_core::capabilities::{check_position, SelectorValve};
use chemflow_core::serial::{PortOpener, SerialLink};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 9600;

static FIRST_INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)").expect("Invalid position regex"));

/// Stator size of a selector valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ValveKindRepr", into = "ValveKindRepr")]
pub enum ValveKind {
    /// 6 positions
    SixWay,
    /// 10 positions
    TenWay,
    /// 24 positions
    TwentyFourWay,
    /// Any even count between 2 and 40
    Custom(u8),
}

impl ValveKind {
    /// Build from a position count.
    pub fn from_positions(positions: u8) -> LabResult<Self> {
        match positions {
            6 => Ok(ValveKind::SixWay),
            10 => Ok(ValveKind::TenWay),
            24 => Ok(ValveKind::TwentyFourWay),
            n if n % 2 == 0 && (2..=40).contains(&n) => Ok(ValveKind::Custom(n)),
            n => Err(LabError::validation(format!(
                "valve positions must be an even number between 2 and 40, got {n}"
            ))),
        }
    }

    /// Number of positions.
    pub fn positions(self) -> u8 {
        match self {
            ValveKind::SixWay => 6,
            ValveKind::TenWay => 10,
            ValveKind::TwentyFourWay => 24,
            ValveKind::Custom(n) => n,
        }
    }
}

impl std::str::FromStr for ValveKind {
    type Err = LabError;

    /// Accepts `6-way`, `10way`, `24 - way` and bare counts.
    fn from_str(s: &str) -> LabResult<Self> {
        let key: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "6way" => Ok(ValveKind::SixWay),
            "10way" => Ok(ValveKind::TenWay),
            "24way" => Ok(ValveKind::TwentyFourWay),
            other => other
                .parse::<u8>()
                .map_err(|_| LabError::validation(format!("unknown valve type '{s}'")))
                .and_then(ValveKind::from_positions),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ValveKindRepr {
    Positions(u8),
    Name(String),
}

impl TryFrom<ValveKindRepr> for ValveKind {
    type Error = LabError;

    fn try_from(repr: ValveKindRepr) -> LabResult<Self> {
        match repr {
            ValveKindRepr::Positions(n) => ValveKind::from_positions(n),
            ValveKindRepr::Name(name) => name.parse(),
        }
    }
}

impl From<ValveKind> for ValveKindRepr {
    fn from(kind: ValveKind) -> Self {
        match kind {
            ValveKind::SixWay => ValveKindRepr::Name("6-way".into()),
            ValveKind::TenWay => ValveKindRepr::Name("10-way".into()),
            ValveKind::TwentyFourWay => ValveKindRepr::Name("24-way".into()),
            ValveKind::Custom(n) => ValveKindRepr::Positions(n),
        }
    }
}

/// Actuator control mode (`AMn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorMode {
    /// Two-position with stops
    TwoPositionWithStops = 1,
    /// Two-position without stops
    TwoPositionWithoutStops = 2,
    /// Multi-position
    MultiPosition = 3,
}

/// Driver for a VICI selector valve.
pub struct ViciValve {
    name: String,
    kind: ValveKind,
    link: SerialLink,
    state: ConnectionCell,
}

impl ViciValve {
    /// New, unconnected valve.
    pub fn new(
        name: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        kind: ValveKind,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            link: SerialLink::new(name.clone(), opener, timeout),
            name,
            kind,
            state: ConnectionCell::new(),
        }
    }

    /// Stator kind.
    pub fn kind(&self) -> ValveKind {
        self.kind
    }

    async fn send(&self, command: &str) -> LabResult<()> {
        let mut session = self.link.session().await?;
        session.write_line(command, "\r").await
    }

    async fn query(&self, command: &str) -> LabResult<String> {
        let mut session = self.link.session().await?;
        session.drain(Duration::from_millis(20)).await;
        let reply = session.query(command, "\r", b'\r').await?;
        if reply.is_empty() {
            return Err(LabError::NoResponse {
                device: self.name.clone(),
                command: command.to_string(),
                timeout: self.link.timeout(),
            });
        }
        Ok(reply)
    }

    /// Firmware version string (`VR`).
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn firmware_version(&self) -> LabResult<String> {
        self.query("VR").await
    }

    /// Program the stator size (`NPnn`).
    pub async fn set_number_of_positions(&self, positions: u8) -> LabResult<()> {
        ValveKind::from_positions(positions)?;
        self.send(&format!("NP{positions:02}")).await
    }

    /// Toggle between the two positions (two-position mode only).
    pub async fn toggle(&self) -> LabResult<()> {
        self.send("TO").await
    }

    /// Timed toggle using the configured delay.
    pub async fn timed_toggle(&self) -> LabResult<()> {
        self.send("TT").await
    }

    /// Set the timed-toggle delay in milliseconds.
    pub async fn set_delay_time(&self, millis: u32) -> LabResult<()> {
        if millis > 65_535 {
            return Err(LabError::validation(format!(
                "{}: delay must be 0-65535 ms, got {millis}",
                self.name
            )));
        }
        self.send(&format!("DT{millis:05}")).await
    }

    /// Select the actuator mode.
    pub async fn set_actuator_mode(&self, mode: ActuatorMode) -> LabResult<()> {
        self.send(&format!("AM{}", mode as u8)).await
    }

    /// Have the actuator learn its mechanical stops.
    pub async fn learn_stops(&self) -> LabResult<()> {
        self.send("LRN").await
    }

    /// Assign a single-character bus id (`0-9`, `A-Z`).
    pub async fn set_device_id(&self, id: char) -> LabResult<()> {
        if !id.is_ascii_alphanumeric() {
            return Err(LabError::validation(format!(
                "{}: device id must be a single digit or letter, got {id:?}",
                self.name
            )));
        }
        self.send(&format!("ID{}", id.to_ascii_uppercase())).await
    }

    /// Clear the bus id.
    pub async fn reset_device_id(&self) -> LabResult<()> {
        self.send("*ID*").await
    }

    async fn handshake(&self) -> LabResult<String> {
        self.set_number_of_positions(self.kind.positions()).await?;
        self.firmware_version().await
    }
}

#[async_trait]
impl Device for ViciValve {
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
        match self.handshake().await {
            Ok(version) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, positions = self.kind.positions(), %version, "valve connected");
                Ok(())
            }
            Err(e) => {
                self.link.close().await;
                self.state.set(ConnectionState::Error);
                Err(LabError::connection(
                    &self.name,
                    format!("no answer to handshake: {e}"),
                ))
            }
        }
    }

    async fn close(&self) -> LabResult<()> {
        self.link.close().await;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn stop(&self) -> LabResult<()> {
        // the actuator finishes a move on its own; nothing to halt
        Ok(())
    }
}

#[async_trait]
impl SelectorValve for ViciValve {
    fn positions(&self) -> u8 {
        self.kind.positions()
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn home(&self) -> LabResult<()> {
        self.send("HM").await
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn go_to_position(&self, position: u8) -> LabResult<()> {
        check_position(&self.name, position, self.positions())?;
        self.send(&format!("GO{position:02}")).await
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn current_position(&self) -> LabResult<u8> {
        let reply = self.query("CP").await?;
        let position = FIRST_INTEGER
            .captures(&reply)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .ok_or_else(|| LabError::parse(&self.name, format!("CP reply {reply:?}")))?;
        if !(1..=self.positions()).contains(&position) {
            return Err(LabError::parse(
                &self.name,
                format!("CP reported position {position} outside 1-{}", self.positions()),
            ));
        }
        Ok(position)
    }

    async fn move_clockwise(&self, position: Option<u8>) -> LabResult<()> {
        match position {
            Some(p) => {
                check_position(&self.name, p, self.positions())?;
                self.send(&format!("CW{p:02}")).await
            }
            None => self.send("CW").await,
        }
    }

    async fn move_counterclockwise(&self, position: Option<u8>) -> LabResult<()> {
        match position {
            Some(p) => {
                check_position(&self.name, p, self.positions())?;
                self.send(&format!("CC{p:02}")).await
            }
            None => self.send("CC").await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn connected_valve(kind: ValveKind) -> (Arc<ViciValve>, mock_serial::MockDeviceHarness) {
        let (opener, mut device) = mock_serial::opener("mock://valve");
        let valve = Arc::new(ViciValve::new("Valve_1", opener, kind, TIMEOUT));

        let task = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.connect().await })
        };
        let np = format!("NP{:02}\r", kind.positions());
        device.expect_write(np.as_bytes()).await;
        device.expect_and_respond(b"VR\r", b"EMHCA 1.02\r").await;
        task.await.unwrap().unwrap();
        (valve, device)
    }

    #[test]
    fn kind_parses_presets_and_even_counts() {
        assert_eq!("6-way".parse::<ValveKind>().unwrap(), ValveKind::SixWay);
        assert_eq!("10 way".parse::<ValveKind>().unwrap().positions(), 10);
        assert_eq!("16".parse::<ValveKind>().unwrap(), ValveKind::Custom(16));
        assert!("7".parse::<ValveKind>().is_err());
        assert!("42".parse::<ValveKind>().is_err());
        assert!("8-port".parse::<ValveKind>().is_err());
    }

    #[test]
    fn kind_deserializes_from_string_or_int() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: ValveKind,
        }
        let named: Wrapper = toml::from_str(r#"kind = "24-way""#).unwrap();
        assert_eq!(named.kind, ValveKind::TwentyFourWay);
        let counted: Wrapper = toml::from_str("kind = 12").unwrap();
        assert_eq!(counted.kind, ValveKind::Custom(12));
    }

    #[tokio::test]
    async fn connect_programs_positions_and_probes_version() {
        let (valve, _device) = connected_valve(ValveKind::TenWay).await;
        assert_eq!(valve.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn silent_valve_fails_connect_with_error_state() {
        let (opener, mut device) = mock_serial::opener("mock://valve");
        let valve = ViciValve::new("Valve_1", opener, ValveKind::SixWay, Duration::from_millis(50));

        let connect = valve.connect();
        let device_side = async {
            device.expect_write(b"NP06\r").await;
            device.expect_write(b"VR\r").await;
        };
        let (result, ()) = tokio::join!(connect, device_side);
        assert!(matches!(result, Err(LabError::Connection { .. })));
        assert_eq!(valve.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn go_to_position_formats_two_digits() {
        let (valve, mut device) = connected_valve(ValveKind::SixWay).await;
        valve.go_to_position(3).await.unwrap();
        device.expect_write(b"GO03\r").await;

        valve.home().await.unwrap();
        device.expect_write(b"HM\r").await;
    }

    #[tokio::test]
    async fn out_of_range_position_never_reaches_the_wire() {
        let (valve, mut device) = connected_valve(ValveKind::SixWay).await;
        let err = valve.go_to_position(41).await.unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
        device.assert_no_writes();
    }

    #[tokio::test]
    async fn current_position_parses_first_integer() {
        let (valve, mut device) = connected_valve(ValveKind::SixWay).await;
        let task = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.current_position().await })
        };
        device.expect_and_respond(b"CP\r", b"Position is  = 4\r").await;
        assert_eq!(task.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn garbled_position_reply_is_parse_error() {
        let (valve, mut device) = connected_valve(ValveKind::SixWay).await;
        let task = {
            let valve = valve.clone();
            tokio::spawn(async move { valve.current_position().await })
        };
        device.expect_and_respond(b"CP\r", b"??\r").await;
        assert!(matches!(task.await.unwrap(), Err(LabError::Parse { .. })));
    }

    #[tokio::test]
    async fn extras_use_documented_formats() {
        let (valve, mut device) = connected_valve(ValveKind::SixWay).await;
        valve.set_delay_time(250).await.unwrap();
        device.expect_write(b"DT00250\r").await;
        assert!(valve.set_delay_time(70_000).await.is_err());

        valve.set_actuator_mode(ActuatorMode::MultiPosition).await.unwrap();
        device.expect_write(b"AM3\r").await;

        valve.move_clockwise(Some(5)).await.unwrap();
        device.expect_write(b"CW05\r").await;
        valve.move_counterclockwise(None).await.unwrap();
        device.expect_write(b"CC\r").await;

        valve.set_device_id('b').await.unwrap();
        device.expect_write(b"IDB\r").await;
        valve.reset_device_id().await.unwrap();
        device.expect_write(b"*ID*\r").await;
    }

    #[tokio::test]
    async fn commands_on_closed_valve_are_connection_errors() {
        let (valve, _device) = connected_valve(ValveKind::SixWay).await;
        valve.close().await.unwrap();
        valve.close().await.unwrap();
        assert_eq!(valve.state(), ConnectionState::Disconnected);
        assert!(matches!(valve.home().await, Err(LabError::Connection { .. })));
    }
}
