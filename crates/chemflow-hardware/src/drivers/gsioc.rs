//! Gilson Serial Input/Output Channel (GSIOC).
//!
//! GSIOC is a master/slave bus: the controller selects one unit, then issues
//! either an *immediate* command (a single character answered at once, used for
//! status and position reads) or a *buffered* command (a text command queued on
//! the unit, used for motion).
//!
//! Protocol Overview:
//! - Baud: 19200, 8 data bits, even parity, 1 stop bit
//! - Select: `0xFF` (deselect all), short pause, then `unit | 0x80`; the unit
//!   echoes its id byte
//! - Immediate: send the command character; the unit answers one byte at a
//!   time, the master ACKs each byte with `0x06`, and the last byte carries the
//!   high bit
//! - Buffered: send LF, then each command byte, then CR; the unit echoes every
//!   byte. A `#` in place of the LF echo means the unit is busy.

use async_trait::async_trait;
use chemflow_core::serial::{LinkSession, PortOpener, SerialLink};
use chemflow_core::{LabError, LabResult};
use std::sync::Arc;
use std::time::Duration;

/// Default GSIOC baud rate.
pub const DEFAULT_BAUD: u32 = 19_200;

const DESELECT: u8 = 0xFF;
const ACK: u8 = 0x06;
const LF: u8 = b'\n';
const CR: u8 = b'\r';
const BUSY: u8 = b'#';
const SELECT_PAUSE: Duration = Duration::from_millis(20);
const BUSY_RETRIES: usize = 10;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);
const MAX_IMMEDIATE_REPLY: usize = 256;

/// Command channels of a GSIOC bus.
#[async_trait]
pub trait GsiocTransport: Send + Sync {
    /// Bus address, for diagnostics.
    fn address(&self) -> &str;

    /// Open the bus. Opening an open bus is a no-op.
    async fn open(&self) -> LabResult<()>;

    /// Close the bus.
    async fn close(&self);

    /// Single-character command answered immediately.
    async fn immediate(&self, unit: u8, command: char) -> LabResult<String>;

    /// Queue a text command on the unit.
    async fn buffered(&self, unit: u8, command: &str) -> LabResult<()>;
}

/// GSIOC over a serial link.
pub struct SerialGsioc {
    link: SerialLink,
}

impl SerialGsioc {
    /// Bus on `opener`, identified as `device` in errors.
    pub fn new(device: impl Into<String>, opener: Arc<dyn PortOpener>, timeout: Duration) -> Self {
        Self {
            link: SerialLink::new(device, opener, timeout),
        }
    }

    fn protocol_error(&self, message: String) -> LabError {
        LabError::hardware(self.link.device(), message)
    }

    async fn select(&self, session: &mut LinkSession<'_>, unit: u8) -> LabResult<()> {
        let id = unit | 0x80;
        session.write_all(&[DESELECT]).await?;
        tokio::time::sleep(SELECT_PAUSE).await;
        session.write_all(&[id]).await?;
        let echo = session.read_byte("select").await?;
        if echo != id {
            return Err(self.protocol_error(format!(
                "unit {unit} did not answer selection (echo {echo:#04x})"
            )));
        }
        Ok(())
    }

    async fn echoed(&self, session: &mut LinkSession<'_>, byte: u8, command: &str) -> LabResult<()> {
        session.write_all(&[byte]).await?;
        let echo = session.read_byte(command).await?;
        if echo != byte {
            return Err(self.protocol_error(format!(
                "echo mismatch in {command:?}: sent {byte:#04x}, got {echo:#04x}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GsiocTransport for SerialGsioc {
    fn address(&self) -> &str {
        self.link.address()
    }

    async fn open(&self) -> LabResult<()> {
        self.link.open().await.map(|_| ())
    }

    async fn close(&self) {
        self.link.close().await;
    }

    async fn immediate(&self, unit: u8, command: char) -> LabResult<String> {
        let label = command.to_string();
        let mut session = self.link.session().await?;
        self.select(&mut session, unit).await?;
        session.write_all(&[command as u8]).await?;

        let mut reply = Vec::new();
        loop {
            let byte = session.read_byte(&label).await?;
            if byte & 0x80 != 0 {
                reply.push(byte & 0x7F);
                break;
            }
            reply.push(byte);
            if reply.len() >= MAX_IMMEDIATE_REPLY {
                return Err(self.protocol_error(format!(
                    "immediate {command:?} reply exceeds {MAX_IMMEDIATE_REPLY} bytes"
                )));
            }
            session.write_all(&[ACK]).await?;
        }
        let text = String::from_utf8_lossy(&reply).into_owned();
        tracing::trace!(device = session.device(), unit, %command, reply = %text, "gsioc immediate");
        Ok(text)
    }

    async fn buffered(&self, unit: u8, command: &str) -> LabResult<()> {
        let mut session = self.link.session().await?;
        self.select(&mut session, unit).await?;

        let mut attempts = 0;
        loop {
            session.write_all(&[LF]).await?;
            match session.read_byte(command).await? {
                LF => break,
                BUSY if attempts < BUSY_RETRIES => {
                    attempts += 1;
                    tracing::debug!(device = session.device(), unit, attempts, "gsioc unit busy");
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                BUSY => {
                    return Err(self.protocol_error(format!(
                        "unit {unit} stayed busy for {command:?}"
                    )));
                }
                other => {
                    return Err(self.protocol_error(format!(
                        "unexpected {other:#04x} opening buffered {command:?}"
                    )));
                }
            }
        }

        for byte in command.bytes() {
            self.echoed(&mut session, byte, command).await?;
        }
        self.echoed(&mut session, CR, command).await?;
        tracing::trace!(device = session.device(), unit, command, "gsioc buffered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial::{self, MockDeviceHarness};

    async fn bus() -> (Arc<SerialGsioc>, MockDeviceHarness) {
        let (opener, device) = mock_serial::opener("mock://gsioc");
        let bus = Arc::new(SerialGsioc::new("GX281_1", opener, Duration::from_millis(500)));
        bus.open().await.unwrap();
        (bus, device)
    }

    async fn expect_select(device: &mut MockDeviceHarness, unit: u8) {
        device.expect_write(&[DESELECT]).await;
        device.expect_and_respond(&[unit | 0x80], &[unit | 0x80]).await;
    }

    #[tokio::test]
    async fn immediate_acks_every_byte_but_the_last() {
        let (bus, mut device) = bus().await;
        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.immediate(25, 'Z').await })
        };
        expect_select(&mut device, 25).await;
        device.expect_and_respond(b"Z", b"1").await;
        device.expect_and_respond(&[ACK], b"2").await;
        device.expect_and_respond(&[ACK], &[b'5' | 0x80]).await;
        assert_eq!(task.await.unwrap().unwrap(), "125");
        device.assert_no_writes();
    }

    #[tokio::test]
    async fn buffered_echoes_each_byte() {
        let (bus, mut device) = bus().await;
        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.buffered(25, "SZ90").await })
        };
        expect_select(&mut device, 25).await;
        device.expect_and_respond(b"\n", b"\n").await;
        for byte in b"SZ90\r" {
            device.expect_and_respond(&[*byte], &[*byte]).await;
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn busy_unit_is_retried() {
        let (bus, mut device) = bus().await;
        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.buffered(25, "SH").await })
        };
        expect_select(&mut device, 25).await;
        device.expect_and_respond(b"\n", b"#").await;
        device.expect_and_respond(b"\n", b"\n").await;
        for byte in b"SH\r" {
            device.expect_and_respond(&[*byte], &[*byte]).await;
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_select_echo_is_hardware_error() {
        let (bus, mut device) = bus().await;
        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.immediate(25, '%').await })
        };
        device.expect_write(&[DESELECT]).await;
        device.expect_and_respond(&[25 | 0x80], &[0x80 | 3]).await;
        assert!(matches!(task.await.unwrap(), Err(LabError::Hardware { .. })));
    }

    #[tokio::test]
    async fn silent_unit_is_no_response() {
        let (bus, mut device) = bus().await;
        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.immediate(25, '%').await })
        };
        device.expect_write(&[DESELECT]).await;
        device.expect_write(&[25 | 0x80]).await;
        assert!(matches!(task.await.unwrap(), Err(LabError::NoResponse { .. })));
    }
}
