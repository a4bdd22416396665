//! Scriptable in-memory serial port for driver tests.
//!
//! [`new`] returns a connected pair:
//! - [`MockSerialPort`] goes to the driver (through
//!   [`PreopenedPort`](chemflow_core::serial::PreopenedPort)) and implements
//!   `AsyncRead + AsyncWrite`
//! - [`MockDeviceHarness`] stays in the test and plays the instrument: it asserts
//!   on what the driver wrote and feeds replies back
//!
//! Two unbounded channels carry the bytes, one per direction. Dropping the
//! harness makes every further driver write fail with `BrokenPipe` and every
//! read see end-of-stream.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut device) = mock_serial::new();
//! let valve = ViciValve::new("Valve_1", PreopenedPort::shared("mock", port), ValveKind::SixWay, timeout);
//!
//! let task = tokio::spawn(async move { valve.current_position().await });
//! device.expect_and_respond(b"CP\r", b"CP03\r").await;
//! assert_eq!(task.await.unwrap().unwrap(), 3);
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chemflow_core::serial::{PortOpener, PreopenedPort};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// How long the harness waits for an expected write before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Driver-facing end of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    to_device: UnboundedSender<Vec<u8>>,
    from_device: UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Test-facing end of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    from_driver: UnboundedReceiver<Vec<u8>>,
    to_driver: UnboundedSender<Vec<u8>>,
    received: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (driver_tx, driver_rx) = mpsc::unbounded_channel();
    let (device_tx, device_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        to_device: driver_tx,
        from_device: device_rx,
        pending: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        from_driver: driver_rx,
        to_driver: device_tx,
        received: Vec::new(),
    };
    (port, harness)
}

/// Create a pair with the port already wrapped as a [`PortOpener`].
pub fn opener(address: &str) -> (Arc<dyn PortOpener>, MockDeviceHarness) {
    let (port, harness) = new();
    (PreopenedPort::shared(address, port), harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.from_device.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending.extend(chunk),
                // harness gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.fill(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.to_device.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[allow(clippy::panic)]
impl MockDeviceHarness {
    /// Queue bytes for the driver to read.
    ///
    /// # Panics
    /// If the driver side was dropped.
    pub fn reply(&self, data: &[u8]) {
        if self.to_driver.send(data.to_vec()).is_err() {
            panic!("mock driver port was dropped before reply {:?}", String::from_utf8_lossy(data));
        }
    }

    /// Wait until the driver has written `expected` next.
    ///
    /// Extra bytes beyond `expected` are kept for the next expectation.
    ///
    /// # Panics
    /// On mismatch, or if nothing matching arrives within two seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.received.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.from_driver.recv()).await {
                Ok(Some(chunk)) => self.received.extend_from_slice(&chunk),
                Ok(None) => panic!(
                    "driver port closed while expecting {:?}",
                    String::from_utf8_lossy(expected)
                ),
                Err(_) => panic!(
                    "timed out waiting for {:?}; got {:?} so far",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.received)
                ),
            }
        }

        let actual: Vec<u8> = self.received.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "driver wrote {:?}, expected {:?}",
            String::from_utf8_lossy(&actual),
            String::from_utf8_lossy(expected)
        );
    }

    /// Expect a write, then reply.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.reply(response);
    }

    /// Next driver write up to `terminator`, without it. `None` once the driver
    /// side is gone.
    ///
    /// Lets a test play a stateful instrument instead of scripting exact bytes.
    pub async fn next_command(&mut self, terminator: u8) -> Option<String> {
        loop {
            if let Some(end) = self.received.iter().position(|b| *b == terminator) {
                let line: Vec<u8> = self.received.drain(..=end).collect();
                return Some(String::from_utf8_lossy(&line[..end]).into_owned());
            }
            let chunk = self.from_driver.recv().await?;
            self.received.extend_from_slice(&chunk);
        }
    }

    /// Everything the driver has written so far and not yet asserted, without waiting.
    pub fn pending_writes(&mut self) -> Vec<u8> {
        loop {
            match self.from_driver.try_recv() {
                Ok(chunk) => self.received.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        std::mem::take(&mut self.received)
    }

    /// Assert that the driver has written nothing that was not yet asserted.
    pub fn assert_no_writes(&mut self) {
        let pending = self.pending_writes();
        assert!(
            pending.is_empty(),
            "unexpected driver write {:?}",
            String::from_utf8_lossy(&pending)
        );
    }

    /// Discard writes arriving within a short quiet window.
    pub async fn drain_writes(&mut self) {
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), self.from_driver.recv()).await
        {
            self.received.extend_from_slice(&chunk);
        }
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn write_then_reply() {
        let (port, mut device) = new();
        let mut port = BufReader::new(port);

        let app = tokio::spawn(async move {
            port.write_all(b"VR\r").await.unwrap();
            let mut line = Vec::new();
            port.read_until(b'\r', &mut line).await.unwrap();
            line
        });

        device.expect_and_respond(b"VR\r", b"EMHCA 1.02\r").await;
        assert_eq!(app.await.unwrap(), b"EMHCA 1.02\r");
    }

    #[tokio::test]
    async fn split_writes_are_reassembled() {
        let (mut port, mut device) = new();
        port.write_all(b"GO").await.unwrap();
        port.write_all(b"03\rHM\r").await.unwrap();

        device.expect_write(b"GO03\r").await;
        device.expect_write(b"HM\r").await;
        device.assert_no_writes();
    }

    #[tokio::test]
    async fn pending_writes_does_not_block() {
        let (mut port, mut device) = new();
        assert!(device.pending_writes().is_empty());

        port.write_all(b"SL 0\r").await.unwrap();
        assert_eq!(device.pending_writes(), b"SL 0\r");
    }

    #[tokio::test]
    async fn dropped_harness_breaks_writes() {
        let (mut port, device) = new();
        drop(device);
        let err = port.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
