//! Serial link plumbing shared by every byte-stream driver.
//!
//! A driver owns one [`SerialLink`]. The link holds the opened port behind a
//! `tokio::sync::Mutex` and hands out a [`LinkSession`] per request/response
//! exchange, so bytes from concurrent callers never interleave on the wire.
//!
//! Opening the transport is injected through [`PortOpener`]: production code
//! uses [`SerialOpener`] (tokio-serial, opened inside `spawn_blocking`), tests
//! pass a [`PreopenedPort`] wrapping an in-memory stream such as
//! `tokio::io::duplex` or the mock serial harness.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{LabError, LabResult};

/// Trait alias for the byte streams a link can drive.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the transport for a [`SerialLink`].
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port.
    async fn open(&self) -> LabResult<DynSerial>;

    /// Port address, for diagnostics.
    fn address(&self) -> &str;
}

/// Opens a real serial port, 8 data bits, 1 stop bit, no flow control.
///
/// Parity is none unless [`with_even_parity`](SerialOpener::with_even_parity) is used.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
    baud: u32,
    even_parity: bool,
}

#[cfg(feature = "serial")]
impl SerialOpener {
    /// Opener for `path` at `baud`.
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            even_parity: false,
        }
    }

    /// Use even parity (8E1).
    pub fn with_even_parity(mut self) -> Self {
        self.even_parity = true;
        self
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self) -> LabResult<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let path = self.path.clone();
        let baud = self.baud;
        let parity = if self.even_parity {
            tokio_serial::Parity::Even
        } else {
            tokio_serial::Parity::None
        };

        // tokio-serial's open is blocking
        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(parity)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| LabError::connection(&self.path, format!("port open task failed: {e}")))?
        .map_err(|e| {
            LabError::connection(&self.path, format!("failed to open serial port: {e}"))
        })?;

        Ok(Box::new(port))
    }

    fn address(&self) -> &str {
        &self.path
    }
}

/// Opener that yields an already-open stream exactly once.
pub struct PreopenedPort {
    address: String,
    port: parking_lot::Mutex<Option<DynSerial>>,
}

impl PreopenedPort {
    /// Wrap `port`, reported under `address`.
    pub fn new(address: impl Into<String>, port: impl SerialPortIO + 'static) -> Self {
        Self {
            address: address.into(),
            port: parking_lot::Mutex::new(Some(Box::new(port))),
        }
    }

    /// Wrap `port` as an `Arc<dyn PortOpener>`.
    pub fn shared(address: impl Into<String>, port: impl SerialPortIO + 'static) -> Arc<dyn PortOpener> {
        Arc::new(Self::new(address, port))
    }
}

#[async_trait]
impl PortOpener for PreopenedPort {
    async fn open(&self) -> LabResult<DynSerial> {
        self.port.lock().take().ok_or_else(|| {
            LabError::connection(&self.address, "pre-opened port was already consumed")
        })
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// An owned serial connection for one device.
pub struct SerialLink {
    device: String,
    opener: Arc<dyn PortOpener>,
    port: Mutex<Option<BufReader<DynSerial>>>,
    timeout: Duration,
}

impl SerialLink {
    /// New closed link. `timeout` bounds every read.
    pub fn new(device: impl Into<String>, opener: Arc<dyn PortOpener>, timeout: Duration) -> Self {
        Self {
            device: device.into(),
            opener,
            port: Mutex::new(None),
            timeout,
        }
    }

    /// Device name used in errors.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Port address from the opener.
    pub fn address(&self) -> &str {
        self.opener.address()
    }

    /// Per-read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the transport. Returns `false` if it was already open.
    pub async fn open(&self) -> LabResult<bool> {
        let mut guard = self.port.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        let stream = self.opener.open().await?;
        *guard = Some(BufReader::new(stream));
        tracing::debug!(device = %self.device, address = self.opener.address(), "serial link opened");
        Ok(true)
    }

    /// Close the transport. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let mut guard = self.port.lock().await;
        match guard.take() {
            Some(mut port) => {
                if let Err(e) = port.get_mut().shutdown().await {
                    tracing::debug!(device = %self.device, error = %e, "shutdown on close failed");
                }
                tracing::debug!(device = %self.device, "serial link closed");
                true
            }
            None => false,
        }
    }

    /// Whether the transport is open.
    pub async fn is_open(&self) -> bool {
        self.port.lock().await.is_some()
    }

    /// Take exclusive use of the port for one exchange.
    ///
    /// # Errors
    /// `Connection` when the link is closed.
    pub async fn session(&self) -> LabResult<LinkSession<'_>> {
        let guard = self.port.lock().await;
        let port = MutexGuard::try_map(guard, |port| port.as_mut())
            .map_err(|_| LabError::connection(&self.device, "serial link is not open"))?;
        Ok(LinkSession {
            device: &self.device,
            timeout: self.timeout,
            port,
        })
    }
}

/// Exclusive access to an open link for the duration of one exchange.
pub struct LinkSession<'a> {
    device: &'a str,
    timeout: Duration,
    port: MappedMutexGuard<'a, BufReader<DynSerial>>,
}

impl LinkSession<'_> {
    /// Device name used in errors.
    pub fn device(&self) -> &str {
        self.device
    }

    fn no_response(&self, command: &str) -> LabError {
        LabError::NoResponse {
            device: self.device.to_string(),
            command: command.to_string(),
            timeout: self.timeout,
        }
    }

    /// Write raw bytes and flush.
    pub async fn write_all(&mut self, bytes: &[u8]) -> LabResult<()> {
        let port = self.port.get_mut();
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    /// Write `command` followed by `terminator`.
    pub async fn write_line(&mut self, command: &str, terminator: &str) -> LabResult<()> {
        tracing::trace!(device = self.device, command, "tx");
        let mut frame = Vec::with_capacity(command.len() + terminator.len());
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(terminator.as_bytes());
        self.write_all(&frame).await
    }

    /// Read up to and including `delimiter`; returns the text without it.
    ///
    /// A timeout, an end-of-stream, or a missing delimiter at end-of-stream is
    /// `NoResponse`.
    pub async fn read_until(&mut self, delimiter: u8, command: &str) -> LabResult<String> {
        let mut buf = Vec::new();
        let result =
            tokio::time::timeout(self.timeout, self.port.read_until(delimiter, &mut buf)).await;
        match result {
            Ok(Ok(0)) | Err(_) => Err(self.no_response(command)),
            Ok(Ok(_)) => {
                if buf.last() != Some(&delimiter) {
                    return Err(self.no_response(command));
                }
                buf.pop();
                let text = String::from_utf8_lossy(&buf).into_owned();
                tracing::trace!(device = self.device, reply = %text, "rx");
                Ok(text)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Read bytes until `done` accepts the accumulated text.
    ///
    /// The whole read is bounded by the link timeout.
    pub async fn read_until_with<F>(&mut self, command: &str, done: F) -> LabResult<String>
    where
        F: Fn(&str) -> bool + Send,
    {
        let port = &mut *self.port;
        let read = async {
            let mut acc = Vec::new();
            loop {
                let byte = port.read_u8().await?;
                acc.push(byte);
                let text = String::from_utf8_lossy(&acc);
                if done(&text) {
                    return Ok::<_, std::io::Error>(text.into_owned());
                }
            }
        };
        let result = tokio::time::timeout(self.timeout, read).await;
        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.no_response(command))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(self.no_response(command)),
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize, command: &str) -> LabResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let result = tokio::time::timeout(self.timeout, self.port.read_exact(&mut buf)).await;
        match result {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(self.no_response(command))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(self.no_response(command)),
        }
    }

    /// Read one byte.
    pub async fn read_byte(&mut self, command: &str) -> LabResult<u8> {
        let bytes = self.read_exact(1, command).await?;
        Ok(bytes[0])
    }

    /// Write a command line and read one `delimiter`-terminated reply, trimmed.
    pub async fn query(
        &mut self,
        command: &str,
        terminator: &str,
        delimiter: u8,
    ) -> LabResult<String> {
        self.write_line(command, terminator).await?;
        let reply = self.read_until(delimiter, command).await?;
        Ok(reply.trim().to_string())
    }

    /// Discard stale input, for at most `window`.
    ///
    /// Empties the read buffer, then reads until three consecutive silent polls.
    /// Returns the number of bytes discarded.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);

        let mut discarded = buffered;
        let mut silent = 0u32;
        let mut scratch = [0u8; 256];
        let deadline = tokio::time::Instant::now() + window;

        while tokio::time::Instant::now() < deadline && silent < 3 {
            match tokio::time::timeout(
                Duration::from_millis(5),
                self.port.get_mut().read(&mut scratch),
            )
            .await
            {
                Ok(Ok(0)) => {
                    // EOF: nothing more will arrive
                    break;
                }
                Ok(Ok(n)) => {
                    discarded += n;
                    silent = 0;
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    silent += 1;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(device = self.device, error = %e, "I/O error during drain");
                    break;
                }
                Err(_) => silent += 1,
            }
        }

        if discarded > 0 {
            tracing::debug!(device = self.device, discarded, "flushed stale bytes");
        }
        discarded
    }
}
