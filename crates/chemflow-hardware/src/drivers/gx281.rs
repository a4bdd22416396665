//! Gilson GX-281 liquid handler over GSIOC.
//!
//! Motion goes through the buffered channel (`SH`, `SX{x}/{y}`, `SZ{z}`) and is
//! considered complete once the immediate position queries (`X`, `Z`) report a
//! coordinate again. While the arm is unhomed or moving those queries answer
//! with a negative coordinate, which is reported as [`XyReading::NotReady`].
//!
//! Default envelope: X 0–700, Y 0–380, Z 0–125 mm, safe Z 125 mm, unit id 25.

use async_trait::async_trait;
use chemflow_core::capabilities::{Envelope, LiquidHandler, XyReading};
use chemflow_core::geometry::{Deck, RackType};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

use super::gsioc::GsiocTransport;

/// Default GSIOC unit id.
pub const DEFAULT_UNIT: u8 = 25;

/// Travel limits of the GX-281.
pub const GX281_ENVELOPE: Envelope = Envelope {
    x: (0.0, 700.0),
    y: (0.0, 380.0),
    z: (0.0, 125.0),
};

/// Needle height for lateral moves.
pub const GX281_SAFE_Z: f64 = 125.0;

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?[0-9]*\.?[0-9]+").expect("Invalid number regex"));

/// Motion polling settings.
#[derive(Debug, Clone, Copy)]
pub struct MotionTiming {
    /// Interval between position polls while a move settles
    pub poll_interval: Duration,
    /// Longest a single move may take
    pub move_timeout: Duration,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            move_timeout: Duration::from_secs(60),
        }
    }
}

/// Format a coordinate to 0.1 mm without trailing zeros.
fn coordinate(value: f64) -> String {
    format!("{}", (value * 10.0).round() / 10.0)
}

fn numbers(text: &str) -> Vec<f64> {
    NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// Parse an `X` reply (`x/y`).
pub fn parse_xy(device: &str, reply: &str) -> LabResult<XyReading> {
    match numbers(reply).as_slice() {
        [x, y, ..] if *x < 0.0 || *y < 0.0 => Ok(XyReading::NotReady),
        [x, y, ..] => Ok(XyReading::At { x: *x, y: *y }),
        _ => Err(LabError::parse(device, format!("no XY coordinate in {reply:?}"))),
    }
}

/// Parse a `Z` reply. `None` while the arm is not ready.
pub fn parse_z(device: &str, reply: &str) -> LabResult<Option<f64>> {
    match numbers(reply).first() {
        Some(z) if *z < 0.0 => Ok(None),
        Some(z) => Ok(Some(*z)),
        None => Err(LabError::parse(device, format!("no Z coordinate in {reply:?}"))),
    }
}

/// Driver for a GX-281.
pub struct Gx281 {
    name: String,
    transport: Arc<dyn GsiocTransport>,
    unit: u8,
    state: ConnectionCell,
    deck: Deck,
    timing: MotionTiming,
    motion: Mutex<()>,
    z: parking_lot::Mutex<Option<f64>>,
}

impl Gx281 {
    /// New, unconnected handler with every bed holding `default_rack`.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn GsiocTransport>,
        unit: u8,
        default_rack: RackType,
        timing: MotionTiming,
    ) -> LabResult<Self> {
        Ok(Self {
            name: name.into(),
            transport,
            unit,
            state: ConnectionCell::new(),
            deck: Deck::multi_bed(default_rack)?,
            timing,
            motion: Mutex::new(()),
            z: parking_lot::Mutex::new(None),
        })
    }

    async fn immediate(&self, command: char) -> LabResult<String> {
        self.transport.immediate(self.unit, command).await
    }

    async fn buffered(&self, command: &str) -> LabResult<()> {
        tracing::debug!(device = %self.name, command, "gx281 buffered");
        self.transport.buffered(self.unit, command).await
    }

    async fn settle<T, F, Fut>(&self, what: &str, mut poll: F) -> LabResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = LabResult<Option<T>>> + Send,
        T: Send,
    {
        let deadline = tokio::time::Instant::now() + self.timing.move_timeout;
        loop {
            if let Some(value) = poll().await? {
                return Ok(value);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LabError::hardware(
                    &self.name,
                    format!("{what} did not settle within {:?}", self.timing.move_timeout),
                ));
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    async fn settled_xy(&self) -> LabResult<(f64, f64)> {
        self.settle("XY move", || async {
            Ok(match self.read_xy().await? {
                XyReading::At { x, y } => Some((x, y)),
                XyReading::NotReady => None,
            })
        })
        .await
    }

    /// Motor status string (`xyzp`: P parked, R running, E error, I not initialized).
    pub async fn motor_status(&self) -> LabResult<String> {
        self.immediate('M').await
    }

    /// Travel ranges as reported by the unit.
    pub async fn travel_ranges(&self) -> LabResult<String> {
        self.immediate('Q').await
    }

    /// Current error code.
    pub async fn read_error(&self) -> LabResult<String> {
        self.immediate('e').await
    }

    /// Module id strings.
    pub async fn id_strings(&self) -> LabResult<String> {
        self.immediate('~').await
    }

    /// Clear the error state.
    pub async fn clear_error(&self) -> LabResult<()> {
        self.buffered("Se").await
    }

    /// Sound the beeper for `seconds`.
    pub async fn beep(&self, seconds: f64) -> LabResult<()> {
        self.buffered(&format!("SA{seconds}")).await
    }

    /// Show `message` on display line 1 or 2.
    pub async fn write_display(&self, line: u8, message: &str) -> LabResult<()> {
        if !(1..=2).contains(&line) {
            return Err(LabError::validation(format!(
                "display line must be 1 or 2, got {line}"
            )));
        }
        self.buffered(&format!("SW{line}={message}")).await
    }
}

#[async_trait]
impl Device for Gx281 {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[instrument(skip(self), fields(device = %self.name, unit = self.unit), err)]
    async fn connect(&self) -> LabResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.transport.open().await {
            self.state.set(ConnectionState::Error);
            return Err(e);
        }
        let reply = match self.immediate('%').await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                self.transport.close().await;
                self.state.set(ConnectionState::Error);
                return Err(LabError::connection(&self.name, "empty reply to '%' handshake"));
            }
            Err(e) => {
                self.transport.close().await;
                self.state.set(ConnectionState::Error);
                return Err(LabError::connection(&self.name, format!("no answer to '%': {e}")));
            }
        };
        self.state.set(ConnectionState::Connected);
        tracing::info!(device = %self.name, id = %reply.trim(), "liquid handler connected");
        Ok(())
    }

    async fn close(&self) -> LabResult<()> {
        self.transport.close().await;
        *self.z.lock() = None;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn stop(&self) -> LabResult<()> {
        if !self.state.is_connected() {
            return Ok(());
        }
        self.travel_z(GX281_SAFE_Z).await.map(|_| ())
    }
}

#[async_trait]
impl LiquidHandler for Gx281 {
    fn safe_z(&self) -> f64 {
        GX281_SAFE_Z
    }

    fn deck(&self) -> &Deck {
        &self.deck
    }

    fn motion_lock(&self) -> &Mutex<()> {
        &self.motion
    }

    fn tracked_z(&self) -> Option<f64> {
        *self.z.lock()
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn home_axes(&self) -> LabResult<()> {
        *self.z.lock() = None;
        self.buffered("SH").await?;
        let (x, y) = self.settled_xy().await?;
        tracing::info!(device = %self.name, x, y, "homed");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn travel_xy(&self, x: f64, y: f64) -> LabResult<(f64, f64)> {
        let (x, y) = GX281_ENVELOPE.clamp_xy(&self.name, x, y);
        self.buffered(&format!("SX{}/{}", coordinate(x), coordinate(y)))
            .await?;
        self.settled_xy().await?;
        Ok((x, y))
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn travel_z(&self, z: f64) -> LabResult<f64> {
        let z = GX281_ENVELOPE.clamp_z(&self.name, z);
        *self.z.lock() = None;
        self.buffered(&format!("SZ{}", coordinate(z))).await?;
        self.settle("Z move", || self.read_z()).await?;
        *self.z.lock() = Some(z);
        Ok(z)
    }

    async fn read_xy(&self) -> LabResult<XyReading> {
        let reply = self.immediate('X').await?;
        parse_xy(&self.name, &reply)
    }

    async fn read_z(&self) -> LabResult<Option<f64>> {
        let reply = self.immediate('Z').await?;
        parse_z(&self.name, &reply)
    }
}
