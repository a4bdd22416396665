//! VICI M6 continuous-flow pump (MDrive stepper controller).
//!
//! Protocol Overview:
//! - Format: MDrive mnemonic commands (`A=`, `VM=`, `MA=`, `PR P`, ...) ending in CR
//! - Baud: 9600, 8N1, no flow control
//! - Every command is acknowledged by one LF-terminated line; `PR P` answers with
//!   the current position in microsteps
//!
//! A run converts (rate, volume, direction) into a [`MotionProfile`], programs
//! the motion registers, starts an absolute move, and polls the position until
//! the nominal travel time plus a settle margin has elapsed. The delivered
//! volume is derived from the measured step delta, not from the request, and
//! the reported flow rate from that volume over the wall time of the run.

use async_trait::async_trait;
use chemflow_core::capabilities::{FlowPump, PumpDirection, PumpReport};
use chemflow_core::serial::{PortOpener, SerialLink};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

use super::motion_profile::{measured_rate, CalibrationTable, MotionProfile, UncalibratedPolicy};

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 9600;

static POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+").expect("Invalid position regex"));

/// Lines read while looking for a `PR P` value before giving up.
const MAX_POSITION_LINES: usize = 3;

/// Motion-register and run-timing settings.
#[derive(Debug, Clone)]
pub struct M6Settings {
    /// Acceleration (`A`, steps/s²)
    pub acceleration: u32,
    /// Deceleration (`D`, steps/s²)
    pub deceleration: u32,
    /// Initial velocity (`VI`, steps/s)
    pub initial_velocity: u32,
    /// Interval between progress polls
    pub poll_interval: Duration,
    /// Wait beyond the nominal travel time before stopping the motor
    pub settle_margin: Duration,
    /// Behavior for rates missing from the calibration table
    pub policy: UncalibratedPolicy,
    /// Steps-per-µL calibration
    pub calibration: CalibrationTable,
}

impl Default for M6Settings {
    fn default() -> Self {
        Self {
            acceleration: 1_000_000,
            deceleration: 1_000_000,
            initial_velocity: 1000,
            poll_interval: Duration::from_millis(500),
            settle_margin: Duration::from_secs(2),
            policy: UncalibratedPolicy::Fallback,
            calibration: CalibrationTable::vici_m6_default(),
        }
    }
}

/// Driver for a VICI M6 pump.
pub struct ViciM6Pump {
    name: String,
    link: SerialLink,
    state: ConnectionCell,
    settings: M6Settings,
    /// Held for the duration of a run; `stop` bypasses it.
    operation: Mutex<()>,
}

impl ViciM6Pump {
    /// New, unconnected pump.
    pub fn new(
        name: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        timeout: Duration,
        settings: M6Settings,
    ) -> Self {
        let name = name.into();
        Self {
            link: SerialLink::new(name.clone(), opener, timeout),
            name,
            state: ConnectionCell::new(),
            settings,
            operation: Mutex::new(()),
        }
    }

    /// Plan a run without executing it.
    pub fn plan(
        &self,
        direction: PumpDirection,
        rate_ul_min: f64,
        volume_ul: f64,
    ) -> LabResult<MotionProfile> {
        MotionProfile::compute(
            &self.settings.calibration,
            self.settings.policy,
            direction,
            rate_ul_min,
            volume_ul,
        )
    }

    async fn command(&self, command: &str) -> LabResult<String> {
        let mut session = self.link.session().await?;
        let ack = session.query(command, "\r", b'\n').await?;
        tracing::trace!(device = %self.name, command, %ack, "ack");
        Ok(ack)
    }

    /// Current position in microsteps (`PR P`).
    pub async fn read_position(&self) -> LabResult<i64> {
        let mut session = self.link.session().await?;
        session.write_line("PR P", "\r").await?;
        for _ in 0..MAX_POSITION_LINES {
            let line = session.read_until(b'\n', "PR P").await?;
            if let Some(m) = POSITION.find(&line) {
                return m.as_str().parse::<i64>().map_err(|e| {
                    LabError::parse(&self.name, format!("PR P reply {line:?}: {e}"))
                });
            }
        }
        Err(LabError::parse(&self.name, "PR P returned no position"))
    }

    async fn execute(&self, profile: &MotionProfile) -> LabResult<(i64, i64)> {
        self.command("SL 0").await?;
        let start = self.read_position().await?;

        let registers = [
            format!("A={}", self.settings.acceleration),
            format!("D={}", self.settings.deceleration),
            format!("VI={}", self.settings.initial_velocity),
            format!("VM={}", profile.velocity),
            format!("P={start}"),
        ];
        for register in &registers {
            self.command(register).await?;
        }
        self.command(&format!("MA={}", start + profile.total_steps))
            .await?;

        let deadline =
            tokio::time::Instant::now() + profile.travel_time + self.settings.settle_margin;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(self.settings.poll_interval)).await;
            let position = self.read_position().await?;
            let moved = profile.volume_for_steps(position - start);
            tracing::debug!(device = %self.name, position, moved_ul = moved, "pump progress");
        }

        self.command("SL 0").await?;
        let finish = self.read_position().await?;
        Ok((start, finish))
    }

    async fn handshake(&self) -> LabResult<i64> {
        self.command("FD").await?;
        self.command("IP").await?;
        self.read_position().await
    }
}

#[async_trait]
impl Device for ViciM6Pump {
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
            Ok(position) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, position, "pump connected");
                Ok(())
            }
            Err(e) => {
                self.link.close().await;
                self.state.set(ConnectionState::Error);
                Err(LabError::connection(&self.name, format!("no answer to handshake: {e}")))
            }
        }
    }

    async fn close(&self) -> LabResult<()> {
        if self.link.is_open().await {
            for command in ["P=0", "E"] {
                if let Err(e) = self.command(command).await {
                    tracing::warn!(device = %self.name, command, error = %e, "close command failed");
                }
            }
        }
        self.link.close().await;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn stop(&self) -> LabResult<()> {
        if !self.link.is_open().await {
            return Ok(());
        }
        self.command("SL 0").await.map(|_| ())
    }
}

#[async_trait]
impl FlowPump for ViciM6Pump {
    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn pump(
        &self,
        direction: PumpDirection,
        rate_ul_min: f64,
        volume_ul: f64,
    ) -> LabResult<PumpReport> {
        let profile = self.plan(direction, rate_ul_min, volume_ul)?;
        let _operation = self.operation.lock().await;

        tracing::info!(
            device = %self.name,
            %direction,
            rate_ul_min,
            volume_ul,
            velocity = profile.velocity,
            steps = profile.total_steps,
            commanded_rate = profile.commanded_rate(),
            calibrated = profile.calibrated,
            "pump run starting"
        );

        let started = tokio::time::Instant::now();
        let (start, finish) = match self.execute(&profile).await {
            Ok(positions) => positions,
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    tracing::warn!(device = %self.name, error = %stop_err, "halt after failed run also failed");
                }
                return Err(e);
            }
        };
        let elapsed = started.elapsed();
        let delivered_ul = profile.volume_for_steps(finish - start);
        let realized_rate_ul_min = measured_rate(delivered_ul, elapsed);

        tracing::info!(
            device = %self.name,
            delivered_ul,
            realized_rate_ul_min,
            elapsed_s = elapsed.as_secs_f64(),
            "pump run finished"
        );

        Ok(PumpReport {
            direction,
            requested_ul: volume_ul,
            delivered_ul,
            realized_rate_ul_min,
            calibrated: profile.calibrated,
            elapsed,
        })
    }
}
