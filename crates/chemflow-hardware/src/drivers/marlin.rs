//! Marlin G-code motion stage (Creality Ender-3 and similar printers).
//!
//! Protocol Overview:
//! - Baud: 115200, 8N1
//! - One G/M-code per LF-terminated line; the firmware answers with any number
//!   of informational lines (`echo:`, `busy:`, `wait`) followed by `ok`
//! - A line starting with `error` rejects the command
//! - Feed rates are in mm/min; the firmware's per-axis limits (`M203`, mm/s)
//!   are read from `M503` on connect and used to clamp every move

use chemflow_core::serial::{PortOpener, SerialLink};
use chemflow_core::{LabError, LabResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

static MAX_FEED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"M203\s+X([0-9.]+)\s+Y([0-9.]+)\s+Z([0-9.]+)").expect("Invalid M203 regex")
});

static POSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"X:([-\d.]+)\s+Y:([-\d.]+)\s+Z:([-\d.]+).*?E:([-\d.]+)")
        .expect("Invalid M114 regex")
});

/// Per-axis maximum feed (mm/s).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisFeeds {
    /// X axis
    pub x: f64,
    /// Y axis
    pub y: f64,
    /// Z axis
    pub z: f64,
}

impl Default for AxisFeeds {
    fn default() -> Self {
        Self {
            x: 500.0,
            y: 500.0,
            z: 5.0,
        }
    }
}

/// Position reported by `M114` (mm).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePosition {
    /// X
    pub x: f64,
    /// Y
    pub y: f64,
    /// Z
    pub z: f64,
    /// Extruder
    pub e: f64,
}

/// Parse the `M203` line of an `M503` dump.
pub fn parse_max_feeds(lines: &[String]) -> Option<AxisFeeds> {
    lines.iter().find_map(|line| {
        let caps = MAX_FEED.captures(line)?;
        Some(AxisFeeds {
            x: caps[1].parse().ok()?,
            y: caps[2].parse().ok()?,
            z: caps[3].parse().ok()?,
        })
    })
}

/// Parse the position line of an `M114` reply.
pub fn parse_position(lines: &[String]) -> Option<StagePosition> {
    lines.iter().find_map(|line| {
        let caps = POSITION.captures(line)?;
        Some(StagePosition {
            x: caps[1].parse().ok()?,
            y: caps[2].parse().ok()?,
            z: caps[3].parse().ok()?,
            e: caps[4].parse().ok()?,
        })
    })
}

fn axis_word(axis: char, value: f64) -> String {
    format!("{axis}{}", (value * 100.0).round() / 100.0)
}

/// Serial G-code stage.
pub struct MarlinStage {
    link: SerialLink,
    boot_delay: Duration,
    max_feed: parking_lot::Mutex<AxisFeeds>,
}

impl MarlinStage {
    /// New, closed stage. `boot_delay` covers the reset Marlin performs when
    /// the port opens.
    pub fn new(
        device: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        timeout: Duration,
        boot_delay: Duration,
    ) -> Self {
        Self {
            link: SerialLink::new(device, opener, timeout),
            boot_delay,
            max_feed: parking_lot::Mutex::new(AxisFeeds::default()),
        }
    }

    /// Port address.
    pub fn address(&self) -> &str {
        self.link.address()
    }

    /// Per-axis feed limits currently in force.
    pub fn max_feed(&self) -> AxisFeeds {
        *self.max_feed.lock()
    }

    /// Open the port and put the firmware in a known state.
    #[instrument(skip(self), fields(device = self.link.device(), port = self.link.address()), err)]
    pub async fn open(&self) -> LabResult<()> {
        self.link.open().await?;
        tokio::time::sleep(self.boot_delay).await;
        {
            let mut session = self.link.session().await?;
            let stale = session.drain(Duration::from_millis(100)).await;
            tracing::debug!(device = self.link.device(), stale, "drained boot output");
        }
        self.read_max_feeds().await?;
        self.cmd("M17").await?;
        self.cmd("G21").await?;
        self.cmd("G90").await?;
        self.cmd("M211 S1").await?;
        Ok(())
    }

    /// Close the port.
    pub async fn close(&self) {
        self.link.close().await;
    }

    /// Whether the port is open.
    pub async fn is_open(&self) -> bool {
        self.link.is_open().await
    }

    /// Send one line and collect every reply line before `ok`.
    pub async fn cmd_lines(&self, line: &str) -> LabResult<Vec<String>> {
        let line = line.trim();
        let mut session = self.link.session().await?;
        session.write_line(line, "\n").await?;
        let mut lines = Vec::new();
        loop {
            let reply = session.read_until(b'\n', line).await?;
            let reply = reply.trim();
            if reply.is_empty() {
                continue;
            }
            let lower = reply.to_lowercase();
            if lower.starts_with("ok") {
                return Ok(lines);
            }
            if lower.starts_with("error") {
                return Err(LabError::hardware(
                    session.device(),
                    format!("{line:?} rejected: {reply}"),
                ));
            }
            if lower.starts_with("busy:") || lower == "wait" {
                continue;
            }
            lines.push(reply.to_string());
        }
    }

    /// Send one line and wait for `ok`.
    pub async fn cmd(&self, line: &str) -> LabResult<()> {
        self.cmd_lines(line).await.map(|_| ())
    }

    async fn read_max_feeds(&self) -> LabResult<()> {
        let lines = self.cmd_lines("M503").await?;
        match parse_max_feeds(&lines) {
            Some(feeds) => {
                tracing::info!(device = self.link.device(), ?feeds, "firmware feed limits");
                *self.max_feed.lock() = feeds;
            }
            None => tracing::warn!(
                device = self.link.device(),
                "no M203 line in M503 dump, keeping default feed limits"
            ),
        }
        Ok(())
    }

    /// Clamp `feed` (mm/min) to the slowest moving axis.
    pub fn clamp_feed(&self, x: bool, y: bool, z: bool, feed: f64) -> u32 {
        let limits = self.max_feed();
        let slowest = [(x, limits.x), (y, limits.y), (z, limits.z)]
            .iter()
            .filter(|(moving, _)| *moving)
            .map(|(_, mm_s)| mm_s * 60.0)
            .fold(f64::INFINITY, f64::min);
        feed.min(slowest).max(1.0) as u32
    }

    /// Absolute `G1` move, waiting for it to finish (`M400`).
    pub async fn move_to(
        &self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feed: f64,
    ) -> LabResult<()> {
        let feed = self.clamp_feed(x.is_some(), y.is_some(), z.is_some(), feed);
        let mut words = vec!["G1".to_string()];
        words.extend(x.map(|v| axis_word('X', v)));
        words.extend(y.map(|v| axis_word('Y', v)));
        words.extend(z.map(|v| axis_word('Z', v)));
        words.push(format!("F{feed}"));
        self.cmd(&words.join(" ")).await?;
        self.cmd("M400").await
    }

    /// Home all axes.
    pub async fn home(&self) -> LabResult<()> {
        self.cmd("G28 X Y Z").await
    }

    /// Current position from `M114`.
    pub async fn location(&self) -> LabResult<StagePosition> {
        {
            let mut session = self.link.session().await?;
            session.drain(Duration::from_millis(20)).await;
        }
        let lines = self.cmd_lines("M114").await?;
        parse_position(&lines).ok_or_else(|| {
            LabError::parse(self.link.device(), format!("no position in M114 reply {lines:?}"))
        })
    }

    /// Enable or disable software endstops.
    pub async fn soft_endstops(&self, on: bool) -> LabResult<()> {
        self.cmd(if on { "M211 S1" } else { "M211 S0" }).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drivers::mock_serial::{self, MockDeviceHarness};

    /// Stateful Marlin firmware on the harness side of a mock port.
    pub(crate) fn simulate_marlin(mut device: MockDeviceHarness) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (mut x, mut y, mut z) = (0.0f64, 0.0f64, 0.0f64);
            let mut seen = Vec::new();
            while let Some(line) = device.next_command(b'\n').await {
                seen.push(line.clone());
                let mut words = line.split_whitespace();
                match words.next() {
                    Some("M503") => device.reply(
                        b"echo:; Maximum feedrates (units/s):\necho:  M203 X500.00 Y500.00 Z5.00 E25.00\nok\n",
                    ),
                    Some("M114") => device.reply(
                        format!("X:{x:.2} Y:{y:.2} Z:{z:.2} E:0.00 Count X:0 Y:0 Z:0\nok\n")
                            .as_bytes(),
                    ),
                    Some("G1") => {
                        for word in words {
                            let (axis, value) = word.split_at(1);
                            let value: f64 = value.parse().unwrap_or(0.0);
                            match axis {
                                "X" => x = value,
                                "Y" => y = value,
                                "Z" => z = value,
                                _ => {}
                            }
                        }
                        device.reply(b"ok\n");
                    }
                    Some("G28") => {
                        (x, y, z) = (0.0, 0.0, 0.0);
                        device.reply(b"echo:busy: processing\nok\n");
                    }
                    Some("G4") => device.reply(b"error:Unknown command\n"),
                    _ => device.reply(b"ok\n"),
                }
            }
            seen
        })
    }

    async fn stage() -> (MarlinStage, tokio::task::JoinHandle<Vec<String>>) {
        let (opener, device) = mock_serial::opener("mock://marlin");
        let firmware = simulate_marlin(device);
        let stage = MarlinStage::new(
            "Ender3_1",
            opener,
            Duration::from_millis(500),
            Duration::ZERO,
        );
        stage.open().await.unwrap();
        (stage, firmware)
    }

    #[test]
    fn parses_firmware_reports() {
        let dump = vec!["echo:  M203 X500.00 Y500.00 Z5.00 E25.00".to_string()];
        assert_eq!(
            parse_max_feeds(&dump),
            Some(AxisFeeds {
                x: 500.0,
                y: 500.0,
                z: 5.0
            })
        );
        let m114 = vec!["X:41.50 Y:83.00 Z:130.00 E:0.00 Count X:3320".to_string()];
        let position = parse_position(&m114).unwrap();
        assert_eq!((position.x, position.y, position.z), (41.5, 83.0, 130.0));
        assert_eq!(parse_position(&["ok".to_string()]), None);
    }

    #[tokio::test]
    async fn open_reads_limits_and_initialises() {
        let (stage, firmware) = stage().await;
        assert_eq!(stage.max_feed().z, 5.0);
        stage.close().await;
        let seen = firmware.await.unwrap();
        assert_eq!(seen, vec!["M503", "M17", "G21", "G90", "M211 S1"]);
    }

    #[tokio::test]
    async fn feed_is_clamped_to_slowest_axis() {
        let (stage, _firmware) = stage().await;
        assert_eq!(stage.clamp_feed(true, true, false, 9000.0), 9000);
        assert_eq!(stage.clamp_feed(false, false, true, 9000.0), 300);
        assert_eq!(stage.clamp_feed(true, false, true, 9000.0), 300);
    }

    #[tokio::test]
    async fn move_then_locate() {
        let (stage, firmware) = stage().await;
        stage.move_to(Some(41.5), Some(83.0), None, 9000.0).await.unwrap();
        let position = stage.location().await.unwrap();
        assert_eq!((position.x, position.y), (41.5, 83.0));
        stage.close().await;
        let seen = firmware.await.unwrap();
        assert!(seen.contains(&"G1 X41.5 Y83 F9000".to_string()));
        assert!(seen.contains(&"M400".to_string()));
    }

    #[tokio::test]
    async fn firmware_error_is_hardware_error() {
        let (stage, _firmware) = stage().await;
        assert!(matches!(
            stage.cmd("G4 P0").await,
            Err(LabError::Hardware { .. })
        ));
    }

    #[tokio::test]
    async fn echo_lines_are_collected_busy_lines_skipped() {
        let (stage, _firmware) = stage().await;
        stage.home().await.unwrap();
        let lines = stage.cmd_lines("M503").await.unwrap();
        assert_eq!(lines.len(), 2);
    }
}
