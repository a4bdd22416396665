//! Harvard Apparatus PHD ULTRA syringe pump.
//!
//! Protocol Overview:
//! - Format: plain-text commands (`irate 100 ul/min`, `irun`, ...) ending in CR,
//!   optionally prefixed by a two-digit daisy-chain address
//! - Baud: 9600, 8N1, no flow control
//! - Replies end with a status prompt: `:` idle, `>` infusing, `<` withdrawing,
//!   `*` stalled, `T*` target reached (optionally preceded by the address)
//!
//! Syringes are selected from the Air-Tite catalogue by nominal volume; the
//! pump derives its plunger travel from the inner diameter.

use async_trait::async_trait;
use chemflow_core::capabilities::SyringePump;
use chemflow_core::serial::{PortOpener, SerialLink};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 9600;

/// Air-Tite syringe catalogue: nominal volume (mL) to inner diameter (mm).
pub const AIR_TITE_SYRINGES: [(f64, f64); 6] = [
    (1.0, 4.69),
    (2.5, 9.65),
    (5.0, 12.45),
    (10.0, 15.90),
    (20.0, 20.05),
    (30.0, 22.90),
];

static PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\n)\s*\d{0,2}(?::|>|<|\*|T\*)\s*$").expect("Invalid prompt regex")
});

/// Inner diameter (mm) for an Air-Tite syringe size.
pub fn syringe_diameter(size_ml: f64) -> Option<f64> {
    AIR_TITE_SYRINGES
        .iter()
        .find(|(size, _)| (size - size_ml).abs() < 1e-9)
        .map(|(_, diameter)| *diameter)
}

/// Format with four significant digits, dropping trailing zeros.
///
/// Switches to exponent notation outside `1e-4..1e4`, which the pump accepts.
pub fn four_significant(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }
    let exponent = value.abs().log10().floor() as i32;
    if !(-4..4).contains(&exponent) {
        let formatted = format!("{value:.3e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let mantissa = trim_fraction(mantissa);
                let exp: i32 = exp.parse().unwrap_or(0);
                format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
            }
            None => formatted,
        };
    }
    let decimals = (3 - exponent).max(0) as usize;
    trim_fraction(&format!("{value:.decimals$}")).to_string()
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Driver for a PHD ULTRA pump.
pub struct PhdUltra {
    name: String,
    link: SerialLink,
    state: ConnectionCell,
    address: u8,
    settle_margin: Duration,
    syringe_ml: parking_lot::Mutex<Option<f64>>,
    operation: Mutex<()>,
}

impl PhdUltra {
    /// New, unconnected pump at daisy-chain `address` (0 = no prefix).
    pub fn new(
        name: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        address: u8,
        timeout: Duration,
        settle_margin: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            link: SerialLink::new(name.clone(), opener, timeout),
            name,
            state: ConnectionCell::new(),
            address,
            settle_margin,
            syringe_ml: parking_lot::Mutex::new(None),
            operation: Mutex::new(()),
        }
    }

    /// Currently selected syringe size (mL).
    pub fn syringe(&self) -> Option<f64> {
        *self.syringe_ml.lock()
    }

    /// Send one command and return the reply text before the prompt.
    pub async fn send(&self, body: &str) -> LabResult<String> {
        let command = if self.address == 0 {
            body.to_string()
        } else {
            format!("{:02}{body}", self.address)
        };
        let mut session = self.link.session().await?;
        session.drain(Duration::from_millis(20)).await;
        session.write_line(&command, "\r").await?;
        let raw = session
            .read_until_with(&command, |text| PROMPT.is_match(text))
            .await?;
        let body = match PROMPT.find(&raw) {
            Some(prompt) => &raw[..prompt.start()],
            None => raw.as_str(),
        };
        let reply = body.trim().to_string();
        tracing::debug!(device = %self.name, command = %command, %reply, "phd reply");
        Ok(reply)
    }

    /// Switch to the quick-start infuse method unless already active.
    pub async fn quick_start_infuse(&self) -> LabResult<String> {
        let mode = self.send("mode").await?.to_lowercase();
        if mode.contains("infuse only") || mode.contains("qs i") {
            return Ok(mode);
        }
        if mode.contains("satellite") {
            self.send("unlock").await?;
        }
        self.send("load qs i").await
    }

    /// Pump status line.
    pub async fn status(&self) -> LabResult<String> {
        self.send("status").await
    }

    /// Firmware version.
    pub async fn version(&self) -> LabResult<String> {
        self.send("ver").await
    }
}

#[async_trait]
impl Device for PhdUltra {
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
        match self.version().await {
            Ok(version) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, %version, "syringe pump connected");
                Ok(())
            }
            Err(e) => {
                self.link.close().await;
                self.state.set(ConnectionState::Error);
                Err(LabError::connection(&self.name, format!("no answer to ver: {e}")))
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
        self.send("stop").await.map(|_| ())
    }
}

#[async_trait]
impl SyringePump for PhdUltra {
    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn select_syringe(&self, size_ml: f64) -> LabResult<()> {
        let diameter = syringe_diameter(size_ml).ok_or_else(|| {
            let sizes: Vec<f64> = AIR_TITE_SYRINGES.iter().map(|(size, _)| *size).collect();
            LabError::validation(format!(
                "unsupported syringe size {size_ml} mL; choose from {sizes:?}"
            ))
        })?;
        let _operation = self.operation.lock().await;
        self.send(&format!("svolume {} ul", size_ml * 1000.0)).await?;
        self.send(&format!("diameter {diameter:.3}")).await?;
        *self.syringe_ml.lock() = Some(size_ml);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn infuse(&self, volume_ul: f64, rate_ul_min: f64) -> LabResult<()> {
        if !(rate_ul_min.is_finite() && rate_ul_min > 0.0) {
            return Err(LabError::validation(format!(
                "infusion rate must be positive, got {rate_ul_min} uL/min"
            )));
        }
        if !(volume_ul.is_finite() && volume_ul > 0.0) {
            return Err(LabError::validation(format!(
                "infusion volume must be positive, got {volume_ul} uL"
            )));
        }

        let _operation = self.operation.lock().await;
        self.send(&format!("irate {} ul/min", four_significant(rate_ul_min)))
            .await?;
        self.send("cvolume").await?;
        self.send(&format!("tvolume {volume_ul} ul")).await?;
        self.send("irun").await?;

        // the pump stops itself at the target volume
        let wait = Duration::from_secs_f64(volume_ul / rate_ul_min * 60.0) + self.settle_margin;
        tracing::info!(device = %self.name, volume_ul, rate_ul_min, wait_s = wait.as_secs_f64(), "infusing");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn withdraw(&self) -> LabResult<()> {
        let _operation = self.operation.lock().await;
        let mode = self.send("mode").await?;
        if !mode.to_lowercase().contains("withdraw") {
            return Err(LabError::hardware(
                &self.name,
                format!("current mode does not allow withdraw: {mode:?}"),
            ));
        }
        self.send("wrun").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial::{self, MockDeviceHarness};

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn connected(address: u8) -> (Arc<PhdUltra>, MockDeviceHarness) {
        let (opener, mut device) = mock_serial::opener("mock://phd");
        let pump = Arc::new(PhdUltra::new(
            "HarvardPump_1",
            opener,
            address,
            TIMEOUT,
            Duration::from_secs(2),
        ));
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move { pump.connect().await })
        };
        let probe = if address == 0 {
            "ver\r".to_string()
        } else {
            format!("{address:02}ver\r")
        };
        device
            .expect_and_respond(probe.as_bytes(), b"\r\nPHD ULTRA 3.0.4\r\n:")
            .await;
        task.await.unwrap().unwrap();
        (pump, device)
    }

    #[test]
    fn four_significant_matches_pump_format() {
        assert_eq!(four_significant(1000.0), "1000");
        assert_eq!(four_significant(41.33), "41.33");
        assert_eq!(four_significant(2.5), "2.5");
        assert_eq!(four_significant(123.456), "123.5");
        assert_eq!(four_significant(12345.0), "1.234e+04");
        assert_eq!(four_significant(0.5), "0.5");
    }

    #[test]
    fn prompt_pattern_matches_status_prompts() {
        assert!(PROMPT.is_match("\r\n:"));
        assert!(PROMPT.is_match("3000 ul/min\r\n>"));
        assert!(PROMPT.is_match("\r\n01T*"));
        assert!(!PROMPT.is_match("irate 100 ul/min"));
    }

    #[test]
    fn catalogue_lookup() {
        assert_eq!(syringe_diameter(10.0), Some(15.90));
        assert_eq!(syringe_diameter(2.5), Some(9.65));
        assert_eq!(syringe_diameter(3.0), None);
    }

    #[tokio::test]
    async fn connect_probes_version() {
        let (pump, _device) = connected(0).await;
        assert_eq!(pump.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn address_prefix_is_two_digits() {
        let (pump, mut device) = connected(1).await;
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move { pump.status().await })
        };
        device.expect_and_respond(b"01status\r", b"\r\n0 0 0 i\r\n01:").await;
        assert_eq!(task.await.unwrap().unwrap(), "0 0 0 i");
    }

    #[tokio::test]
    async fn select_syringe_sets_volume_then_diameter() {
        let (pump, mut device) = connected(0).await;
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move { pump.select_syringe(10.0).await })
        };
        device.expect_and_respond(b"svolume 10000 ul\r", b"\r\n:").await;
        device.expect_and_respond(b"diameter 15.900\r", b"\r\n:").await;
        task.await.unwrap().unwrap();
        assert_eq!(pump.syringe(), Some(10.0));
    }

    #[tokio::test]
    async fn unknown_syringe_is_rejected_locally() {
        let (pump, mut device) = connected(0).await;
        assert!(matches!(
            pump.select_syringe(7.0).await,
            Err(LabError::Validation(_))
        ));
        device.assert_no_writes();
    }

    #[tokio::test(start_paused = true)]
    async fn infuse_programs_run_and_waits_nominal_time() {
        let (pump, mut device) = connected(0).await;
        let started = tokio::time::Instant::now();
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move { pump.infuse(500.0, 1000.0).await })
        };
        device.expect_and_respond(b"irate 1000 ul/min\r", b"\r\n:").await;
        device.expect_and_respond(b"cvolume\r", b"\r\n:").await;
        device.expect_and_respond(b"tvolume 500 ul\r", b"\r\n:").await;
        device.expect_and_respond(b"irun\r", b"\r\n>").await;
        task.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(32));
    }

    #[tokio::test]
    async fn withdraw_requires_withdraw_mode() {
        let (pump, mut device) = connected(0).await;
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move { pump.withdraw().await })
        };
        device.expect_and_respond(b"mode\r", b"\r\nInfuse only\r\n:").await;
        assert!(matches!(task.await.unwrap(), Err(LabError::Hardware { .. })));
    }

    #[tokio::test]
    async fn zero_rate_never_reaches_the_wire() {
        let (pump, mut device) = connected(0).await;
        assert!(pump.infuse(100.0, 0.0).await.is_err());
        device.assert_no_writes();
    }
}
