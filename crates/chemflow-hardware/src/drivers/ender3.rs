//! Ender-3 printer used as a single-bed liquid handler.
//!
//! The handler owns a [`MarlinStage`] and adds the envelope, the safe-height
//! interlock and the fixed rack-304 deck on top of it.

use async_trait::async_trait;
use chemflow_core::capabilities::{Envelope, LiquidHandler, XyReading};
use chemflow_core::geometry::{Deck, RackType};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabResult};
use tokio::sync::Mutex;
use tracing::instrument;

use super::marlin::MarlinStage;

/// Travel limits of the Ender-3 bed.
pub const ENDER3_ENVELOPE: Envelope = Envelope {
    x: (0.0, 225.0),
    y: (0.0, 225.0),
    z: (0.0, 250.0),
};

/// Needle height for lateral moves, just below the Z limit.
pub const ENDER3_SAFE_Z: f64 = 245.0;

/// Lateral feed (mm/min).
pub const XY_FEED: f64 = 9000.0;

/// Vertical feed (mm/min).
pub const Z_FEED: f64 = 300.0;

/// Height reached right after homing.
pub const HOME_LIFT: f64 = 130.0;

/// Ender-3 liquid handler.
pub struct Ender3LiquidHandler {
    name: String,
    stage: MarlinStage,
    state: ConnectionCell,
    deck: Deck,
    motion: Mutex<()>,
    z: parking_lot::Mutex<Option<f64>>,
}

impl Ender3LiquidHandler {
    /// Wrap `stage` as a handler named `name`.
    pub fn new(name: impl Into<String>, stage: MarlinStage) -> LabResult<Self> {
        Ok(Self {
            name: name.into(),
            stage,
            state: ConnectionCell::new(),
            deck: Deck::single_bed(RackType::R304)?,
            motion: Mutex::new(()),
            z: parking_lot::Mutex::new(None),
        })
    }

    /// Underlying G-code stage.
    pub fn stage(&self) -> &MarlinStage {
        &self.stage
    }
}

#[async_trait]
impl Device for Ender3LiquidHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[instrument(skip(self), fields(device = %self.name, port = self.stage.address()), err)]
    async fn connect(&self) -> LabResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        match self.stage.open().await {
            Ok(()) => {
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, feeds = ?self.stage.max_feed(), "liquid handler connected");
                Ok(())
            }
            Err(e) => {
                self.stage.close().await;
                self.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn close(&self) -> LabResult<()> {
        self.stage.close().await;
        *self.z.lock() = None;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn stop(&self) -> LabResult<()> {
        if !self.stage.is_open().await {
            return Ok(());
        }
        self.travel_z(ENDER3_SAFE_Z).await.map(|_| ())
    }
}

#[async_trait]
impl LiquidHandler for Ender3LiquidHandler {
    fn safe_z(&self) -> f64 {
        ENDER3_SAFE_Z
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
        self.stage.home().await?;
        self.stage.cmd("G90").await?;
        self.travel_z(HOME_LIFT).await?;
        self.raise_to_safe_z().await?;
        self.travel_xy(0.0, 0.0).await?;
        Ok(())
    }

    async fn travel_xy(&self, x: f64, y: f64) -> LabResult<(f64, f64)> {
        let (x, y) = ENDER3_ENVELOPE.clamp_xy(&self.name, x, y);
        self.stage.move_to(Some(x), Some(y), None, XY_FEED).await?;
        Ok((x, y))
    }

    async fn travel_z(&self, z: f64) -> LabResult<f64> {
        let z = ENDER3_ENVELOPE.clamp_z(&self.name, z);
        *self.z.lock() = None;
        self.stage.move_to(None, None, Some(z), Z_FEED).await?;
        *self.z.lock() = Some(z);
        Ok(z)
    }

    async fn read_xy(&self) -> LabResult<XyReading> {
        let position = self.stage.location().await?;
        Ok(XyReading::At {
            x: position.x,
            y: position.y,
        })
    }

    async fn read_z(&self) -> LabResult<Option<f64>> {
        Ok(Some(self.stage.location().await?.z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::marlin::tests::simulate_marlin;
    use crate::drivers::mock_serial;
    use std::time::Duration;

    async fn handler() -> (Ender3LiquidHandler, tokio::task::JoinHandle<Vec<String>>) {
        let (opener, device) = mock_serial::opener("mock://ender3");
        let firmware = simulate_marlin(device);
        let stage = MarlinStage::new("Ender3_1", opener, Duration::from_millis(500), Duration::ZERO);
        let handler = Ender3LiquidHandler::new("Ender3_1", stage).unwrap();
        handler.connect().await.unwrap();
        (handler, firmware)
    }

    fn motion(seen: &[String]) -> Vec<String> {
        seen.iter()
            .filter(|line| line.starts_with("G1") || line.starts_with("G28"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn home_lifts_then_parks_through_the_interlock() {
        let (handler, firmware) = handler().await;
        handler.home().await.unwrap();
        handler.close().await.unwrap();
        let seen = firmware.await.unwrap();
        assert_eq!(
            motion(&seen),
            vec!["G28 X Y Z", "G1 Z130 F300", "G1 Z245 F300", "G1 X0 Y0 F9000"]
        );
    }

    #[tokio::test]
    async fn well_moves_use_the_fixed_rack() {
        let (handler, firmware) = handler().await;
        let well = handler.move_to_well(1, 6).await.unwrap();
        assert_eq!((well.x, well.y), (71.5, 71.5));
        assert!(handler.set_bed_layout(2, RackType::R304).await.is_err());
        handler.close().await.unwrap();
        let seen = firmware.await.unwrap();
        // Z was unknown: M114 query, raise, then the lateral move
        assert_eq!(motion(&seen), vec!["G1 Z245 F300", "G1 X71.5 Y71.5 F9000"]);
        assert!(seen.contains(&"M114".to_string()));
    }

    #[tokio::test]
    async fn no_raise_when_already_at_safe_height() {
        let (handler, firmware) = handler().await;
        handler.move_z(ENDER3_SAFE_Z).await.unwrap();
        handler.move_xy(300.0, 10.0).await.unwrap();
        handler.close().await.unwrap();
        let seen = firmware.await.unwrap();
        assert_eq!(motion(&seen), vec!["G1 Z245 F300", "G1 X225 Y10 F9000"]);
    }

    #[tokio::test]
    async fn stop_parks_needle() {
        let (handler, firmware) = handler().await;
        handler.move_z(20.0).await.unwrap();
        handler.stop().await.unwrap();
        handler.close().await.unwrap();
        let seen = firmware.await.unwrap();
        assert_eq!(motion(&seen), vec!["G1 Z20 F300", "G1 Z245 F300"]);
    }
}
