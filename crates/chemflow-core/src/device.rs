//! Device lifecycle contract shared by every driver.
//!
//! Every bench device, whatever its wire protocol, exposes the same three
//! lifecycle operations:
//!
//! - `connect()` is idempotent and performs a protocol-level handshake. A
//!   device that cannot be opened or stays silent on its probe yields
//!   [`LabError::Connection`](crate::LabError::Connection).
//! - `close()` tears the transport down and is safe to call repeatedly.
//! - `stop()` drives the device to a physically safe state and must succeed on
//!   an already stopped device.
//!
//! Kind-specific operations live in [`crate::capabilities`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::LabResult;

/// Connection state of a single device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport closed (initial state, and after `close()`)
    Disconnected,
    /// Transport open and handshake answered
    Connected,
    /// Last connect attempt or exchange left the device unusable
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Interior-mutable holder for a device's [`ConnectionState`].
///
/// Drivers embed one of these and flip it from `connect`/`close`.
#[derive(Debug)]
pub struct ConnectionCell {
    state: RwLock<ConnectionState>,
}

impl ConnectionCell {
    /// New cell in the `Disconnected` state.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Replace the state, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    /// Shorthand for `get() == Connected`.
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform lifecycle for every registered device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Instance name, unique within its registry category.
    fn name(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Open the transport and handshake. No-op when already connected.
    async fn connect(&self) -> LabResult<()>;

    /// Close the transport. Safe to call multiple times.
    async fn close(&self) -> LabResult<()>;

    /// Bring the device to a physically safe state.
    async fn stop(&self) -> LabResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_cell_tracks_transitions() {
        let cell = ConnectionCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert!(!cell.is_connected());

        let previous = cell.set(ConnectionState::Connected);
        assert_eq!(previous, ConnectionState::Disconnected);
        assert!(cell.is_connected());

        cell.set(ConnectionState::Error);
        assert_eq!(cell.get().to_string(), "error");
    }
}
