//! Core abstractions for the chemflow bench controller.
//!
//! This crate carries everything a device driver or the command interpreter
//! needs without pulling in any concrete driver:
//!
//! - [`error`]: the [`LabError`] taxonomy crossing the driver boundary
//! - [`device`]: the [`Device`] lifecycle contract and connection state
//! - [`capabilities`]: per-kind traits (valves, pumps, temperature, liquid handlers)
//! - [`serial`]: exclusive, timeout-bounded access to a byte-stream transport
//! - [`geometry`]: rack/bed/well coordinate tables

pub mod capabilities;
pub mod device;
pub mod error;
pub mod geometry;
pub mod serial;

pub use device::{ConnectionCell, ConnectionState, Device};
pub use error::{LabError, LabResult};
