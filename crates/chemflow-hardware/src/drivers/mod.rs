// Bench instruments
pub mod ender3;
pub mod gsioc;
pub mod gx281;
pub mod marlin;
pub mod phd_ultra;
pub mod tc720;
pub mod vici_m6;
pub mod vici_valve;

// Flow-to-steps conversion for the M6
pub mod motion_profile;

pub mod mock;
pub mod mock_serial;

pub use ender3::Ender3LiquidHandler;
pub use gsioc::{GsiocTransport, SerialGsioc};
pub use gx281::Gx281;
pub use marlin::MarlinStage;
pub use phd_ultra::PhdUltra;
pub use tc720::Tc720;
pub use vici_m6::ViciM6Pump;
pub use vici_valve::{ValveKind, ViciValve};
