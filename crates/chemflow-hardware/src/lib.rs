//! Device drivers, the named-device registry and hardware configuration.

pub use chemflow_core::capabilities;
pub mod config;
pub mod drivers;
pub mod registry;

pub use capabilities::*;
pub use config::{
    create_registry_from_config, create_registry_from_file, validate_driver_config, DeviceConfig,
    DriverType, HardwareConfig, HardwareDefaults,
};
pub use registry::{DeviceCategory, DeviceHandle, DeviceRegistry, DeviceRole};
