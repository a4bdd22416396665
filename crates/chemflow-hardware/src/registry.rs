//! Device Registry
//!
//! Central store of the instruments on the bench, partitioned by category and
//! keyed by instance name. The registry owns every device for the length of a
//! run; the dispatcher borrows typed handles from it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DeviceRegistry                         │
//! │  pumps │ liquid_handlers │ temperature_controllers │ valves │ …│
//! │   name → DeviceHandle { Arc<dyn Device>, DeviceRole }         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FlowPump | SyringePump | SelectorValve | LiquidHandler | …   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ViciM6Pump | PhdUltra | ViciValve | Gx281 | Ender3 | Tc720   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Names are unique within a category; the same name may appear in two
//! categories. Lookups never fail: a miss is `None`.

use chemflow_core::capabilities::{
    FlowPump, LiquidHandler, SelectorValve, Spectrometer, SyringePump, TemperatureController,
};
use chemflow_core::{Device, LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Categories and roles
// =============================================================================

/// Registry partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    /// Flow and syringe pumps
    Pumps,
    /// XYZ needle robots
    LiquidHandlers,
    /// Thermoelectric controllers
    TemperatureControllers,
    /// Selector valves
    Valves,
    /// Photoreactor light beds
    LightBeds,
    /// UV/Vis detectors
    UvDetectors,
}

impl DeviceCategory {
    /// Every category, in registry order.
    pub const ALL: [DeviceCategory; 6] = [
        DeviceCategory::Pumps,
        DeviceCategory::LiquidHandlers,
        DeviceCategory::TemperatureControllers,
        DeviceCategory::Valves,
        DeviceCategory::LightBeds,
        DeviceCategory::UvDetectors,
    ];

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceCategory::Pumps => "pumps",
            DeviceCategory::LiquidHandlers => "liquid_handlers",
            DeviceCategory::TemperatureControllers => "temperature_controllers",
            DeviceCategory::Valves => "valves",
            DeviceCategory::LightBeds => "light_beds",
            DeviceCategory::UvDetectors => "uv_detectors",
        }
    }
}

impl std::fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceCategory {
    type Err = LabError;

    fn from_str(s: &str) -> LabResult<Self> {
        DeviceCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LabError::not_found(format!("unknown device category {s:?}")))
    }
}

/// Capability a registered device is used through.
#[derive(Clone)]
pub enum DeviceRole {
    /// Calibrated aspirate/dispense pump
    FlowPump(Arc<dyn FlowPump>),
    /// Syringe pump
    SyringePump(Arc<dyn SyringePump>),
    /// Selector valve
    Valve(Arc<dyn SelectorValve>),
    /// Temperature controller
    Temperature(Arc<dyn TemperatureController>),
    /// Liquid handler
    LiquidHandler(Arc<dyn LiquidHandler>),
    /// Spectrometer
    Spectrometer(Arc<dyn Spectrometer>),
    /// Lifecycle only
    Generic,
}

impl DeviceRole {
    /// Short role name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceRole::FlowPump(_) => "flow_pump",
            DeviceRole::SyringePump(_) => "syringe_pump",
            DeviceRole::Valve(_) => "valve",
            DeviceRole::Temperature(_) => "temperature_controller",
            DeviceRole::LiquidHandler(_) => "liquid_handler",
            DeviceRole::Spectrometer(_) => "spectrometer",
            DeviceRole::Generic => "generic",
        }
    }

    /// Whether this role may be registered under `category`.
    pub fn fits(&self, category: DeviceCategory) -> bool {
        use DeviceCategory as C;
        matches!(
            (self, category),
            (DeviceRole::FlowPump(_) | DeviceRole::SyringePump(_), C::Pumps)
                | (DeviceRole::Valve(_), C::Valves)
                | (DeviceRole::Temperature(_), C::TemperatureControllers)
                | (DeviceRole::LiquidHandler(_), C::LiquidHandlers)
                | (DeviceRole::Spectrometer(_), C::UvDetectors)
                | (DeviceRole::Generic, C::LightBeds | C::UvDetectors)
        )
    }
}

/// A registered device: its lifecycle handle plus its typed role.
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<dyn Device>,
    role: DeviceRole,
}

impl DeviceHandle {
    /// Handle for a flow pump.
    pub fn flow_pump<T: FlowPump + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::FlowPump(device),
        }
    }

    /// Handle for a syringe pump.
    pub fn syringe_pump<T: SyringePump + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::SyringePump(device),
        }
    }

    /// Handle for a selector valve.
    pub fn valve<T: SelectorValve + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::Valve(device),
        }
    }

    /// Handle for a temperature controller.
    pub fn temperature<T: TemperatureController + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::Temperature(device),
        }
    }

    /// Handle for a liquid handler.
    pub fn liquid_handler<T: LiquidHandler + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::LiquidHandler(device),
        }
    }

    /// Handle for a spectrometer.
    pub fn spectrometer<T: Spectrometer + 'static>(device: Arc<T>) -> Self {
        Self {
            device: device.clone(),
            role: DeviceRole::Spectrometer(device),
        }
    }

    /// Handle for a device used only through its lifecycle.
    pub fn generic(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            role: DeviceRole::Generic,
        }
    }

    /// Lifecycle handle.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Typed role.
    pub fn role(&self) -> &DeviceRole {
        &self.role
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.device.name())
            .field("role", &self.role.kind())
            .field("state", &self.device.state())
            .finish()
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Category-partitioned device store.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    categories: BTreeMap<DeviceCategory, BTreeMap<String, DeviceHandle>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as `name` under `category`.
    ///
    /// # Errors
    /// `Validation` if the role does not belong to the category, `Duplicate`
    /// if the name is taken within the category.
    pub fn register(
        &mut self,
        category: DeviceCategory,
        name: impl Into<String>,
        handle: DeviceHandle,
    ) -> LabResult<()> {
        let name = name.into();
        if !handle.role.fits(category) {
            return Err(LabError::validation(format!(
                "a {} cannot be registered under {category}",
                handle.role.kind()
            )));
        }
        let devices = self.categories.entry(category).or_default();
        if devices.contains_key(&name) {
            return Err(LabError::Duplicate {
                category: category.to_string(),
                name,
            });
        }
        tracing::debug!(%category, %name, role = handle.role.kind(), "device registered");
        devices.insert(name, handle);
        Ok(())
    }

    /// Remove a device. Returns whether it was present.
    pub fn unregister(&mut self, category: DeviceCategory, name: &str) -> bool {
        self.categories
            .get_mut(&category)
            .is_some_and(|devices| devices.remove(name).is_some())
    }

    /// Device by category and name.
    pub fn get(&self, category: DeviceCategory, name: &str) -> Option<&DeviceHandle> {
        self.categories.get(&category)?.get(name)
    }

    /// Whether `name` is registered under `category`.
    pub fn contains(&self, category: DeviceCategory, name: &str) -> bool {
        self.get(category, name).is_some()
    }

    /// Names in `category`, sorted.
    pub fn list_names(&self, category: DeviceCategory) -> Vec<String> {
        self.categories
            .get(&category)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Handles in `category`, sorted by name.
    pub fn in_category(&self, category: DeviceCategory) -> Vec<(&str, &DeviceHandle)> {
        self.categories
            .get(&category)
            .map(|devices| devices.iter().map(|(n, h)| (n.as_str(), h)).collect())
            .unwrap_or_default()
    }

    /// Every device, by category then name.
    pub fn devices(&self) -> impl Iterator<Item = (DeviceCategory, &str, &DeviceHandle)> {
        self.categories.iter().flat_map(|(category, devices)| {
            devices
                .iter()
                .map(move |(name, handle)| (*category, name.as_str(), handle))
        })
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.categories.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Pump `name` as a flow pump.
    pub fn flow_pump(&self, name: &str) -> Option<Arc<dyn FlowPump>> {
        match self.get(DeviceCategory::Pumps, name)?.role() {
            DeviceRole::FlowPump(pump) => Some(pump.clone()),
            _ => None,
        }
    }

    /// Pump `name` as a syringe pump.
    pub fn syringe_pump(&self, name: &str) -> Option<Arc<dyn SyringePump>> {
        match self.get(DeviceCategory::Pumps, name)?.role() {
            DeviceRole::SyringePump(pump) => Some(pump.clone()),
            _ => None,
        }
    }

    /// Valve `name`.
    pub fn valve(&self, name: &str) -> Option<Arc<dyn SelectorValve>> {
        match self.get(DeviceCategory::Valves, name)?.role() {
            DeviceRole::Valve(valve) => Some(valve.clone()),
            _ => None,
        }
    }

    /// Temperature controller `name`.
    pub fn temperature_controller(&self, name: &str) -> Option<Arc<dyn TemperatureController>> {
        match self.get(DeviceCategory::TemperatureControllers, name)?.role() {
            DeviceRole::Temperature(tc) => Some(tc.clone()),
            _ => None,
        }
    }

    /// Liquid handler `name`.
    pub fn liquid_handler(&self, name: &str) -> Option<Arc<dyn LiquidHandler>> {
        match self.get(DeviceCategory::LiquidHandlers, name)?.role() {
            DeviceRole::LiquidHandler(lh) => Some(lh.clone()),
            _ => None,
        }
    }

    /// Spectrometer `name`.
    pub fn spectrometer(&self, name: &str) -> Option<Arc<dyn Spectrometer>> {
        match self.get(DeviceCategory::UvDetectors, name)?.role() {
            DeviceRole::Spectrometer(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Every valve, sorted by name.
    pub fn valves(&self) -> Vec<(String, Arc<dyn SelectorValve>)> {
        self.in_category(DeviceCategory::Valves)
            .into_iter()
            .filter_map(|(name, handle)| match handle.role() {
                DeviceRole::Valve(valve) => Some((name.to_string(), valve.clone())),
                _ => None,
            })
            .collect()
    }

    // =========================================================================
    // Bulk lifecycle
    // =========================================================================

    /// Connect every device, stopping at the first failure.
    pub async fn connect_all(&self) -> LabResult<()> {
        for (category, name, handle) in self.devices() {
            tracing::info!(%category, %name, "connecting");
            handle.device().connect().await?;
        }
        Ok(())
    }

    /// Close every device. Never fails; returns how many closes failed.
    pub async fn close_all(&self) -> usize {
        let mut failures = 0;
        for (category, name, handle) in self.devices() {
            if let Err(e) = handle.device().close().await {
                failures += 1;
                tracing::warn!(%category, %name, error = %e, "close failed, continuing");
            }
        }
        failures
    }

    /// Stop every device. Never fails; returns how many stops failed.
    pub async fn stop_all(&self) -> usize {
        let mut failures = 0;
        for (category, name, handle) in self.devices() {
            if let Err(e) = handle.device().stop().await {
                failures += 1;
                tracing::warn!(%category, %name, error = %e, "stop failed, continuing");
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{MockLiquidHandler, MockPump, MockValve};
    use chemflow_core::geometry::RackType;
    use chemflow_core::ConnectionState;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry
            .register(
                DeviceCategory::Pumps,
                "Pump_1",
                DeviceHandle::flow_pump(Arc::new(MockPump::new("Pump_1"))),
            )
            .unwrap();
        registry
            .register(
                DeviceCategory::Valves,
                "Valve_2",
                DeviceHandle::valve(Arc::new(MockValve::new("Valve_2", 6))),
            )
            .unwrap();
        registry
            .register(
                DeviceCategory::Valves,
                "Valve_1",
                DeviceHandle::valve(Arc::new(MockValve::new("Valve_1", 10))),
            )
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_name_in_category_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register(
                DeviceCategory::Pumps,
                "Pump_1",
                DeviceHandle::flow_pump(Arc::new(MockPump::new("Pump_1"))),
            )
            .unwrap_err();
        assert!(matches!(err, LabError::Duplicate { .. }));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn same_name_in_another_category_is_allowed() {
        let mut registry = registry();
        let handler = MockLiquidHandler::new("Pump_1", RackType::R204).unwrap();
        registry
            .register(
                DeviceCategory::LiquidHandlers,
                "Pump_1",
                DeviceHandle::liquid_handler(Arc::new(handler)),
            )
            .unwrap();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn role_must_fit_category() {
        let mut registry = DeviceRegistry::new();
        let result = registry.register(
            DeviceCategory::Valves,
            "Pump_9",
            DeviceHandle::flow_pump(Arc::new(MockPump::new("Pump_9"))),
        );
        assert!(matches!(result, Err(LabError::Validation(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn lookups_miss_quietly() {
        let registry = registry();
        assert!(registry.get(DeviceCategory::Pumps, "Pump_7").is_none());
        assert!(registry.flow_pump("Pump_1").is_some());
        assert!(registry.syringe_pump("Pump_1").is_none());
        assert!(registry.list_names(DeviceCategory::LightBeds).is_empty());
    }

    #[test]
    fn names_are_sorted() {
        let registry = registry();
        assert_eq!(
            registry.list_names(DeviceCategory::Valves),
            vec!["Valve_1", "Valve_2"]
        );
        let names: Vec<String> = registry.valves().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Valve_1", "Valve_2"]);
    }

    #[test]
    fn unregister_reports_presence() {
        let mut registry = registry();
        assert!(registry.unregister(DeviceCategory::Valves, "Valve_1"));
        assert!(!registry.unregister(DeviceCategory::Valves, "Valve_1"));
        assert!(!registry.unregister(DeviceCategory::LightBeds, "Valve_1"));
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!(
            "Liquid_Handlers".parse::<DeviceCategory>().unwrap(),
            DeviceCategory::LiquidHandlers
        );
        assert!("fridges".parse::<DeviceCategory>().is_err());
    }

    #[tokio::test]
    async fn close_all_continues_past_failures() {
        let pump = Arc::new(MockPump::new("Pump_1"));
        pump.log().fail_on("close");
        let valve = Arc::new(MockValve::new("Valve_1", 6));

        let mut registry = DeviceRegistry::new();
        registry
            .register(DeviceCategory::Pumps, "Pump_1", DeviceHandle::flow_pump(pump.clone()))
            .unwrap();
        registry
            .register(DeviceCategory::Valves, "Valve_1", DeviceHandle::valve(valve.clone()))
            .unwrap();
        registry.connect_all().await.unwrap();

        assert_eq!(registry.close_all().await, 1);
        assert_eq!(valve.state(), ConnectionState::Disconnected);
        assert!(valve.log().calls().contains(&"close".to_string()));
    }
}
