//! Device-id resolution.
//!
//! Methods address devices by number (`pump_id=2`). Benches name them in a few
//! conventional ways (`Pump_2`, `VICI_M6_2`, `vici_pump_2`), so each kind tries
//! its conventions in order and then falls back to the first device of the
//! right capability in the category.

use chemflow_core::capabilities::{
    FlowPump, LiquidHandler, SelectorValve, SyringePump, TemperatureController,
};
use chemflow_core::{LabError, LabResult};
use chemflow_hardware::registry::{DeviceCategory, DeviceRegistry, DeviceRole};
use std::sync::Arc;

use crate::params::{DeviceId, ValveTarget};

/// Registry names tried for a flow pump.
pub fn pump_names(id: DeviceId) -> Vec<String> {
    vec![
        format!("Pump_{id}"),
        format!("VICI_M6_{id}"),
        format!("vici_pump_{id}"),
    ]
}

/// Registry names tried for a syringe pump.
pub fn syringe_pump_names(id: DeviceId) -> Vec<String> {
    vec![format!("HarvardPump_{id}"), format!("PhdUltra_{id}")]
}

/// Registry names tried for a valve.
pub fn valve_names(id: DeviceId) -> Vec<String> {
    vec![
        format!("Valve_{id}"),
        format!("ViciValve_{id}"),
        format!("vici_{id}"),
    ]
}

/// Registry names tried for a temperature controller.
pub fn temperature_names(id: DeviceId) -> Vec<String> {
    vec![
        format!("TC720_{id}"),
        format!("Temperature_{id}"),
        format!("temp_{id}"),
    ]
}

/// Registry names tried for a liquid handler.
pub fn liquid_handler_names(id: DeviceId) -> Vec<String> {
    vec![
        format!("GX281_{id}"),
        format!("Ender3_{id}"),
        "GX281".to_string(),
        "gx281".to_string(),
    ]
}

/// Looks devices up by numeric id.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a DeviceRegistry,
}

impl<'a> Resolver<'a> {
    /// Resolver over `registry`.
    pub fn new(registry: &'a DeviceRegistry) -> Self {
        Self { registry }
    }

    /// First conventional name with the wanted role, then the first device of
    /// that role in the category.
    fn find<T: ?Sized>(
        &self,
        category: DeviceCategory,
        what: &str,
        candidates: Vec<String>,
        pick: impl Fn(&DeviceRole) -> Option<Arc<T>>,
    ) -> LabResult<(String, Arc<T>)> {
        let by_name = candidates.iter().find_map(|name| {
            let handle = self.registry.get(category, name)?;
            pick(handle.role()).map(|device| (name.clone(), device))
        });
        if let Some(found) = by_name {
            return Ok(found);
        }

        let fallback = self
            .registry
            .in_category(category)
            .into_iter()
            .find_map(|(name, handle)| pick(handle.role()).map(|device| (name.to_string(), device)));
        match fallback {
            Some((name, device)) => {
                tracing::debug!(%category, %name, tried = ?candidates, "using first {what} in category");
                Ok((name, device))
            }
            None => Err(LabError::not_found(format!(
                "no {what} registered (tried {})",
                candidates.join(", ")
            ))),
        }
    }

    /// Flow pump for `pump_id`.
    pub fn flow_pump(&self, id: DeviceId) -> LabResult<(String, Arc<dyn FlowPump>)> {
        self.find(DeviceCategory::Pumps, "flow pump", pump_names(id), |role| match role {
            DeviceRole::FlowPump(pump) => Some(pump.clone()),
            _ => None,
        })
    }

    /// Syringe pump for `pump_id`.
    pub fn syringe_pump(&self, id: DeviceId) -> LabResult<(String, Arc<dyn SyringePump>)> {
        self.find(
            DeviceCategory::Pumps,
            "syringe pump",
            syringe_pump_names(id),
            |role| match role {
                DeviceRole::SyringePump(pump) => Some(pump.clone()),
                _ => None,
            },
        )
    }

    /// Temperature controller for `temp_id`.
    pub fn temperature(&self, id: DeviceId) -> LabResult<(String, Arc<dyn TemperatureController>)> {
        self.find(
            DeviceCategory::TemperatureControllers,
            "temperature controller",
            temperature_names(id),
            |role| match role {
                DeviceRole::Temperature(tc) => Some(tc.clone()),
                _ => None,
            },
        )
    }

    /// Liquid handler for `id`.
    pub fn liquid_handler(&self, id: DeviceId) -> LabResult<(String, Arc<dyn LiquidHandler>)> {
        self.find(
            DeviceCategory::LiquidHandlers,
            "liquid handler",
            liquid_handler_names(id),
            |role| match role {
                DeviceRole::LiquidHandler(lh) => Some(lh.clone()),
                _ => None,
            },
        )
    }

    /// One valve, or every valve for a broadcast.
    pub fn valves(&self, target: ValveTarget) -> LabResult<Vec<(String, Arc<dyn SelectorValve>)>> {
        match target {
            ValveTarget::All => {
                let valves = self.registry.valves();
                if valves.is_empty() {
                    return Err(LabError::not_found("no valves registered"));
                }
                Ok(valves)
            }
            ValveTarget::One(id) => {
                let valve = self.find(DeviceCategory::Valves, "valve", valve_names(id), |role| {
                    match role {
                        DeviceRole::Valve(valve) => Some(valve.clone()),
                        _ => None,
                    }
                })?;
                Ok(vec![valve])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemflow_hardware::drivers::mock::{MockPump, MockSyringePump, MockValve};
    use chemflow_hardware::registry::DeviceHandle;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry
            .register(
                DeviceCategory::Pumps,
                "HarvardPump_1",
                DeviceHandle::syringe_pump(Arc::new(MockSyringePump::new("HarvardPump_1"))),
            )
            .unwrap();
        registry
            .register(
                DeviceCategory::Pumps,
                "VICI_M6_2",
                DeviceHandle::flow_pump(Arc::new(MockPump::new("VICI_M6_2"))),
            )
            .unwrap();
        registry
            .register(
                DeviceCategory::Pumps,
                "Pump_1",
                DeviceHandle::flow_pump(Arc::new(MockPump::new("Pump_1"))),
            )
            .unwrap();
        for name in ["Valve_1", "vici_3"] {
            registry
                .register(
                    DeviceCategory::Valves,
                    name,
                    DeviceHandle::valve(Arc::new(MockValve::new(name, 6))),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn conventions_are_tried_in_order() {
        let registry = registry();
        let resolver = Resolver::new(&registry);
        assert_eq!(resolver.flow_pump(1).unwrap().0, "Pump_1");
        assert_eq!(resolver.flow_pump(2).unwrap().0, "VICI_M6_2");
        assert_eq!(resolver.valves(ValveTarget::One(3)).unwrap()[0].0, "vici_3");
    }

    #[test]
    fn fallback_skips_devices_of_the_wrong_role() {
        let registry = registry();
        let resolver = Resolver::new(&registry);
        // HarvardPump_1 sorts first but is not a flow pump
        assert_eq!(resolver.flow_pump(9).unwrap().0, "Pump_1");
        assert_eq!(resolver.syringe_pump(4).unwrap().0, "HarvardPump_1");
    }

    #[test]
    fn empty_category_is_not_found() {
        let registry = registry();
        let resolver = Resolver::new(&registry);
        assert!(matches!(resolver.temperature(1), Err(LabError::NotFound(_))));
        assert!(matches!(resolver.liquid_handler(1), Err(LabError::NotFound(_))));
    }

    #[test]
    fn broadcast_returns_every_valve() {
        let registry = registry();
        let names: Vec<_> = Resolver::new(&registry)
            .valves(ValveTarget::All)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["Valve_1", "vici_3"]);
    }
}
