//! Command value type and component tags.
//!
//! A [`Command`] is one step of a method: which kind of device it addresses,
//! the verb, a loose `key=value` parameter map, free-text notes, and the pause
//! taken after it runs. Parameters stay strings here; [`Action`](crate::Action)
//! turns them into a typed record at dispatch time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Pause after a command built in code.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(250);

/// Pause after a method-script row that leaves the delay empty.
pub const DEFAULT_SCRIPT_DELAY: Duration = Duration::from_millis(500);

/// Device kind addressed by a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    /// Join barrier over background pump runs
    Sync,
    /// Temperature controller
    Temperature,
    /// VICI selector valve with the given number of ways
    Valve(u8),
    /// Flow pump (VICI M6)
    Pump,
    /// Syringe pump (Harvard PHD ULTRA)
    HarvardPump,
    /// Gilson GX-281 liquid handler
    Gx281,
    /// Ender-3 liquid handler
    Ender3,
    /// Anything else, kept verbatim for the log
    Unknown(String),
}

impl Component {
    /// Classify a component tag. Never fails; unrecognised tags become
    /// [`Component::Unknown`].
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim();
        if tag.eq_ignore_ascii_case("sync") {
            return Component::Sync;
        }
        match tag {
            "Temperature" => Component::Temperature,
            "VICI-6Way" => Component::Valve(6),
            "VICI-10Way" => Component::Valve(10),
            "VICI-24Way" => Component::Valve(24),
            "Pump" => Component::Pump,
            "HarvardPump" => Component::HarvardPump,
            "GX-281" => Component::Gx281,
            "Ender3" => Component::Ender3,
            other => Component::Unknown(other.to_string()),
        }
    }

    /// Whether this addresses a liquid handler.
    pub fn is_liquid_handler(&self) -> bool {
        matches!(self, Component::Gx281 | Component::Ender3)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Sync => write!(f, "SYNC"),
            Component::Temperature => write!(f, "Temperature"),
            Component::Valve(ways) => write!(f, "VICI-{ways}Way"),
            Component::Pump => write!(f, "Pump"),
            Component::HarvardPump => write!(f, "HarvardPump"),
            Component::Gx281 => write!(f, "GX-281"),
            Component::Ender3 => write!(f, "Ender3"),
            Component::Unknown(tag) => write!(f, "{tag}"),
        }
    }
}

/// Split `"k1=v1, k2=v2"` into a map.
///
/// Each part is split at its first `=`; keys and values are trimmed. Parts
/// without `=` or with an empty key are ignored, and a repeated key keeps its
/// last value.
pub fn parse_kv_params(text: &str) -> BTreeMap<String, String> {
    text.split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// One step of a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Component tag as written (`"Pump"`, `"VICI-6Way"`, ...)
    pub component: String,
    /// Verb (`"dispense"`, `"go_to_position"`, ...)
    pub action: String,
    /// Raw parameters
    pub params: BTreeMap<String, String>,
    /// Free-text notes copied to the log
    pub notes: String,
    /// Pause after the command
    #[serde(with = "delay_seconds")]
    pub delay: Duration,
}

impl Command {
    /// Command with no parameters and the default delay.
    pub fn new(component: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            action: action.into(),
            params: BTreeMap::new(),
            notes: String::new(),
            delay: DEFAULT_DELAY,
        }
    }

    /// Barrier command.
    pub fn sync() -> Self {
        Self::new("SYNC", "wait_for_pumps")
    }

    /// Add one parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Merge a `key=value,...` string into the parameters.
    pub fn with_params(mut self, text: &str) -> Self {
        self.params.extend(parse_kv_params(text));
        self
    }

    /// Set the notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Set the post-command delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Parsed component tag.
    pub fn component(&self) -> Component {
        Component::parse(&self.component)
    }

    /// Raw parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parameters rendered back as `k=v,k=v` in key order.
    pub fn params_text(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

mod delay_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(delay.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(d)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_params_trim_and_skip_junk() {
        let params = parse_kv_params(" flow_rate = 1000,volume=500 ,junk,=x, pump_id=1");
        assert_eq!(params.len(), 3);
        assert_eq!(params["flow_rate"], "1000");
        assert_eq!(params["volume"], "500");
        assert_eq!(params["pump_id"], "1");
    }

    #[test]
    fn kv_params_split_at_first_equals() {
        let params = parse_kv_params("label=a=b");
        assert_eq!(params["label"], "a=b");
    }

    #[test]
    fn sync_tag_is_case_insensitive() {
        assert_eq!(Component::parse("sync"), Component::Sync);
        assert_eq!(Component::parse("SYNC"), Component::Sync);
        assert_eq!(Component::parse("VICI-10Way"), Component::Valve(10));
        assert_eq!(
            Component::parse("Centrifuge"),
            Component::Unknown("Centrifuge".into())
        );
    }

    #[test]
    fn component_display_round_trips() {
        for tag in ["SYNC", "Temperature", "VICI-24Way", "Pump", "HarvardPump", "GX-281", "Ender3"] {
            assert_eq!(Component::parse(tag).to_string(), tag);
        }
    }

    #[test]
    fn builder_renders_params_in_key_order() {
        let command = Command::new("Pump", "dispense")
            .with_params("volume=500,pump_id=1")
            .param("flow_rate", 1000);
        assert_eq!(command.params_text(), "flow_rate=1000,pump_id=1,volume=500");
        assert_eq!(command.delay, DEFAULT_DELAY);
        assert_eq!(command.component(), Component::Pump);
    }
}
