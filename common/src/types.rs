use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Off,
    Heat,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
        }
    }

    /// Anything the thermostat reports other than `off` counts as heating mode.
    pub fn from_raw_state(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("off") {
            Self::Off
        } else {
            Self::Heat
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "heat" | "on" => Some(Self::Heat),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Heating,
    Idle,
    Off,
}

impl HvacAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::Idle => "idle",
            Self::Off => "off",
        }
    }

    pub fn from_attribute(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("heating") => Self::Heating,
            Some("off") => Self::Off,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Available,
    Unavailable,
    Unknown,
}

/// Last reported state of a host-platform entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    pub last_changed: DateTime<Utc>,
}

impl EntityState {
    pub fn new(state: impl Into<String>, last_changed: DateTime<Utc>) -> Self {
        Self {
            state: state.into(),
            attributes: HashMap::new(),
            last_changed,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn status(&self) -> EntityStatus {
        let state = self.state.trim();
        if state.eq_ignore_ascii_case(STATE_UNAVAILABLE) {
            EntityStatus::Unavailable
        } else if state.is_empty() || state.eq_ignore_ascii_case(STATE_UNKNOWN) {
            EntityStatus::Unknown
        } else {
            EntityStatus::Available
        }
    }

    /// Numeric attribute, accepting JSON numbers and numeric strings.
    pub fn attribute_f32(&self, key: &str) -> Option<f32> {
        let value = match self.attributes.get(key)? {
            Value::Number(number) => number.as_f64().map(|value| value as f32),
            Value::String(text) => text.trim().parse::<f32>().ok(),
            _ => None,
        };
        value.filter(|value| value.is_finite())
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Read access to the host platform's entity states.
pub trait StateSource {
    fn get_state(&self, entity_id: &str) -> Option<EntityState>;
}

impl StateSource for HashMap<String, EntityState> {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.get(entity_id).cloned()
    }
}

/// Full view of a room, as exposed by its virtual thermostat.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<f32>,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: Option<f32>,
    #[serde(rename = "thermostatTemp")]
    pub thermostat_temp: Option<f32>,
    #[serde(rename = "thermostatTarget")]
    pub thermostat_target: f32,
    #[serde(rename = "targetTemp")]
    pub target_temp: f32,
    pub offset: f32,
    #[serde(rename = "compensatedTarget")]
    pub compensated_target: f32,
    #[serde(rename = "hvacMode")]
    pub hvac_mode: &'static str,
    #[serde(rename = "hvacAction")]
    pub hvac_action: &'static str,
    #[serde(rename = "windowOpen")]
    pub window_open: bool,
    #[serde(rename = "windowOverride")]
    pub window_override: bool,
    #[serde(rename = "heatingRate")]
    pub heating_rate: f32,
    #[serde(rename = "heatingSamples")]
    pub heating_samples: usize,
    #[serde(rename = "preheatMinutes")]
    pub preheat_minutes: u32,
    #[serde(rename = "nextPreheatStartEpoch")]
    pub next_preheat_start_epoch: Option<i64>,
    #[serde(rename = "compensationEnabled")]
    pub compensation_enabled: bool,
    #[serde(rename = "batterySaverEnabled")]
    pub battery_saver_enabled: bool,
    #[serde(rename = "lastCompensationEpoch")]
    pub last_compensation_epoch: Option<i64>,
    #[serde(rename = "lastUpdateEpoch")]
    pub last_update_epoch: Option<i64>,
    pub configured: bool,
    #[serde(rename = "minTemp")]
    pub min_temp: f32,
    #[serde(rename = "maxTemp")]
    pub max_temp: f32,
    #[serde(rename = "targetTempStep")]
    pub target_temp_step: f32,
}

/// Compact room state published over MQTT.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStatePayload {
    pub temp: Option<f32>,
    pub humidity: Option<f32>,
    pub target: f32,
    pub offset: f32,
    pub compensated: f32,
    pub mode: &'static str,
    pub action: &'static str,
    #[serde(rename = "windowOpen")]
    pub window_open: bool,
    #[serde(rename = "heatingRate")]
    pub heating_rate: f32,
    #[serde(rename = "preheatMinutes")]
    pub preheat_minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_recognizes_unavailable_and_unknown() {
        let now = Utc::now();
        assert_eq!(
            EntityState::new("unavailable", now).status(),
            EntityStatus::Unavailable
        );
        assert_eq!(EntityState::new("unknown", now).status(), EntityStatus::Unknown);
        assert_eq!(EntityState::new("", now).status(), EntityStatus::Unknown);
        assert_eq!(EntityState::new("21.5", now).status(), EntityStatus::Available);
    }

    #[test]
    fn numeric_attributes_accept_numbers_and_strings() {
        let state = EntityState::new("heat", Utc::now())
            .with_attribute("temperature", 21.5)
            .with_attribute("current", "19.0")
            .with_attribute("broken", "n/a");

        assert_eq!(state.attribute_f32("temperature"), Some(21.5));
        assert_eq!(state.attribute_f32("current"), Some(19.0));
        assert_eq!(state.attribute_f32("broken"), None);
        assert_eq!(state.attribute_f32("missing"), None);
    }

    #[test]
    fn hvac_action_defaults_to_idle() {
        assert_eq!(HvacAction::from_attribute(Some("heating")), HvacAction::Heating);
        assert_eq!(HvacAction::from_attribute(Some("OFF")), HvacAction::Off);
        assert_eq!(HvacAction::from_attribute(Some("cooling")), HvacAction::Idle);
        assert_eq!(HvacAction::from_attribute(None), HvacAction::Idle);
    }

    #[test]
    fn hvac_mode_treats_everything_but_off_as_heat() {
        assert_eq!(HvacMode::from_raw_state("auto"), HvacMode::Heat);
        assert_eq!(HvacMode::from_raw_state("Off"), HvacMode::Off);
        assert_eq!(HvacMode::parse(" HEAT "), Some(HvacMode::Heat));
        assert_eq!(HvacMode::parse("cool"), None);
    }
}
