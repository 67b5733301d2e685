use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    config::{CompensationConfig, RoomConfig},
    types::{EntityState, EntityStatus, HvacAction, HvacMode, StateSource},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("entity {0} has not reported a state yet")]
    Missing(String),
    #[error("entity {0} is unavailable")]
    Unavailable(String),
    #[error("entity {0} reported an implausible temperature {1:.1}")]
    Implausible(String, f32),
    #[error("entity {entity} reported a non-numeric value {value:?}")]
    Parse { entity: String, value: String },
}

impl SnapshotError {
    /// Everything except a parse failure is expected while sensors warm up.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Parse { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSensorState {
    pub entity_id: String,
    pub open: bool,
    pub last_changed: DateTime<Utc>,
}

/// Validated readings for one room at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub external_temp: f32,
    pub internal_temp: f32,
    pub thermostat_target: Option<f32>,
    pub hvac_mode: HvacMode,
    pub hvac_action: HvacAction,
    pub humidity: Option<f32>,
    pub windows: Vec<WindowSensorState>,
}

pub fn read_snapshot(
    source: &impl StateSource,
    room: &RoomConfig,
    limits: &CompensationConfig,
) -> Result<SensorSnapshot, SnapshotError> {
    let external = available_state(source, &room.external_temp_sensor)?;
    let internal = available_state(source, &room.thermostat_temp_sensor)?;
    let thermostat = available_state(source, &room.thermostat_entity)?;

    let external_temp = parse_temperature(&room.external_temp_sensor, &external, limits)?;
    let internal_temp = parse_temperature(&room.thermostat_temp_sensor, &internal, limits)?;

    let humidity = room
        .humidity_sensor
        .as_deref()
        .and_then(|id| available_state(source, id).ok())
        .and_then(|state| state.state.trim().parse::<f32>().ok())
        .filter(|value| value.is_finite() && (0.0..=100.0).contains(value));

    let windows = room
        .window_sensors
        .iter()
        .filter_map(|id| {
            let state = available_state(source, id).ok()?;
            Some(WindowSensorState {
                entity_id: id.clone(),
                open: is_open_state(&state.state),
                last_changed: state.last_changed,
            })
        })
        .collect();

    Ok(SensorSnapshot {
        external_temp,
        internal_temp,
        thermostat_target: thermostat.attribute_f32("temperature"),
        hvac_mode: HvacMode::from_raw_state(thermostat.state.trim()),
        hvac_action: HvacAction::from_attribute(thermostat.attribute_str("hvac_action")),
        humidity,
        windows,
    })
}

fn available_state(
    source: &impl StateSource,
    entity_id: &str,
) -> Result<EntityState, SnapshotError> {
    let state = source
        .get_state(entity_id)
        .ok_or_else(|| SnapshotError::Missing(entity_id.to_string()))?;
    match state.status() {
        EntityStatus::Available => Ok(state),
        EntityStatus::Unavailable | EntityStatus::Unknown => {
            Err(SnapshotError::Unavailable(entity_id.to_string()))
        }
    }
}

fn parse_temperature(
    entity_id: &str,
    state: &EntityState,
    limits: &CompensationConfig,
) -> Result<f32, SnapshotError> {
    let raw = state.state.trim();
    let value = raw
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| SnapshotError::Parse {
            entity: entity_id.to_string(),
            value: raw.to_string(),
        })?;

    if value < limits.min_plausible_temp {
        return Err(SnapshotError::Implausible(entity_id.to_string(), value));
    }
    Ok(value)
}

fn is_open_state(state: &str) -> bool {
    matches!(
        state.trim().to_ascii_lowercase().as_str(),
        "on" | "open" | "true"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{RoomOptions, RoomSettings};

    fn room() -> RoomConfig {
        let mut settings = RoomSettings::new("Living Room");
        settings.thermostat_entity = "climate.tado_living".to_string();
        settings.thermostat_temp_sensor = "sensor.tado_living_temperature".to_string();
        settings.external_temp_sensor = "sensor.living_temperature".to_string();
        settings.humidity_sensor = Some("sensor.tado_living_humidity".to_string());
        settings.window_sensors = vec![
            "binary_sensor.living_window".to_string(),
            "binary_sensor.terrace_door".to_string(),
        ];
        settings.resolve(&RoomOptions::default())
    }

    fn states() -> HashMap<String, EntityState> {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 7, 0, 0).unwrap();
        let mut states = HashMap::new();
        states.insert(
            "sensor.living_temperature".to_string(),
            EntityState::new("18.0", at),
        );
        states.insert(
            "sensor.tado_living_temperature".to_string(),
            EntityState::new("16.0", at),
        );
        states.insert(
            "climate.tado_living".to_string(),
            EntityState::new("heat", at)
                .with_attribute("temperature", 21.0)
                .with_attribute("hvac_action", "heating"),
        );
        states.insert(
            "sensor.tado_living_humidity".to_string(),
            EntityState::new("48", at),
        );
        states.insert(
            "binary_sensor.living_window".to_string(),
            EntityState::new("on", at),
        );
        states.insert(
            "binary_sensor.terrace_door".to_string(),
            EntityState::new("unavailable", at),
        );
        states
    }

    #[test]
    fn reads_complete_snapshot() {
        let snapshot = read_snapshot(&states(), &room(), &CompensationConfig::default()).unwrap();

        assert_eq!(snapshot.external_temp, 18.0);
        assert_eq!(snapshot.internal_temp, 16.0);
        assert_eq!(snapshot.thermostat_target, Some(21.0));
        assert_eq!(snapshot.hvac_mode, HvacMode::Heat);
        assert_eq!(snapshot.hvac_action, HvacAction::Heating);
        assert_eq!(snapshot.humidity, Some(48.0));
        assert_eq!(snapshot.windows.len(), 1);
        assert!(snapshot.windows[0].open);
    }

    #[test]
    fn unavailable_sensor_is_transient() {
        let mut states = states();
        states.insert(
            "sensor.living_temperature".to_string(),
            EntityState::new("unknown", Utc::now()),
        );

        let err = read_snapshot(&states, &room(), &CompensationConfig::default()).unwrap_err();

        assert_eq!(
            err,
            SnapshotError::Unavailable("sensor.living_temperature".to_string())
        );
        assert!(err.is_transient());
    }

    #[test]
    fn missing_thermostat_is_transient() {
        let mut states = states();
        states.remove("climate.tado_living");

        let err = read_snapshot(&states, &room(), &CompensationConfig::default()).unwrap_err();

        assert_eq!(err, SnapshotError::Missing("climate.tado_living".to_string()));
    }

    #[test]
    fn cold_sensor_is_implausible() {
        let mut states = states();
        states.insert(
            "sensor.tado_living_temperature".to_string(),
            EntityState::new("0.0", Utc::now()),
        );

        let err = read_snapshot(&states, &room(), &CompensationConfig::default()).unwrap_err();

        assert!(matches!(err, SnapshotError::Implausible(_, _)));
        assert!(err.is_transient());
    }

    #[test]
    fn non_numeric_reading_is_a_parse_failure() {
        let mut states = states();
        states.insert(
            "sensor.living_temperature".to_string(),
            EntityState::new("warm", Utc::now()),
        );

        let err = read_snapshot(&states, &room(), &CompensationConfig::default()).unwrap_err();

        assert!(!err.is_transient());
    }

    #[test]
    fn thermostat_without_setpoint_keeps_target_unknown() {
        let mut states = states();
        states.insert(
            "climate.tado_living".to_string(),
            EntityState::new("off", Utc::now()),
        );

        let snapshot = read_snapshot(&states, &room(), &CompensationConfig::default()).unwrap();

        assert_eq!(snapshot.thermostat_target, None);
        assert_eq!(snapshot.hvac_mode, HvacMode::Off);
        assert_eq!(snapshot.hvac_action, HvacAction::Idle);
    }
}
