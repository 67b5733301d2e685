use serde::{Deserialize, Deserializer, Serialize};

pub const MIN_TOLERANCE: f32 = 0.1;
pub const MAX_TOLERANCE: f32 = 2.0;
pub const MIN_BACKOFF_MINUTES: u32 = 1;
pub const MAX_BACKOFF_MINUTES: u32 = 120;
pub const MAX_WINDOW_OPEN_DELAY_SECS: u32 = 600;
pub const MIN_TEMP_DROP_THRESHOLD: f32 = 0.5;
pub const MAX_TEMP_DROP_THRESHOLD: f32 = 3.0;
pub const MAX_LEARNING_BUFFER_PCT: u32 = 50;

/// Engine constants shared by every room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    pub min_temp: f32,
    pub max_temp: f32,
    pub temp_step: f32,
    pub min_plausible_temp: f32,
    pub default_desired_temp: f32,
    pub external_change_cooldown_secs: u64,
    pub external_change_threshold: f32,
    pub bootstrap_threshold: f32,
    pub temp_drop_window_minutes: u32,
    pub temp_drop_rate_threshold: f32,
    pub learning_min_duration_minutes: u32,
    pub learning_min_rise: f32,
    pub window_close_lockout_minutes: u32,
    pub max_heating_cycles: usize,
    pub min_heating_rate: f32,
    pub max_heating_rate: f32,
    pub default_heating_rate: f32,
    pub fallback_preheat_minutes: u32,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            min_temp: 5.0,
            max_temp: 25.0,
            temp_step: 0.5,
            min_plausible_temp: 5.0,
            default_desired_temp: 20.0,
            external_change_cooldown_secs: 90,
            external_change_threshold: 0.4,
            bootstrap_threshold: 0.1,
            temp_drop_window_minutes: 15,
            temp_drop_rate_threshold: 0.05,
            learning_min_duration_minutes: 20,
            learning_min_rise: 0.1,
            window_close_lockout_minutes: 15,
            max_heating_cycles: 20,
            min_heating_rate: 0.1,
            max_heating_rate: 10.0,
            default_heating_rate: 1.0,
            fallback_preheat_minutes: 45,
        }
    }
}

impl CompensationConfig {
    pub fn sanitize(&mut self) {
        if !(self.min_temp < self.max_temp) {
            self.min_temp = 5.0;
            self.max_temp = 25.0;
        }
        if !(self.temp_step > 0.0) {
            self.temp_step = 0.5;
        }
        self.max_heating_cycles = self.max_heating_cycles.max(1);
        if !(self.min_heating_rate < self.max_heating_rate) {
            self.min_heating_rate = 0.1;
            self.max_heating_rate = 10.0;
        }
        self.temp_drop_window_minutes = self.temp_drop_window_minutes.max(1);
    }
}

/// Per-room settings captured when the room was first set up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettings {
    pub room_name: String,
    #[serde(default)]
    pub thermostat_entity: String,
    #[serde(default)]
    pub thermostat_temp_sensor: String,
    #[serde(default)]
    pub external_temp_sensor: String,
    #[serde(default)]
    pub humidity_sensor: Option<String>,
    #[serde(default, deserialize_with = "entity_ids")]
    pub window_sensors: Vec<String>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    #[serde(default = "default_backoff_minutes")]
    pub backoff_minutes: u32,
    #[serde(default = "default_true")]
    pub battery_saver: bool,
    #[serde(default)]
    pub window_detection: bool,
    #[serde(default = "default_window_open_delay_secs")]
    pub window_open_delay_secs: u32,
    #[serde(default)]
    pub temp_drop_detection: bool,
    #[serde(default = "default_temp_drop_threshold")]
    pub temp_drop_threshold: f32,
    #[serde(default)]
    pub preheat: bool,
    #[serde(default = "default_learning_buffer_pct")]
    pub learning_buffer_pct: u32,
    #[serde(default = "default_min_preheat_minutes")]
    pub min_preheat_minutes: u32,
    #[serde(default = "default_max_preheat_minutes")]
    pub max_preheat_minutes: u32,
}

/// Runtime overrides. Every field that is set wins over [`RoomSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_saver: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_detection: Option<bool>,
    #[serde(
        deserialize_with = "optional_entity_ids",
        skip_serializing_if = "Option::is_none"
    )]
    pub window_sensors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_open_delay_secs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_drop_detection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_drop_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preheat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_buffer_pct: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_preheat_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_preheat_minutes: Option<u32>,
}

/// Resolved, sanitized configuration of one room. Built once from
/// [`RoomSettings`] and [`RoomOptions`] and replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomConfig {
    pub name: String,
    pub slug: String,
    pub thermostat_entity: String,
    pub thermostat_temp_sensor: String,
    pub external_temp_sensor: String,
    pub humidity_sensor: Option<String>,
    pub window_sensors: Vec<String>,
    pub tolerance: f32,
    pub backoff_minutes: u32,
    pub battery_saver: bool,
    pub window_detection: bool,
    pub window_open_delay_secs: u32,
    pub temp_drop_detection: bool,
    pub temp_drop_threshold: f32,
    pub preheat: bool,
    pub learning_buffer_pct: u32,
    pub min_preheat_minutes: u32,
    pub max_preheat_minutes: u32,
}

impl RoomSettings {
    pub fn new(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            thermostat_entity: String::new(),
            thermostat_temp_sensor: String::new(),
            external_temp_sensor: String::new(),
            humidity_sensor: None,
            window_sensors: Vec::new(),
            tolerance: default_tolerance(),
            backoff_minutes: default_backoff_minutes(),
            battery_saver: true,
            window_detection: false,
            window_open_delay_secs: default_window_open_delay_secs(),
            temp_drop_detection: false,
            temp_drop_threshold: default_temp_drop_threshold(),
            preheat: false,
            learning_buffer_pct: default_learning_buffer_pct(),
            min_preheat_minutes: default_min_preheat_minutes(),
            max_preheat_minutes: default_max_preheat_minutes(),
        }
    }

    pub fn resolve(&self, options: &RoomOptions) -> RoomConfig {
        let mut config = RoomConfig {
            name: self.room_name.trim().to_string(),
            slug: room_slug(&self.room_name),
            thermostat_entity: self.thermostat_entity.trim().to_string(),
            thermostat_temp_sensor: self.thermostat_temp_sensor.trim().to_string(),
            external_temp_sensor: self.external_temp_sensor.trim().to_string(),
            humidity_sensor: self
                .humidity_sensor
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            window_sensors: options
                .window_sensors
                .clone()
                .unwrap_or_else(|| self.window_sensors.clone()),
            tolerance: options.tolerance.unwrap_or(self.tolerance),
            backoff_minutes: options.backoff_minutes.unwrap_or(self.backoff_minutes),
            battery_saver: options.battery_saver.unwrap_or(self.battery_saver),
            window_detection: options.window_detection.unwrap_or(self.window_detection),
            window_open_delay_secs: options
                .window_open_delay_secs
                .unwrap_or(self.window_open_delay_secs),
            temp_drop_detection: options
                .temp_drop_detection
                .unwrap_or(self.temp_drop_detection),
            temp_drop_threshold: options
                .temp_drop_threshold
                .unwrap_or(self.temp_drop_threshold),
            preheat: options.preheat.unwrap_or(self.preheat),
            learning_buffer_pct: options
                .learning_buffer_pct
                .unwrap_or(self.learning_buffer_pct),
            min_preheat_minutes: options
                .min_preheat_minutes
                .unwrap_or(self.min_preheat_minutes),
            max_preheat_minutes: options
                .max_preheat_minutes
                .unwrap_or(self.max_preheat_minutes),
        };
        config.sanitize();
        config
    }
}

impl RoomConfig {
    pub fn sanitize(&mut self) {
        self.window_sensors = normalize_entity_ids(std::mem::take(&mut self.window_sensors));

        self.tolerance = if self.tolerance.is_finite() {
            self.tolerance.clamp(MIN_TOLERANCE, MAX_TOLERANCE)
        } else {
            default_tolerance()
        };
        self.backoff_minutes = self
            .backoff_minutes
            .clamp(MIN_BACKOFF_MINUTES, MAX_BACKOFF_MINUTES);
        self.window_open_delay_secs = self.window_open_delay_secs.min(MAX_WINDOW_OPEN_DELAY_SECS);
        self.temp_drop_threshold = if self.temp_drop_threshold.is_finite() {
            self.temp_drop_threshold
                .clamp(MIN_TEMP_DROP_THRESHOLD, MAX_TEMP_DROP_THRESHOLD)
        } else {
            default_temp_drop_threshold()
        };
        self.learning_buffer_pct = self.learning_buffer_pct.min(MAX_LEARNING_BUFFER_PCT);
        self.min_preheat_minutes = self.min_preheat_minutes.clamp(5, 60);
        self.max_preheat_minutes = self.max_preheat_minutes.clamp(60, 240);
    }

    /// A room without its thermostat or temperature sensors stays idle.
    pub fn is_complete(&self) -> bool {
        !self.thermostat_entity.is_empty()
            && !self.thermostat_temp_sensor.is_empty()
            && !self.external_temp_sensor.is_empty()
    }

    pub fn entity_id(&self) -> String {
        format!("climate.{}", self.slug)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEntry {
    pub data: RoomSettings,
    #[serde(default)]
    pub options: RoomOptions,
}

impl RoomEntry {
    pub fn resolve(&self) -> RoomConfig {
        self.data.resolve(&self.options)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub compensation: CompensationConfig,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compensation: CompensationConfig::default(),
            rooms: Vec::new(),
            timezone: default_timezone(),
            network: NetworkConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.compensation.sanitize();
        self.poll_interval_secs = self.poll_interval_secs.clamp(5, 3_600);
    }
}

/// Lowercase room name with every run of non-alphanumerics collapsed to `_`.
pub fn room_slug(name: &str) -> String {
    let mut out = String::new();
    let mut last_sep = false;
    for ch in name.trim().chars() {
        let low = ch.to_ascii_lowercase();
        if low.is_ascii_alphanumeric() {
            out.push(low);
            last_sep = false;
        } else if !last_sep && !out.is_empty() {
            out.push('_');
            last_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

fn normalize_entity_ids(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim();
        if !id.is_empty() && !out.iter().any(|known| known == id) {
            out.push(id.to_string());
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        let ids = match value {
            OneOrMany::One(id) => vec![id],
            OneOrMany::Many(ids) => ids,
        };
        normalize_entity_ids(ids)
    }
}

/// Accepts a single entity id or a list of them.
pub fn entity_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<OneOrMany>::deserialize(deserializer)?
        .map(Vec::from)
        .unwrap_or_default())
}

pub fn optional_entity_ids<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(Vec::from))
}

fn default_true() -> bool {
    true
}

fn default_tolerance() -> f32 {
    0.3
}

fn default_backoff_minutes() -> u32 {
    15
}

fn default_window_open_delay_secs() -> u32 {
    30
}

fn default_temp_drop_threshold() -> f32 {
    1.0
}

fn default_learning_buffer_pct() -> u32 {
    10
}

fn default_min_preheat_minutes() -> u32 {
    15
}

fn default_max_preheat_minutes() -> u32 {
    120
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn options_override_stored_settings() {
        let mut settings = RoomSettings::new("Living Room");
        settings.tolerance = 0.5;
        settings.backoff_minutes = 20;
        let options = RoomOptions {
            tolerance: Some(0.8),
            battery_saver: Some(false),
            ..RoomOptions::default()
        };

        let config = settings.resolve(&options);

        assert_eq!(config.tolerance, 0.8);
        assert_eq!(config.backoff_minutes, 20);
        assert!(!config.battery_saver);
        assert_eq!(config.slug, "living_room");
        assert_eq!(config.entity_id(), "climate.living_room");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: RoomSettings =
            serde_json::from_str(r#"{"room_name": "Office"}"#).unwrap();
        let config = settings.resolve(&RoomOptions::default());

        assert_eq!(config.tolerance, 0.3);
        assert_eq!(config.backoff_minutes, 15);
        assert!(config.battery_saver);
        assert_eq!(config.learning_buffer_pct, 10);
        assert_eq!(config.min_preheat_minutes, 15);
        assert_eq!(config.max_preheat_minutes, 120);
        assert!(config.window_sensors.is_empty());
        assert!(!config.is_complete());
    }

    #[test]
    fn window_sensor_accepts_string_or_list() {
        let single: RoomSettings = serde_json::from_str(
            r#"{"room_name": "Bath", "window_sensors": "binary_sensor.bath_window"}"#,
        )
        .unwrap();
        assert_eq!(single.window_sensors, vec!["binary_sensor.bath_window"]);

        let many: RoomSettings = serde_json::from_str(
            r#"{"room_name": "Bath", "window_sensors": ["binary_sensor.a", "", "binary_sensor.b", "binary_sensor.a"]}"#,
        )
        .unwrap();
        assert_eq!(many.window_sensors, vec!["binary_sensor.a", "binary_sensor.b"]);

        let options: RoomOptions =
            serde_json::from_str(r#"{"window_sensors": "binary_sensor.door"}"#).unwrap();
        assert_eq!(
            options.window_sensors,
            Some(vec!["binary_sensor.door".to_string()])
        );
    }

    #[test]
    fn bounded_fields_are_clamped() {
        let mut settings = RoomSettings::new("Kitchen");
        settings.tolerance = 9.0;
        settings.backoff_minutes = 0;
        settings.window_open_delay_secs = 5_000;
        settings.temp_drop_threshold = 0.1;
        settings.learning_buffer_pct = 90;
        settings.min_preheat_minutes = 1;
        settings.max_preheat_minutes = 1_000;

        let config = settings.resolve(&RoomOptions::default());

        assert_eq!(config.tolerance, MAX_TOLERANCE);
        assert_eq!(config.backoff_minutes, MIN_BACKOFF_MINUTES);
        assert_eq!(config.window_open_delay_secs, MAX_WINDOW_OPEN_DELAY_SECS);
        assert_eq!(config.temp_drop_threshold, MIN_TEMP_DROP_THRESHOLD);
        assert_eq!(config.learning_buffer_pct, MAX_LEARNING_BUFFER_PCT);
        assert_eq!(config.min_preheat_minutes, 5);
        assert_eq!(config.max_preheat_minutes, 240);
    }

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(room_slug("  Kids' Room 2 "), "kids_room_2");
        assert_eq!(room_slug("Büro"), "b_ro");
    }
}
