use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::{CompensationConfig, RoomConfig},
    snapshot::WindowSensorState,
    types::HvacAction,
};

/// Decides whether an open window or door should suppress compensation.
#[derive(Debug, Clone, Default)]
pub struct WindowGuard {
    temp_history: VecDeque<(DateTime<Utc>, f32)>,
}

impl WindowGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the external temperature and re-evaluates the guard.
    pub fn evaluate(
        &mut self,
        room: &RoomConfig,
        limits: &CompensationConfig,
        sensors: &[WindowSensorState],
        external_temp: f32,
        action: HvacAction,
        now: DateTime<Utc>,
    ) -> bool {
        self.record_temperature(external_temp, limits, now);

        if room.window_detection && sensor_open(room, sensors, now) {
            true
        } else if room.temp_drop_detection {
            self.temperature_dropping(room, limits, external_temp, action)
        } else {
            false
        }
    }

    fn record_temperature(&mut self, temp: f32, limits: &CompensationConfig, now: DateTime<Utc>) {
        self.temp_history.push_back((now, temp));

        let cutoff = now - Duration::minutes(i64::from(limits.temp_drop_window_minutes));
        while let Some((at, _)) = self.temp_history.front() {
            if *at > cutoff {
                break;
            }
            self.temp_history.pop_front();
        }
    }

    fn temperature_dropping(
        &self,
        room: &RoomConfig,
        limits: &CompensationConfig,
        current: f32,
        action: HvacAction,
    ) -> bool {
        if self.temp_history.len() < 2 || action != HvacAction::Heating {
            return false;
        }
        let Some((_, oldest)) = self.temp_history.front() else {
            return false;
        };

        let drop = oldest - current;
        let drop_rate = drop / limits.temp_drop_window_minutes as f32;

        drop > room.temp_drop_threshold && drop_rate > limits.temp_drop_rate_threshold
    }
}

fn sensor_open(room: &RoomConfig, sensors: &[WindowSensorState], now: DateTime<Utc>) -> bool {
    let delay = Duration::seconds(i64::from(room.window_open_delay_secs));
    sensors
        .iter()
        .any(|sensor| sensor.open && now - sensor.last_changed >= delay)
}

/// True while any window is open or closed less than the lockout period ago.
pub fn learning_locked(
    sensors: &[WindowSensorState],
    limits: &CompensationConfig,
    now: DateTime<Utc>,
) -> bool {
    let lockout = Duration::minutes(i64::from(limits.window_close_lockout_minutes));
    sensors
        .iter()
        .any(|sensor| sensor.open || now - sensor.last_changed < lockout)
}
