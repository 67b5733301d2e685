use chrono::{DateTime, Duration, Utc};

use crate::{
    config::{CompensationConfig, RoomConfig},
    learning::{HeatingRateLearner, LearningEvent},
    preheat::{self, PreheatMarker, PreheatPlan},
    snapshot::SensorSnapshot,
    types::{HvacAction, HvacMode, RoomStatePayload, RoomStatus},
    window::{self, WindowGuard},
};

// Setpoints closer than this are the same device value.
const SAME_TARGET_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    SetTemperature { target: f32, forced: bool },
    SetHvacMode(HvacMode),
    SaveHistory(Vec<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    Disabled,
    WindowOpen,
    Backoff { remaining_secs: i64 },
    AwaitingEcho,
    WithinTolerance { diff: f32 },
    TargetReached,
    NoReading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    DesiredBootstrapped { desired: f32 },
    ExternalChange { thermostat_target: f32, desired: f32 },
    WindowOpened,
    WindowClosed,
    Learning(LearningEvent),
    CompensationSkipped(SkipReason),
    PreheatStarted { target_temp: f32 },
    PreheatScheduled { start: DateTime<Utc>, target_temp: f32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub actions: Vec<EngineAction>,
    pub events: Vec<EngineEvent>,
}

impl EngineOutput {
    fn merge(&mut self, other: EngineOutput) {
        self.actions.extend(other.actions);
        self.events.extend(other.events);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub external_temp: Option<f32>,
    pub internal_temp: Option<f32>,
    pub humidity: Option<f32>,
    pub thermostat_target: f32,
    pub desired_temp: f32,
    pub offset: f32,
    pub compensated_target: f32,
    pub hvac_mode: HvacMode,
    pub hvac_action: HvacAction,
    pub window_open: bool,
    pub window_override: bool,
    pub heating_rate: f32,
    pub preheat_minutes: u32,
    pub compensation_enabled: bool,
    pub battery_saver_enabled: bool,
    pub next_preheat_start: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ControllerState {
    fn new(config: &RoomConfig, limits: &CompensationConfig) -> Self {
        Self {
            external_temp: None,
            internal_temp: None,
            humidity: None,
            thermostat_target: limits.default_desired_temp,
            desired_temp: limits.default_desired_temp,
            offset: 0.0,
            compensated_target: limits.default_desired_temp,
            hvac_mode: HvacMode::Off,
            hvac_action: HvacAction::Idle,
            window_open: false,
            window_override: false,
            heating_rate: limits.default_heating_rate,
            preheat_minutes: 0,
            compensation_enabled: true,
            battery_saver_enabled: config.battery_saver,
            next_preheat_start: None,
            last_update: None,
        }
    }
}

/// Corrected setpoint for the thermostat.
///
/// Below the desired temperature the offset is added so the thermostat, reading
/// its own biased sensor, heats toward the true target. Once the external sensor
/// has reached the target the desired value goes out unmodified.
pub fn compensated_target(
    desired: f32,
    offset: f32,
    external: f32,
    limits: &CompensationConfig,
) -> f32 {
    let raw = if external >= desired {
        desired
    } else {
        desired + offset
    };
    round_to_step(raw, limits.temp_step).clamp(limits.min_temp, limits.max_temp)
}

pub fn round_to_step(value: f32, step: f32) -> f32 {
    (value / step).round() * step
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Compensation engine for one room. Pure: it never talks to the thermostat
/// itself but returns [`EngineAction`]s for the host to execute.
#[derive(Debug, Clone)]
pub struct CompensationEngine {
    pub config: RoomConfig,
    limits: CompensationConfig,
    state: ControllerState,
    guard: WindowGuard,
    learner: HeatingRateLearner,
    preheat: Option<PreheatMarker>,
    last_compensation_time: Option<DateTime<Utc>>,
    last_sent_target: Option<f32>,
    // Setpoint external changes are measured against: the last confirmed
    // send, or the thermostat value adopted at bootstrap or external change.
    reference_target: Option<f32>,
    bootstrapped: bool,
}

impl CompensationEngine {
    pub fn new(config: RoomConfig, limits: CompensationConfig) -> Self {
        Self {
            state: ControllerState::new(&config, &limits),
            guard: WindowGuard::new(),
            learner: HeatingRateLearner::new(&limits),
            preheat: None,
            last_compensation_time: None,
            last_sent_target: None,
            reference_target: None,
            bootstrapped: false,
            config,
            limits,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn limits(&self) -> &CompensationConfig {
        &self.limits
    }

    pub fn heating_history(&self) -> Vec<f32> {
        self.learner.history()
    }

    pub fn last_compensation_time(&self) -> Option<DateTime<Utc>> {
        self.last_compensation_time
    }

    pub fn last_sent_target(&self) -> Option<f32> {
        self.last_sent_target
    }

    pub fn pending_preheat(&self) -> Option<PreheatMarker> {
        self.preheat
    }

    pub fn restore_history(&mut self, samples: &[f32]) {
        self.learner.restore(samples);
        self.state.heating_rate = self.learner.rate();
    }

    /// Swaps in a new room configuration while keeping learned state.
    pub fn reconfigure(&mut self, config: RoomConfig) {
        if config.battery_saver != self.config.battery_saver {
            self.state.battery_saver_enabled = config.battery_saver;
        }
        self.config = config;
    }

    /// One control cycle: reconcile, guard, learn, decide.
    pub fn tick(&mut self, snapshot: &SensorSnapshot, now: DateTime<Utc>) -> EngineOutput {
        let mut output = EngineOutput::default();

        self.apply_snapshot(snapshot, now);
        if let Some(event) = self.reconcile(snapshot.thermostat_target, now) {
            output.events.push(event);
        }

        let was_open = self.state.window_open;
        self.state.window_open = self.guard.evaluate(
            &self.config,
            &self.limits,
            &snapshot.windows,
            snapshot.external_temp,
            snapshot.hvac_action,
            now,
        );
        match (was_open, self.state.window_open) {
            (false, true) => output.events.push(EngineEvent::WindowOpened),
            (true, false) => output.events.push(EngineEvent::WindowClosed),
            _ => {}
        }

        self.learn(snapshot, now, &mut output);

        self.state.preheat_minutes = if self.config.preheat {
            self.preheat_minutes_for(self.state.desired_temp)
        } else {
            0
        };

        match self.poll_preheat(now) {
            Some(started) => output.merge(started),
            None => output.merge(self.compensate(false, now)),
        }

        output
    }

    /// Starts a deferred pre-heat once its start time has come. Needs no
    /// fresh readings, so hosts also call it when a cycle has no snapshot.
    pub fn poll_preheat(&mut self, now: DateTime<Utc>) -> Option<EngineOutput> {
        let marker = self.preheat.filter(|marker| now >= marker.start)?;
        self.preheat = None;
        self.state.next_preheat_start = None;

        let mut output = EngineOutput::default();
        output.events.push(EngineEvent::PreheatStarted {
            target_temp: marker.target_temp,
        });
        output.merge(self.set_desired_temperature(marker.target_temp, now));
        Some(output)
    }

    /// Decision and apply step. A forced run bypasses the enabled flag, the
    /// battery-saver backoff and the tolerance gate, but never an open window.
    pub fn compensate(&mut self, force: bool, now: DateTime<Utc>) -> EngineOutput {
        let mut output = EngineOutput::default();
        match self.decide(force, now) {
            Ok(target) => output
                .actions
                .push(EngineAction::SetTemperature { target, forced: force }),
            Err(reason) => output.events.push(EngineEvent::CompensationSkipped(reason)),
        }
        output
    }

    pub fn force_compensation(&mut self, now: DateTime<Utc>) -> EngineOutput {
        self.compensate(true, now)
    }

    /// Records a setpoint the host confirmed it dispatched.
    pub fn confirm_compensation(&mut self, target: f32, now: DateTime<Utc>) {
        self.last_sent_target = Some(target);
        self.reference_target = Some(target);
        self.bootstrapped = true;
        self.last_compensation_time = Some(now);
        self.state.compensated_target = target;
        // Mirrored until the next snapshot reports the device's own value.
        self.state.thermostat_target = target;
    }

    pub fn set_desired_temperature(&mut self, temp: f32, now: DateTime<Utc>) -> EngineOutput {
        self.state.desired_temp = temp.clamp(self.limits.min_temp, self.limits.max_temp);
        self.bootstrapped = true;
        self.compensate(true, now)
    }

    pub fn set_preheat(
        &mut self,
        target_time: DateTime<Utc>,
        target_temp: f32,
        now: DateTime<Utc>,
    ) -> (PreheatPlan, EngineOutput) {
        let minutes = self.preheat_minutes_for(target_temp);
        let plan = preheat::plan(now, target_time, minutes);

        let output = match plan {
            PreheatPlan::StartNow { .. } => {
                self.preheat = None;
                self.state.next_preheat_start = None;
                let mut output = EngineOutput::default();
                output.events.push(EngineEvent::PreheatStarted { target_temp });
                output.merge(self.set_desired_temperature(target_temp, now));
                output
            }
            PreheatPlan::Scheduled { start, .. } => {
                self.preheat = Some(PreheatMarker { start, target_temp });
                self.state.next_preheat_start = Some(start);
                EngineOutput {
                    actions: Vec::new(),
                    events: vec![EngineEvent::PreheatScheduled { start, target_temp }],
                }
            }
        };

        (plan, output)
    }

    pub fn reset_learning(&mut self) -> EngineOutput {
        self.learner.reset();
        self.state.heating_rate = self.learner.rate();
        EngineOutput {
            actions: vec![EngineAction::SaveHistory(Vec::new())],
            events: Vec::new(),
        }
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode) -> EngineOutput {
        self.state.hvac_mode = mode;
        EngineOutput {
            actions: vec![EngineAction::SetHvacMode(mode)],
            events: Vec::new(),
        }
    }

    pub fn set_compensation_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.state.compensation_enabled, enabled) != enabled
    }

    pub fn set_battery_saver(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.state.battery_saver_enabled, enabled) != enabled
    }

    pub fn set_window_override(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.state.window_override, enabled) != enabled
    }

    pub fn status(&self) -> RoomStatus {
        RoomStatus {
            room: self.config.name.clone(),
            entity_id: self.config.entity_id(),
            current_temp: self.state.external_temp,
            current_humidity: self.state.humidity,
            thermostat_temp: self.state.internal_temp,
            thermostat_target: self.state.thermostat_target,
            target_temp: self.state.desired_temp,
            offset: self.state.offset,
            compensated_target: self.state.compensated_target,
            hvac_mode: self.state.hvac_mode.as_str(),
            hvac_action: self.state.hvac_action.as_str(),
            window_open: self.state.window_open,
            window_override: self.state.window_override,
            heating_rate: self.state.heating_rate,
            heating_samples: self.learner.len(),
            preheat_minutes: self.state.preheat_minutes,
            next_preheat_start_epoch: self.state.next_preheat_start.map(|at| at.timestamp()),
            compensation_enabled: self.state.compensation_enabled,
            battery_saver_enabled: self.state.battery_saver_enabled,
            last_compensation_epoch: self.last_compensation_time.map(|at| at.timestamp()),
            last_update_epoch: self.state.last_update.map(|at| at.timestamp()),
            configured: self.config.is_complete(),
            min_temp: self.limits.min_temp,
            max_temp: self.limits.max_temp,
            target_temp_step: self.limits.temp_step,
        }
    }

    pub fn state_payload(&self) -> RoomStatePayload {
        RoomStatePayload {
            temp: self.state.external_temp,
            humidity: self.state.humidity,
            target: self.state.desired_temp,
            offset: self.state.offset,
            compensated: self.state.compensated_target,
            mode: self.state.hvac_mode.as_str(),
            action: self.state.hvac_action.as_str(),
            window_open: self.state.window_open,
            heating_rate: self.state.heating_rate,
            preheat_minutes: self.state.preheat_minutes,
        }
    }

    fn apply_snapshot(&mut self, snapshot: &SensorSnapshot, now: DateTime<Utc>) {
        self.state.external_temp = Some(snapshot.external_temp);
        self.state.internal_temp = Some(snapshot.internal_temp);
        self.state.humidity = snapshot.humidity;
        if let Some(target) = snapshot.thermostat_target {
            self.state.thermostat_target = target;
        }
        self.state.hvac_mode = snapshot.hvac_mode;
        self.state.hvac_action = snapshot.hvac_action;
        self.state.offset = snapshot.external_temp - snapshot.internal_temp;
        self.state.last_update = Some(now);
    }

    /// Keeps the desired temperature in line with setpoint changes made at the
    /// thermostat itself (dial, app, schedule).
    ///
    /// The first reported setpoint bootstraps `desired_temp` once. Afterwards
    /// only a move away from the reference setpoint re-derives it, so the
    /// desired value does not follow the offset as the room warms up.
    fn reconcile(&mut self, reported: Option<f32>, now: DateTime<Utc>) -> Option<EngineEvent> {
        if let Some(last) = self.last_compensation_time {
            let cooldown = Duration::seconds(self.limits.external_change_cooldown_secs as i64);
            if now - last < cooldown {
                return None;
            }
        }

        let target = reported?;
        if !self.bootstrapped {
            self.bootstrapped = true;
            self.reference_target = Some(target);
            if (self.state.desired_temp - target).abs() > self.limits.bootstrap_threshold {
                let desired = round_tenth(target - self.state.offset);
                self.state.desired_temp = desired;
                return Some(EngineEvent::DesiredBootstrapped { desired });
            }
            return None;
        }

        let Some(reference) = self.reference_target else {
            self.reference_target = Some(target);
            return None;
        };

        if (target - reference).abs() > self.limits.external_change_threshold {
            let desired = round_tenth(target - self.state.offset);
            self.state.desired_temp = desired;
            self.reference_target = Some(target);
            return Some(EngineEvent::ExternalChange {
                thermostat_target: target,
                desired,
            });
        }

        None
    }

    fn learn(&mut self, snapshot: &SensorSnapshot, now: DateTime<Utc>, output: &mut EngineOutput) {
        let locked = self.state.window_open
            || window::learning_locked(&snapshot.windows, &self.limits, now);
        let Some(event) = self.learner.observe(
            snapshot.hvac_action,
            snapshot.external_temp,
            locked,
            &self.limits,
            now,
        ) else {
            return;
        };

        if matches!(event, LearningEvent::SampleAccepted { .. }) {
            self.state.heating_rate = self.learner.rate();
            output
                .actions
                .push(EngineAction::SaveHistory(self.learner.history()));
        }
        output.events.push(EngineEvent::Learning(event));
    }

    fn decide(&self, force: bool, now: DateTime<Utc>) -> Result<f32, SkipReason> {
        let state = &self.state;
        if !force && !state.compensation_enabled {
            return Err(SkipReason::Disabled);
        }
        if state.window_open && !state.window_override {
            return Err(SkipReason::WindowOpen);
        }
        if !force && state.battery_saver_enabled {
            if let Some(last) = self.last_compensation_time {
                let backoff = Duration::minutes(i64::from(self.config.backoff_minutes));
                let elapsed = now - last;
                if elapsed < backoff {
                    return Err(SkipReason::Backoff {
                        remaining_secs: (backoff - elapsed).num_seconds(),
                    });
                }
            }
        }

        let Some(external) = state.external_temp else {
            return Err(SkipReason::NoReading);
        };
        let target = compensated_target(state.desired_temp, state.offset, external, &self.limits);
        if force {
            return Ok(target);
        }

        if self.awaiting_echo(target, now) {
            return Err(SkipReason::AwaitingEcho);
        }

        let diff = (target - state.thermostat_target).abs();
        if external >= state.desired_temp {
            if diff < SAME_TARGET_EPSILON {
                return Err(SkipReason::TargetReached);
            }
        } else if diff < self.config.tolerance {
            return Err(SkipReason::WithinTolerance { diff });
        }

        Ok(target)
    }

    // The thermostat has not echoed our last command yet.
    fn awaiting_echo(&self, target: f32, now: DateTime<Utc>) -> bool {
        let (Some(sent), Some(at)) = (self.last_sent_target, self.last_compensation_time) else {
            return false;
        };
        let cooldown = Duration::seconds(self.limits.external_change_cooldown_secs as i64);
        (sent - target).abs() < SAME_TARGET_EPSILON && now - at < cooldown
    }

    fn preheat_minutes_for(&self, target_temp: f32) -> u32 {
        match self.state.external_temp {
            Some(current) => preheat::preheat_minutes(
                target_temp,
                current,
                self.state.heating_rate,
                &self.config,
                &self.limits,
            ),
            None => self.limits.fallback_preheat_minutes,
        }
    }
}
