use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use offset_common::{
    read_snapshot, CompensationConfig, CompensationEngine, EngineAction, EngineEvent,
    EngineOutput, HvacMode, LearningEvent, PreheatPlan, RoomConfig, RoomStatePayload,
    RoomStatus, SkipReason, StateSource,
};

use crate::store::AppStore;

/// Outbound commands to the physical thermostat.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn set_temperature(&self, entity_id: &str, target: f32) -> anyhow::Result<()>;
    async fn set_hvac_mode(&self, entity_id: &str, mode: HvacMode) -> anyhow::Result<()>;
}

/// One room: its engine behind a lock held for a whole cycle, plus the
/// collaborators that execute the engine's actions.
pub struct RoomController {
    slug: String,
    name: String,
    engine: Mutex<CompensationEngine>,
    sink: Arc<dyn CommandSink>,
    store: AppStore,
    incomplete_warned: AtomicBool,
}

impl RoomController {
    pub fn new(
        config: RoomConfig,
        limits: CompensationConfig,
        sink: Arc<dyn CommandSink>,
        store: AppStore,
    ) -> Self {
        Self {
            slug: config.slug.clone(),
            name: config.name.clone(),
            engine: Mutex::new(CompensationEngine::new(config, limits)),
            sink,
            store,
            incomplete_warned: AtomicBool::new(false),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn restore_history(&self) {
        let history = match self.store.load_history(&self.slug).await {
            Ok(history) => history,
            Err(err) => {
                warn!(room = %self.slug, "failed to load heating history: {err:#}");
                Vec::new()
            }
        };
        let mut engine = self.engine.lock().await;
        engine.restore_history(&history);
        info!(
            room = %self.slug,
            samples = engine.heating_history().len(),
            rate = engine.state().heating_rate,
            "heating history restored"
        );
    }

    /// Periodic update: snapshot, engine cycle, dispatch.
    pub async fn update<S>(&self, states: &S, now: DateTime<Utc>)
    where
        S: StateSource + Sync,
    {
        let mut engine = self.engine.lock().await;
        if !engine.config.is_complete() {
            if !self.incomplete_warned.swap(true, Ordering::Relaxed) {
                warn!(room = %self.slug, "room is missing its thermostat or sensors; staying idle");
            }
            self.start_due_preheat(&mut engine, now).await;
            return;
        }

        let snapshot = match read_snapshot(states, &engine.config, engine.limits()) {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_transient() => {
                debug!(room = %self.slug, "skipping update: {err}");
                self.start_due_preheat(&mut engine, now).await;
                return;
            }
            Err(err) => {
                warn!(room = %self.slug, "skipping update: {err}");
                self.start_due_preheat(&mut engine, now).await;
                return;
            }
        };

        let output = engine.tick(&snapshot, now);
        self.execute(&mut engine, output, now).await;
    }

    async fn start_due_preheat(&self, engine: &mut CompensationEngine, now: DateTime<Utc>) {
        if let Some(output) = engine.poll_preheat(now) {
            self.execute(engine, output, now).await;
        }
    }

    pub async fn force_compensation(&self, now: DateTime<Utc>) {
        let mut engine = self.engine.lock().await;
        let output = engine.force_compensation(now);
        self.execute(&mut engine, output, now).await;
    }

    pub async fn reset_learning(&self) {
        let mut engine = self.engine.lock().await;
        let output = engine.reset_learning();
        info!(room = %self.slug, "heating history reset");
        self.execute(&mut engine, output, Utc::now()).await;
    }

    pub async fn set_preheat(
        &self,
        target_time: DateTime<Utc>,
        target_temp: f32,
        now: DateTime<Utc>,
    ) -> PreheatPlan {
        let mut engine = self.engine.lock().await;
        let (plan, output) = engine.set_preheat(target_time, target_temp, now);
        self.execute(&mut engine, output, now).await;
        plan
    }

    pub async fn set_desired_temperature(&self, temp: f32, now: DateTime<Utc>) {
        let mut engine = self.engine.lock().await;
        let output = engine.set_desired_temperature(temp, now);
        self.execute(&mut engine, output, now).await;
    }

    pub async fn set_hvac_mode(&self, mode: HvacMode) {
        let mut engine = self.engine.lock().await;
        let output = engine.set_hvac_mode(mode);
        self.execute(&mut engine, output, Utc::now()).await;
    }

    pub async fn set_compensation_enabled(&self, enabled: bool) -> bool {
        self.engine.lock().await.set_compensation_enabled(enabled)
    }

    pub async fn set_battery_saver(&self, enabled: bool) -> bool {
        self.engine.lock().await.set_battery_saver(enabled)
    }

    pub async fn set_window_override(&self, enabled: bool) -> bool {
        self.engine.lock().await.set_window_override(enabled)
    }

    pub async fn reconfigure(&self, config: RoomConfig) {
        let mut engine = self.engine.lock().await;
        self.incomplete_warned.store(false, Ordering::Relaxed);
        engine.reconfigure(config);
        info!(room = %self.slug, "room options reloaded");
    }

    pub async fn status(&self) -> RoomStatus {
        self.engine.lock().await.status()
    }

    pub async fn state_payload(&self) -> RoomStatePayload {
        self.engine.lock().await.state_payload()
    }

    async fn execute(
        &self,
        engine: &mut CompensationEngine,
        output: EngineOutput,
        now: DateTime<Utc>,
    ) {
        for event in &output.events {
            self.log_event(event);
        }

        let thermostat = engine.config.thermostat_entity.clone();
        for action in output.actions {
            match action {
                EngineAction::SetTemperature { target, forced } => {
                    if thermostat.is_empty() {
                        debug!(room = %self.slug, "no thermostat configured; dropping setpoint {target:.1}");
                        continue;
                    }
                    match self.sink.set_temperature(&thermostat, target).await {
                        Ok(()) => {
                            engine.confirm_compensation(target, now);
                            info!(
                                room = %self.slug,
                                forced = forced,
                                desired = engine.state().desired_temp,
                                offset = engine.state().offset,
                                "compensated setpoint {target:.1} sent to {thermostat}"
                            );
                        }
                        Err(err) => {
                            warn!(room = %self.slug, "failed to send setpoint {target:.1}: {err:#}")
                        }
                    }
                }
                EngineAction::SetHvacMode(mode) => {
                    if thermostat.is_empty() {
                        continue;
                    }
                    match self.sink.set_hvac_mode(&thermostat, mode).await {
                        Ok(()) => info!(room = %self.slug, "hvac mode {} sent", mode.as_str()),
                        Err(err) => warn!(room = %self.slug, "failed to send hvac mode: {err:#}"),
                    }
                }
                EngineAction::SaveHistory(history) => {
                    let store = self.store.clone();
                    let slug = self.slug.clone();
                    tokio::spawn(async move {
                        if let Err(err) = store.save_history(&slug, &history).await {
                            warn!(room = %slug, "failed to save heating history: {err:#}");
                        }
                    });
                }
            }
        }
    }

    fn log_event(&self, event: &EngineEvent) {
        let room = self.slug.as_str();
        match event {
            EngineEvent::DesiredBootstrapped { desired } => {
                info!(room = %room, "desired temperature initialised to {desired:.1}")
            }
            EngineEvent::ExternalChange {
                thermostat_target,
                desired,
            } => info!(
                room = %room,
                "thermostat changed externally to {thermostat_target:.1}; desired now {desired:.1}"
            ),
            EngineEvent::WindowOpened => info!(room = %room, "window open; compensation paused"),
            EngineEvent::WindowClosed => info!(room = %room, "window closed; compensation resumed"),
            EngineEvent::Learning(LearningEvent::CycleStarted { start_temp }) => {
                info!(room = %room, "heating cycle started at {start_temp:.1}")
            }
            EngineEvent::Learning(LearningEvent::CycleEnded) => info!(room = %room, "heating cycle ended"),
            EngineEvent::Learning(LearningEvent::SampleAccepted { rate, mean }) => info!(
                room = %room,
                "heating rate sample {rate:.2} °C/h; mean now {mean:.2} °C/h"
            ),
            EngineEvent::Learning(LearningEvent::SampleRejected { rate }) => {
                debug!(room = %room, "discarding implausible heating rate {rate:.2} °C/h")
            }
            EngineEvent::Learning(LearningEvent::Suppressed) => {
                debug!(room = %room, "learning suppressed after window activity")
            }
            EngineEvent::CompensationSkipped(reason) => log_skip(room, reason),
            EngineEvent::PreheatStarted { target_temp } => {
                info!(room = %room, "pre-heat started toward {target_temp:.1}")
            }
            EngineEvent::PreheatScheduled { start, target_temp } => {
                info!(room = %room, "pre-heat to {target_temp:.1} scheduled for {start}")
            }
        }
    }
}

fn log_skip(room: &str, reason: &SkipReason) {
    match reason {
        SkipReason::Disabled => debug!(room = %room, "compensation disabled"),
        SkipReason::WindowOpen => debug!(room = %room, "compensation skipped: window open"),
        SkipReason::Backoff { remaining_secs } => {
            debug!(room = %room, "battery saver backoff, {remaining_secs}s remaining")
        }
        SkipReason::AwaitingEcho => debug!(room = %room, "waiting for thermostat to report last setpoint"),
        SkipReason::WithinTolerance { diff } => {
            debug!(room = %room, "setpoint within tolerance ({diff:.2})")
        }
        SkipReason::TargetReached => debug!(room = %room, "target reached; setpoint already at desired"),
        SkipReason::NoReading => debug!(room = %room, "no external reading yet"),
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown room {0}")]
pub struct UnknownRoom(pub String);

/// Rooms keyed by slug.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<BTreeMap<String, Arc<RoomController>>>,
}

impl RoomRegistry {
    pub fn new(rooms: Vec<Arc<RoomController>>) -> Self {
        let mut map = BTreeMap::new();
        for room in rooms {
            if map.contains_key(room.slug()) {
                warn!(room = %room.slug(), "duplicate room slug; keeping the first definition");
                continue;
            }
            map.insert(room.slug().to_string(), room);
        }
        Self {
            rooms: Arc::new(map),
        }
    }

    pub fn all(&self) -> Vec<Arc<RoomController>> {
        self.rooms.values().cloned().collect()
    }

    /// Finds a room by slug, `climate.<slug>` entity id, or name.
    pub fn resolve(&self, selector: &str) -> Option<Arc<RoomController>> {
        let selector = selector.trim();
        let slug = selector.strip_prefix("climate.").unwrap_or(selector);
        if let Some(room) = self.rooms.get(slug) {
            return Some(room.clone());
        }
        self.rooms
            .values()
            .find(|room| room.name().eq_ignore_ascii_case(selector))
            .cloned()
    }

    /// An empty selector list addresses every room.
    pub fn select(&self, selectors: &[String]) -> Result<Vec<Arc<RoomController>>, UnknownRoom> {
        if selectors.is_empty() {
            return Ok(self.all());
        }
        selectors
            .iter()
            .map(|selector| {
                self.resolve(selector)
                    .ok_or_else(|| UnknownRoom(selector.clone()))
            })
            .collect()
    }
}
