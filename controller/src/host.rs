use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use offset_common::{
    config::{entity_ids, room_slug},
    entity_from_state_topic, hvac_mode_command_topic,
    preheat::{next_occurrence, parse_time_of_day},
    room_state_topic, temperature_command_topic, HvacMode, PreheatPlan, RoomOptions,
    RuntimeConfig, TOPIC_CMD_FORCE_COMPENSATION, TOPIC_CMD_RESET_LEARNING,
    TOPIC_CMD_SET_PREHEAT, TOPIC_SERVICE_WILDCARD, TOPIC_STATE_WILDCARD,
};

use crate::{
    cache::StateCache,
    room::{CommandSink, RoomController, RoomRegistry, UnknownRoom},
    store::AppStore,
};

#[derive(Clone)]
struct AppState {
    rooms: RoomRegistry,
    cache: StateCache,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceRequest {
    #[serde(default, deserialize_with = "entity_ids")]
    entity_id: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PreheatRequest {
    #[serde(default, deserialize_with = "entity_ids")]
    entity_id: Vec<String>,
    target_time: String,
    target_temperature: f32,
}

#[derive(Debug, Serialize)]
struct PreheatResult {
    room: String,
    #[serde(rename = "startNow")]
    start_now: bool,
    #[serde(rename = "preheatMinutes")]
    preheat_minutes: u32,
    #[serde(rename = "startEpoch")]
    start_epoch: Option<i64>,
    #[serde(rename = "targetEpoch")]
    target_epoch: i64,
}

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    UnknownRoom(#[from] UnknownRoom),
    #[error("invalid target_time {0:?}, expected HH:MM or HH:MM:SS")]
    InvalidTime(String),
    #[error("invalid target_temperature")]
    InvalidTemperature,
    #[error("configured timezone {0:?} is not valid")]
    InvalidTimezone(String),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownRoom(_) => StatusCode::NOT_FOUND,
            Self::InvalidTimezone(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidTime(_) | Self::InvalidTemperature => StatusCode::BAD_REQUEST,
        }
    }
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 16 * 1024;

struct MqttCommandSink {
    mqtt: AsyncClient,
}

#[async_trait]
impl CommandSink for MqttCommandSink {
    async fn set_temperature(&self, entity_id: &str, target: f32) -> anyhow::Result<()> {
        self.mqtt
            .publish(
                temperature_command_topic(entity_id),
                QoS::AtLeastOnce,
                false,
                format!("{target:.1}"),
            )
            .await
            .with_context(|| format!("failed to publish setpoint for {entity_id}"))
    }

    async fn set_hvac_mode(&self, entity_id: &str, mode: HvacMode) -> anyhow::Result<()> {
        self.mqtt
            .publish(
                hvac_mode_command_topic(entity_id),
                QoS::AtLeastOnce,
                false,
                mode.as_str(),
            )
            .await
            .with_context(|| format!("failed to publish hvac mode for {entity_id}"))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("offset-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let sink: Arc<dyn CommandSink> = Arc::new(MqttCommandSink { mqtt: mqtt.clone() });

    let mut rooms = Vec::with_capacity(runtime.rooms.len());
    for entry in &runtime.rooms {
        let room = Arc::new(RoomController::new(
            entry.resolve(),
            runtime.compensation.clone(),
            sink.clone(),
            store.clone(),
        ));
        room.restore_history().await;
        rooms.push(room);
    }
    if rooms.is_empty() {
        warn!("no rooms configured; add them to runtime.json");
    }

    let app_state = AppState {
        rooms: RoomRegistry::new(rooms),
        cache: StateCache::default(),
        timezone: Arc::new(Mutex::new(runtime.timezone)),
        time_synced: Arc::new(AtomicBool::new(false)),
        mqtt,
        store,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(
        app_state.clone(),
        Duration::from_secs(runtime.poll_interval_secs),
    );
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/rooms", get(handle_list_rooms))
        .route("/api/rooms/{room}", get(handle_get_room))
        .route("/api/rooms/{room}/temperature", post(handle_set_temperature))
        .route("/api/rooms/{room}/mode", post(handle_set_mode))
        .route("/api/rooms/{room}/compensation", post(handle_set_compensation))
        .route("/api/rooms/{room}/battery_saver", post(handle_set_battery_saver))
        .route(
            "/api/rooms/{room}/window_override",
            post(handle_set_window_override),
        )
        .route(
            "/api/rooms/{room}/options",
            get(handle_get_options).put(handle_put_options),
        )
        .route(
            "/api/services/force_compensation",
            post(handle_force_compensation),
        )
        .route("/api/services/reset_learning", post(handle_reset_learning))
        .route("/api/services/set_preheat", post(handle_set_preheat))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_STATE_WILDCARD, TOPIC_SERVICE_WILDCARD] {
        mqtt.subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error on {}: {err:#}", message.topic);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Sessions are clean, so subscriptions are renewed on every connect.
                    let mqtt = app_state.mqtt.clone();
                    tokio::spawn(async move {
                        if let Err(err) = subscribe_topics(&mqtt).await {
                            warn!("{err:#}");
                        }
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;

            let timezone = { app_state.timezone.lock().await.clone() };
            app_state
                .time_synced
                .store(now_in_timezone(&timezone).is_some(), Ordering::Relaxed);

            let states = app_state.cache.snapshot().await;
            let now = Utc::now();
            for room in app_state.rooms.all() {
                room.update(&states, now).await;
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            for room in app_state.rooms.all() {
                let payload = serde_json::to_vec(&room.state_payload().await);
                match payload {
                    Ok(body) => {
                        if let Err(err) = app_state
                            .mqtt
                            .publish(room_state_topic(room.slug()), QoS::AtLeastOnce, true, body)
                            .await
                        {
                            warn!(room = %room.slug(), "room state publish failed: {err}");
                        }
                    }
                    Err(err) => warn!(room = %room.slug(), "room state serialization failed: {err}"),
                }
            }
        }
    });
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    if let Some(entity_id) = entity_from_state_topic(topic) {
        app_state
            .cache
            .update(entity_id, message, Utc::now())
            .await
            .with_context(|| format!("invalid state payload for {entity_id}"))?;
        return Ok(());
    }

    match topic {
        TOPIC_CMD_FORCE_COMPENSATION => {
            let request: ServiceRequest = parse_body(message.as_bytes())?;
            run_force_compensation(app_state, &request.entity_id).await?;
        }
        TOPIC_CMD_RESET_LEARNING => {
            let request: ServiceRequest = parse_body(message.as_bytes())?;
            run_reset_learning(app_state, &request.entity_id).await?;
        }
        TOPIC_CMD_SET_PREHEAT => {
            let request: PreheatRequest =
                serde_json::from_str(message).context("invalid set_preheat request")?;
            run_set_preheat(app_state, &request).await?;
        }
        _ => debug!("ignoring message on {topic}"),
    }

    Ok(())
}

async fn run_force_compensation(
    state: &AppState,
    selectors: &[String],
) -> Result<Vec<Arc<RoomController>>, ServiceError> {
    let rooms = state.rooms.select(selectors)?;
    let now = Utc::now();
    for room in &rooms {
        info!(room = %room.slug(), "force compensation requested");
        room.force_compensation(now).await;
    }
    Ok(rooms)
}

async fn run_reset_learning(
    state: &AppState,
    selectors: &[String],
) -> Result<Vec<Arc<RoomController>>, ServiceError> {
    let rooms = state.rooms.select(selectors)?;
    for room in &rooms {
        room.reset_learning().await;
    }
    Ok(rooms)
}

async fn run_set_preheat(
    state: &AppState,
    request: &PreheatRequest,
) -> Result<Vec<PreheatResult>, ServiceError> {
    if !request.target_temperature.is_finite() {
        return Err(ServiceError::InvalidTemperature);
    }
    let rooms = state.rooms.select(&request.entity_id)?;

    let timezone = state.timezone.lock().await.clone();
    let local_now =
        now_in_timezone(&timezone).ok_or_else(|| ServiceError::InvalidTimezone(timezone.clone()))?;
    let target_time = preheat_target_time(&local_now, &request.target_time)?;
    let now = local_now.with_timezone(&Utc);

    let mut results = Vec::with_capacity(rooms.len());
    for room in rooms {
        let plan = room
            .set_preheat(target_time, request.target_temperature, now)
            .await;
        let (start_now, preheat_minutes, start_epoch) = match plan {
            PreheatPlan::StartNow { preheat_minutes } => (true, preheat_minutes, None),
            PreheatPlan::Scheduled {
                start,
                preheat_minutes,
            } => (false, preheat_minutes, Some(start.timestamp())),
        };
        results.push(PreheatResult {
            room: room.slug().to_string(),
            start_now,
            preheat_minutes,
            start_epoch,
            target_epoch: target_time.timestamp(),
        });
    }
    Ok(results)
}

/// Next local occurrence of a `HH:MM[:SS]` wall-clock time.
fn preheat_target_time(
    local_now: &DateTime<Tz>,
    raw: &str,
) -> Result<DateTime<Utc>, ServiceError> {
    let time = parse_time_of_day(raw).ok_or_else(|| ServiceError::InvalidTime(raw.to_string()))?;
    next_occurrence(local_now, time)
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| ServiceError::InvalidTime(raw.to_string()))
}

async fn handle_list_rooms(State(state): State<AppState>) -> impl IntoResponse {
    let mut statuses = Vec::new();
    for room in state.rooms.all() {
        statuses.push(room.status().await);
    }
    Json(statuses)
}

async fn handle_get_room(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> axum::response::Response {
    match state.rooms.resolve(&selector) {
        Some(room) => Json(room.status().await).into_response(),
        None => unknown_room(&selector),
    }
}

async fn handle_set_temperature(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(room) = state.rooms.resolve(&selector) else {
        return unknown_room(&selector);
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(temp) = value.parse::<f32>().ok().filter(|temp| temp.is_finite()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    room.set_desired_temperature(temp, Utc::now()).await;
    Json(room.status().await).into_response()
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(room) = state.rooms.resolve(&selector) else {
        return unknown_room(&selector);
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'heat' or 'off'");
    };

    room.set_hvac_mode(mode).await;
    Json(room.status().await).into_response()
}

async fn handle_set_compensation(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let (room, enabled) = match switch_request(&state, &selector, &params) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if room.set_compensation_enabled(enabled).await {
        info!(room = %room.slug(), enabled = enabled, "compensation switched");
    }
    Json(room.status().await).into_response()
}

async fn handle_set_battery_saver(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let (room, enabled) = match switch_request(&state, &selector, &params) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if room.set_battery_saver(enabled).await {
        info!(room = %room.slug(), enabled = enabled, "battery saver switched");
    }
    Json(room.status().await).into_response()
}

async fn handle_set_window_override(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let (room, enabled) = match switch_request(&state, &selector, &params) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if room.set_window_override(enabled).await {
        info!(room = %room.slug(), enabled = enabled, "window override switched");
    }
    Json(room.status().await).into_response()
}

async fn handle_get_options(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> axum::response::Response {
    let Some(room) = state.rooms.resolve(&selector) else {
        return unknown_room(&selector);
    };
    let runtime = match state.store.load_runtime_config().await {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!("failed to load runtime config: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load runtime settings",
            );
        }
    };
    let options = runtime
        .rooms
        .iter()
        .find(|entry| room_slug(&entry.data.room_name) == room.slug())
        .map(|entry| entry.options.clone())
        .unwrap_or_default();
    Json(options).into_response()
}

async fn handle_put_options(
    State(state): State<AppState>,
    Path(selector): Path<String>,
    Json(options): Json<RoomOptions>,
) -> axum::response::Response {
    let Some(room) = state.rooms.resolve(&selector) else {
        return unknown_room(&selector);
    };

    let config = match persist_room_options(&state.store, room.slug(), options).await {
        Ok(Some(config)) => config,
        Ok(None) => return unknown_room(&selector),
        Err(err) => {
            warn!(room = %room.slug(), "failed to persist room options: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist runtime settings",
            );
        }
    };

    room.reconfigure(config).await;
    Json(room.status().await).into_response()
}

async fn persist_room_options(
    store: &AppStore,
    slug: &str,
    options: RoomOptions,
) -> anyhow::Result<Option<offset_common::RoomConfig>> {
    let mut runtime = store.load_runtime_config().await?;
    let Some(entry) = runtime
        .rooms
        .iter_mut()
        .find(|entry| room_slug(&entry.data.room_name) == slug)
    else {
        return Ok(None);
    };
    entry.options = options;
    let config = entry.resolve();
    store.save_runtime_config(&runtime).await?;
    Ok(Some(config))
}

async fn handle_force_compensation(State(state): State<AppState>, body: Bytes) -> axum::response::Response {
    let request: ServiceRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &format!("{err:#}")),
    };
    match run_force_compensation(&state, &request.entity_id).await {
        Ok(rooms) => room_statuses(rooms).await,
        Err(err) => error_response(err.status(), &err.to_string()),
    }
}

async fn handle_reset_learning(State(state): State<AppState>, body: Bytes) -> axum::response::Response {
    let request: ServiceRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &format!("{err:#}")),
    };
    match run_reset_learning(&state, &request.entity_id).await {
        Ok(rooms) => room_statuses(rooms).await,
        Err(err) => error_response(err.status(), &err.to_string()),
    }
}

async fn handle_set_preheat(
    State(state): State<AppState>,
    Json(request): Json<PreheatRequest>,
) -> axum::response::Response {
    match run_set_preheat(&state, &request).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => error_response(err.status(), &err.to_string()),
    }
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.timezone.lock().await.clone();
    Json(TimeStatus {
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone,
        now_epoch: Utc::now().timestamp(),
    })
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone.clone();
    }

    let persisted = async {
        let mut runtime = state.store.load_runtime_config().await?;
        runtime.timezone = update.timezone;
        state.store.save_runtime_config(&runtime).await
    };
    if let Err(err) = persisted.await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await.into_response()
}

fn switch_request(
    state: &AppState,
    selector: &str,
    params: &HashMap<String, String>,
) -> Result<(Arc<RoomController>, bool), axum::response::Response> {
    let room = state
        .rooms
        .resolve(selector)
        .ok_or_else(|| unknown_room(selector))?;
    let value = params
        .get("value")
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter"))?;
    let enabled = parse_switch(value)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'"))?;
    Ok((room, enabled))
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// An empty body is the same as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> anyhow::Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).context("invalid service request")
}

async fn room_statuses(rooms: Vec<Arc<RoomController>>) -> axum::response::Response {
    let mut statuses = Vec::with_capacity(rooms.len());
    for room in rooms {
        statuses.push(room.status().await);
    }
    Json(statuses).into_response()
}

fn now_in_timezone(timezone: &str) -> Option<DateTime<Tz>> {
    let tz: Tz = timezone.parse().ok()?;
    Some(Utc::now().with_timezone(&tz))
}

fn unknown_room(selector: &str) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, &format!("Unknown room '{selector}'"))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;
    use pretty_assertions::assert_eq;

    use super::*;

    fn berlin_morning() -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap()
    }

    #[test]
    fn service_request_accepts_one_or_many_rooms() {
        let one: ServiceRequest = parse_body(br#"{"entity_id": "climate.office"}"#).unwrap();
        assert_eq!(one.entity_id, vec!["climate.office"]);

        let many: ServiceRequest =
            parse_body(br#"{"entity_id": ["climate.office", "climate.bath"]}"#).unwrap();
        assert_eq!(many.entity_id, vec!["climate.office", "climate.bath"]);

        let all: ServiceRequest = parse_body(b"").unwrap();
        assert!(all.entity_id.is_empty());
        let all: ServiceRequest = parse_body(b"{}").unwrap();
        assert!(all.entity_id.is_empty());

        assert!(parse_body::<ServiceRequest>(b"[1, 2").is_err());
    }

    #[test]
    fn preheat_request_parses() {
        let request: PreheatRequest = serde_json::from_str(
            r#"{"entity_id": "climate.office", "target_time": "07:00", "target_temperature": 21}"#,
        )
        .unwrap();

        assert_eq!(request.entity_id, vec!["climate.office"]);
        assert_eq!(request.target_time, "07:00");
        assert_eq!(request.target_temperature, 21.0);
    }

    #[test]
    fn preheat_target_is_next_local_occurrence() {
        let later_today = preheat_target_time(&berlin_morning(), "07:00").unwrap();
        assert_eq!(later_today, Utc.with_ymd_and_hms(2026, 1, 10, 6, 0, 0).unwrap());

        let tomorrow = preheat_target_time(&berlin_morning(), "05:30").unwrap();
        assert_eq!(tomorrow, Utc.with_ymd_and_hms(2026, 1, 11, 4, 30, 0).unwrap());

        assert!(matches!(
            preheat_target_time(&berlin_morning(), "7 o'clock"),
            Err(ServiceError::InvalidTime(_))
        ));
    }

    #[test]
    fn preheat_target_follows_dst_change() {
        // Clocks go forward overnight; 07:00 CEST is 05:00 UTC.
        let evening = Berlin.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();

        let target = preheat_target_time(&evening, "07:00").unwrap();

        assert_eq!(target, Utc.with_ymd_and_hms(2026, 3, 29, 5, 0, 0).unwrap());
    }

    #[test]
    fn switch_values() {
        assert_eq!(parse_switch("ON"), Some(true));
        assert_eq!(parse_switch(" false "), Some(false));
        assert_eq!(parse_switch("1"), Some(true));
        assert_eq!(parse_switch("maybe"), None);
    }

    #[test]
    fn service_errors_map_to_status_codes() {
        assert_eq!(
            ServiceError::from(UnknownRoom("garage".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::InvalidTime("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn timezone_resolution() {
        assert!(now_in_timezone("Europe/Berlin").is_some());
        assert!(now_in_timezone("Mars/Olympus").is_none());
    }
}
