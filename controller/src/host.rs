use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use circadian_common::{
    config::ApiConfig, load_credential, recovery, ApiKey, CredentialStore, CycleInput,
    EngineAction, LightOutput, LightingEngine, RawInputs, RefreshOutcome, RefreshReason,
    RemoteError, RuntimeConfig, ScheduleStore, SensorDebouncers, TelemetryPayload,
    TOPIC_CMD_FETCH, TOPIC_DEVICE_SCHEDULE, TOPIC_DEVICE_STATE, TOPIC_DEVICE_TELEMETRY,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const BUTTON_HOLD_MS: u64 = 150;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<LightingEngine>>,
    schedule: Arc<Mutex<ScheduleStore>>,
    inputs: Arc<Mutex<SimInputs>>,
    credentials: Arc<Mutex<FileCredentialStore>>,
    clock: WallClock,
    api: ApiClient,
    mqtt: Option<AsyncClient>,
    timezone: Arc<String>,
    /// Manual fetch waiting for the next control cycle.
    fetch_requested: Arc<AtomicBool>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    credential_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
struct FileCredentialStore {
    path: PathBuf,
}

/// Wall clock that can be moved by the operator without touching the host clock.
#[derive(Clone, Default)]
struct WallClock {
    offset_ms: Arc<AtomicI64>,
}

/// Sensor values injected through the simulation endpoints.
#[derive(Debug, Clone)]
struct SimInputs {
    button_until_ms: Option<u64>,
    motion: bool,
    dial_raw: u16,
}

#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    config: Arc<ApiConfig>,
    key: Option<ApiKey>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TimeUpdate {
    epoch: i64,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    timezone: String,
    #[serde(rename = "localTime")]
    local_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct FetchQueued {
    queued: bool,
}

#[derive(Debug, Serialize)]
struct SimInputsView {
    motion: bool,
    #[serde(rename = "dialRaw")]
    dial_raw: u16,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let mut credentials = store.credential_store();
    let key = load_credential(&mut credentials, &runtime.api.fallback_key);
    let api = ApiClient::new(runtime.api.clone(), key)?;

    let mqtt = if runtime.network.mqtt_enabled() {
        let mut mqtt_options = MqttOptions::new(
            "circadian-controller",
            runtime.network.mqtt_host.clone(),
            runtime.network.mqtt_port,
        );
        if !runtime.network.mqtt_user.is_empty() {
            mqtt_options.set_credentials(
                runtime.network.mqtt_user.clone(),
                runtime.network.mqtt_pass.clone(),
            );
        }
        Some(AsyncClient::new(mqtt_options, 64))
    } else {
        info!("mqtt host not configured, state mirroring disabled");
        None
    };

    let app_state = AppState {
        engine: Arc::new(Mutex::new(LightingEngine::new(runtime.lighting.clone()))),
        schedule: Arc::new(Mutex::new(ScheduleStore::new(
            runtime.lighting.default_color_temp_k,
        ))),
        inputs: Arc::new(Mutex::new(SimInputs::new(runtime.lighting.dial_max_raw))),
        credentials: Arc::new(Mutex::new(credentials)),
        clock: WallClock::default(),
        api,
        mqtt: mqtt.as_ref().map(|(client, _)| client.clone()),
        timezone: Arc::new(runtime.timezone.clone()),
        fetch_requested: Arc::new(AtomicBool::new(false)),
    };

    if let Some((client, eventloop)) = mqtt {
        client.subscribe(TOPIC_CMD_FETCH, QoS::AtMostOnce).await?;
        spawn_mqtt_loop(app_state.clone(), eventloop);
        spawn_state_publish_loop(app_state.clone(), client);
    }
    spawn_control_loop(app_state.clone(), &runtime);

    let app = Router::new()
        .route("/", get(handle_portal_page))
        .route("/save", post(handle_portal_save))
        .route("/api/status", get(handle_get_status))
        .route("/api/schedule", get(handle_get_schedule))
        .route("/api/fetch", post(handle_post_fetch))
        .route("/api/time", get(handle_get_time).put(handle_put_time))
        .route("/api/credential", delete(handle_delete_credential))
        .route("/api/sim/button", post(handle_sim_button))
        .route("/api/sim/motion", put(handle_sim_motion))
        .route("/api/sim/dial", put(handle_sim_dial))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8180);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(base_url) = std::env::var("API_BASE_URL") {
        runtime.api.base_url = base_url;
    }
    if let Ok(key) = std::env::var("API_KEY") {
        runtime.api.fallback_key = key;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
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

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }

    if topic == TOPIC_CMD_FETCH {
        if app_state.engine.lock().await.in_recovery() {
            warn!("ignoring fetch command while in recovery");
            return;
        }
        debug!("mqtt fetch queued");
        app_state.fetch_requested.store(true, Ordering::Relaxed);
    }
}

fn spawn_control_loop(app_state: AppState, runtime: &RuntimeConfig) {
    let period = Duration::from_millis(runtime.lighting.cycle_period_ms);
    let mut sensors = SensorDebouncers::new(&runtime.lighting);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // Network calls run inside the cycle; skip ahead instead of bursting afterwards.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_output = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let raw = app_state.inputs.lock().await.sample(now_ms);
            let input = CycleInput {
                now_ms,
                now: app_state.clock.now(),
                sensors: sensors.sample(raw, now_ms),
            };

            let actions = {
                let mut engine = app_state.engine.lock().await;
                let schedule = app_state.schedule.lock().await;
                engine.tick(&input, &schedule)
            };

            execute_engine_actions(&app_state, actions, &mut last_output).await;

            if let Some(outcome) = run_queued_fetch(&app_state).await {
                info!("manual fetch finished: {outcome:?}");
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, mqtt: AsyncClient) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&engine.state_payload())
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_DEVICE_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("device state publish failed: {err}");
                    }
                }
                Err(err) => warn!("device state serialization failed: {err}"),
            }

            let schedule_payload = {
                let schedule = app_state.schedule.lock().await;
                serde_json::to_vec(schedule.schedule())
            };

            match schedule_payload {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_DEVICE_SCHEDULE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("schedule state publish failed: {err}");
                    }
                }
                Err(err) => warn!("schedule serialization failed: {err}"),
            }
        }
    });
}

async fn execute_engine_actions(
    app_state: &AppState,
    actions: Vec<EngineAction>,
    last_output: &mut Option<LightOutput>,
) {
    for action in actions {
        match action {
            EngineAction::Render(output) => show_output(output, last_output),
            EngineAction::Telemetry(payload) => send_telemetry(app_state, &payload).await,
            EngineAction::RefreshSchedule(reason) => {
                refresh_schedule(app_state, reason).await;
            }
        }

        // A 401 mid-cycle voids the rest of the batch; show the cue instead.
        let cue = {
            let engine = app_state.engine.lock().await;
            engine.in_recovery().then(|| engine.light_output())
        };
        if let Some(cue) = cue {
            show_output(cue, last_output);
            return;
        }
    }
}

fn show_output(output: LightOutput, last_output: &mut Option<LightOutput>) {
    if *last_output != Some(output) {
        info!("light output: {output:?}");
        *last_output = Some(output);
    }
}

/// Runs a fetch requested over HTTP or MQTT since the previous cycle.
async fn run_queued_fetch(app_state: &AppState) -> Option<RefreshOutcome> {
    if !app_state.fetch_requested.swap(false, Ordering::Relaxed) {
        return None;
    }
    if app_state.engine.lock().await.in_recovery() {
        warn!("dropping queued fetch, device is in recovery");
        return None;
    }
    Some(refresh_schedule(app_state, RefreshReason::Manual).await)
}

async fn send_telemetry(app_state: &AppState, payload: &TelemetryPayload) {
    info!("sending telemetry {}", payload.event_type.as_str());

    if let Some(mqtt) = &app_state.mqtt {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                if let Err(err) = mqtt
                    .publish(TOPIC_DEVICE_TELEMETRY, QoS::AtMostOnce, false, body)
                    .await
                {
                    warn!("telemetry mirror publish failed: {err}");
                }
            }
            Err(err) => warn!("telemetry serialization failed: {err}"),
        }
    }

    let result = app_state.api.send_telemetry(payload).await;
    app_state.engine.lock().await.apply_telemetry_result(result);
}

async fn refresh_schedule(app_state: &AppState, reason: RefreshReason) -> RefreshOutcome {
    info!("fetching schedule ({})", reason.as_str());
    let result = app_state.api.fetch_schedule().await;

    let mut engine = app_state.engine.lock().await;
    let mut schedule = app_state.schedule.lock().await;
    engine.apply_fetch(&mut schedule, result)
}

async fn handle_portal_page(State(state): State<AppState>) -> impl IntoResponse {
    let status = build_status(&state).await;
    Html(recovery::status_page(&status))
}

async fn handle_portal_save(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let mode = state.engine.lock().await.mode();
    let reply = {
        let mut credentials = state.credentials.lock().await;
        recovery::handle_save(mode, &body, &mut *credentials)
    };

    if reply.restart {
        schedule_restart("credential replaced");
    }

    (
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, reply.content_type)],
        reply.body,
    )
        .into_response()
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let schedule = state.schedule.lock().await.schedule().clone();
    Json(schedule)
}

async fn handle_post_fetch(State(state): State<AppState>) -> impl IntoResponse {
    if state.engine.lock().await.in_recovery() {
        return error_response(StatusCode::CONFLICT, "Device is in recovery mode");
    }

    state.fetch_requested.store(true, Ordering::Relaxed);
    Json(FetchQueued { queued: true }).into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.clock.now();
    Json(TimeStatus {
        now_epoch: now.timestamp(),
        timezone: state.timezone.to_string(),
        local_time: local_time(&state.timezone, now),
    })
}

async fn handle_put_time(
    State(state): State<AppState>,
    Json(update): Json<TimeUpdate>,
) -> impl IntoResponse {
    let Some(target) = DateTime::<Utc>::from_timestamp(update.epoch, 0) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid epoch value");
    };

    state.clock.set(target);
    info!("wall clock set to {target}");
    handle_get_time(State(state)).await.into_response()
}

async fn handle_delete_credential(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.credentials.lock().await.clear();
    if let Err(err) = result {
        warn!("failed to clear credential: {err}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear credential",
        );
    }

    info!("stored API key cleared");
    schedule_restart("credential cleared");
    StatusCode::ACCEPTED.into_response()
}

async fn handle_sim_button(State(state): State<AppState>) -> impl IntoResponse {
    state.inputs.lock().await.press(monotonic_ms());
    StatusCode::NO_CONTENT
}

async fn handle_sim_motion(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let motion = match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid motion value"),
    };

    let mut inputs = state.inputs.lock().await;
    inputs.motion = motion;
    Json(inputs.view()).into_response()
}

async fn handle_sim_dial(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(raw) = value.parse::<u16>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid dial value");
    };

    let mut inputs = state.inputs.lock().await;
    inputs.dial_raw = raw;
    Json(inputs.view()).into_response()
}

async fn build_status(state: &AppState) -> circadian_common::DeviceStatus {
    let now = state.clock.now();
    let fingerprint = state.api.key.as_ref().map(ApiKey::fingerprint);
    let engine = state.engine.lock().await;
    let schedule = state.schedule.lock().await;
    engine.status(
        &schedule,
        now,
        fingerprint,
        local_time(&state.timezone, now),
    )
}

fn schedule_restart(reason: &'static str) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(recovery::RESTART_DELAY_MS)).await;
        info!("exiting for restart: {reason}");
        std::process::exit(0);
    });
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CIRCADIAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.circadian"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            credential_path: Arc::new(data_dir.join("credential")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn credential_store(&self) -> FileCredentialStore {
        FileCredentialStore {
            path: self.credential_path.as_ref().clone(),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    type Error = std::io::Error;

    fn load(&mut self) -> Result<Option<String>, Self::Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&mut self, key: &ApiKey) -> Result<(), Self::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, key.as_str())
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

impl WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }

    fn set(&self, target: DateTime<Utc>) {
        let offset = (target - Utc::now()).num_milliseconds();
        self.offset_ms.store(offset, Ordering::Relaxed);
    }
}

impl SimInputs {
    fn new(dial_raw: u16) -> Self {
        Self {
            button_until_ms: None,
            motion: false,
            dial_raw,
        }
    }

    fn press(&mut self, now_ms: u64) {
        self.button_until_ms = Some(now_ms + BUTTON_HOLD_MS);
    }

    fn sample(&self, now_ms: u64) -> RawInputs {
        RawInputs {
            button_down: self.button_until_ms.is_some_and(|until| now_ms < until),
            motion: self.motion,
            dial_raw: self.dial_raw,
        }
    }

    fn view(&self) -> SimInputsView {
        SimInputsView {
            motion: self.motion,
            dial_raw: self.dial_raw,
        }
    }
}

impl ApiClient {
    fn new(config: ApiConfig, key: Option<ApiKey>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            config: Arc::new(config),
            key,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.key {
            Some(key) => request.header(self.config.key_header.as_str(), key.as_str()),
            None => request,
        }
    }

    async fn fetch_schedule(&self) -> Result<Vec<u8>, RemoteError> {
        let request = self.authorized(self.http.get(self.config.schedule_url()));
        let response = request.send().await.map_err(transport_error)?;
        classify_status(response.status())?;
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }

    async fn send_telemetry(&self, payload: &TelemetryPayload) -> Result<(), RemoteError> {
        let body =
            serde_json::to_vec(payload).map_err(|err| RemoteError::Transport(err.to_string()))?;
        let request = self
            .authorized(self.http.post(self.config.telemetry_url()))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = request.send().await.map_err(transport_error)?;
        classify_status(response.status())
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), RemoteError> {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(RemoteError::Unauthorized)
    } else if status.is_success() {
        Ok(())
    } else {
        Err(RemoteError::Status(status.as_u16()))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() {
        RemoteError::Offline
    } else {
        RemoteError::Transport(err.to_string())
    }
}

fn local_time(timezone: &str, now: DateTime<Utc>) -> Option<String> {
    let tz: Tz = timezone.parse().ok()?;
    Some(
        now.with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string(),
    )
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
