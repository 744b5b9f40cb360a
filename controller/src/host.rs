use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use aquarium_common::{
    InputEvent, LocalUi, LogLevel, Output, PeripheralRequest, RuntimeConfig, SettingField,
    SettingUpdate, StartRefusal, TpaAction, TpaEngine, TriggerSource, TOPIC_CMD_ALERT_RESET,
    TOPIC_CMD_BUFFER_START, TOPIC_CMD_INPUT, TOPIC_CMD_SETTINGS_PREFIX, TOPIC_CMD_TPA_SCHEDULE,
    TOPIC_CMD_TPA_START, TOPIC_CONTROLLER_EVENT, TOPIC_CONTROLLER_STATE,
    TOPIC_CONTROLLER_STATUS,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

const CONTROL_LOOP_INTERVAL: Duration = Duration::from_millis(250);
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<TpaEngine>>,
    ui: Arc<Mutex<LocalUi>>,
    hardware: Arc<Mutex<SimulatedHardware>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    mqtt: AsyncClient,
    mqtt_connected: Arc<AtomicBool>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Stand-in for the pumps, valve and reservoir float switch. The reservoir
/// drains while the reposition pump runs and fills while the valve is open.
#[derive(Debug)]
struct SimulatedHardware {
    outputs: HashMap<Output, bool>,
    level_pct: f32,
    last_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    level: &'a str,
    message: &'a str,
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

#[derive(Debug, Serialize)]
struct HardwareView {
    outputs: BTreeMap<&'static str, bool>,
    #[serde(rename = "levelPercent")]
    level_percent: f32,
    #[serde(rename = "levelFull")]
    level_full: bool,
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
    runtime.sanitize();

    let debounce_ms = runtime.tpa.settings_save_debounce_ms;
    let publish_interval = Duration::from_millis(runtime.tpa.state_publish_interval_ms);
    let engine = TpaEngine::new(runtime.tpa.clone(), runtime.settings.clone());
    info!(
        "extraction set to {:.2} L ({} ms), reposition {:.2} L",
        engine.extraction_volume_l(),
        engine.extraction_duration_ms(),
        engine.reposition_volume_l()
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("aquarium-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_CONTROLLER_STATUS,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        ui: Arc::new(Mutex::new(LocalUi::new())),
        hardware: Arc::new(Mutex::new(SimulatedHardware::new())),
        timezone: Arc::new(Mutex::new(runtime.timezone)),
        time_synced: Arc::new(AtomicBool::new(false)),
        mqtt,
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        store,
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), debounce_ms);
    spawn_state_publish_loop(app_state.clone(), publish_interval);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/tpa/start", post(handle_tpa_start))
        .route("/api/tpa/buffer", post(handle_buffer_start))
        .route("/api/settings/{field}", post(handle_set_setting))
        .route("/api/service", post(handle_set_service_mode))
        .route("/api/alerts/reset", post(handle_alerts_reset))
        .route("/api/input", post(handle_input))
        .route("/api/hardware", get(handle_get_hardware))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .fallback_service(ServeDir::new(web_root))
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
    let topics = [
        TOPIC_CMD_TPA_START.to_string(),
        TOPIC_CMD_TPA_SCHEDULE.to_string(),
        TOPIC_CMD_BUFFER_START.to_string(),
        TOPIC_CMD_ALERT_RESET.to_string(),
        TOPIC_CMD_INPUT.to_string(),
        format!("{TOPIC_CMD_SETTINGS_PREFIX}+"),
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.mqtt_connected.store(true, Ordering::Relaxed);
                    let state = app_state.clone();
                    tokio::spawn(async move { on_mqtt_connected(state).await });
                }
                Ok(_) => {}
                Err(err) => {
                    if app_state.mqtt_connected.swap(false, Ordering::Relaxed) {
                        app_state.engine.lock().await.set_cloud_connected(false);
                        warn!("mqtt link lost, local schedule armed");
                    }
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn on_mqtt_connected(app_state: AppState) {
    if let Err(err) = subscribe_topics(&app_state.mqtt).await {
        warn!("mqtt subscribe failed: {err:#}");
    }
    if let Err(err) = app_state
        .mqtt
        .publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, "online")
        .await
    {
        warn!("controller status publish failed: {err}");
    }

    let actions = {
        let mut engine = app_state.engine.lock().await;
        engine.set_cloud_connected(true);
        engine.sync_actions()
    };
    execute_actions(&app_state, actions).await;
}

fn spawn_control_loop(app_state: AppState, debounce_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONTROL_LOOP_INTERVAL);
        let mut save_due_ms: Option<u64> = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let timezone = { app_state.timezone.lock().await.clone() };
            let now_in_tz = now_in_timezone(&timezone);
            app_state
                .time_synced
                .store(now_in_tz.is_some(), Ordering::Relaxed);

            let level_full = {
                let mut hardware = app_state.hardware.lock().await;
                hardware.advance(now_ms);
                hardware.level_full()
            };

            let (actions, dirty) = {
                let mut engine = app_state.engine.lock().await;
                engine.update_level_sensor(level_full);
                let actions = engine.tick(now_ms, now_in_tz);
                (actions, engine.take_config_dirty())
            };

            if !actions.is_empty() {
                execute_actions(&app_state, actions).await;
            }

            if dirty {
                save_due_ms = Some(now_ms.saturating_add(debounce_ms));
            }
            if save_due_ms.is_some_and(|due| now_ms >= due) {
                save_due_ms = None;
                if let Err(err) = persist_runtime_from_state(&app_state).await {
                    warn!("failed to persist settings: {err:#}");
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if !app_state.mqtt_connected.load(Ordering::Relaxed) {
                continue;
            }

            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&engine.state_payload())
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state.mqtt.try_publish(
                        TOPIC_CONTROLLER_STATE,
                        QoS::AtLeastOnce,
                        true,
                        body,
                    ) {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

/// Carries out engine actions. Outputs always switch; dashboard traffic is
/// dropped while the broker is unreachable so the loop never waits on it.
async fn execute_actions(app_state: &AppState, actions: Vec<TpaAction>) {
    let connected = app_state.mqtt_connected.load(Ordering::Relaxed);

    for action in actions {
        match action {
            TpaAction::SetOutput { output, on } => {
                app_state.hardware.lock().await.set_output(output, on);
                info!("{} {}", output.as_str(), if on { "ON" } else { "OFF" });
            }
            TpaAction::Publish { channel, value } => {
                if connected {
                    if let Err(err) = app_state.mqtt.try_publish(
                        channel.topic(),
                        QoS::AtMostOnce,
                        true,
                        value.to_payload(),
                    ) {
                        warn!("telemetry publish to {} failed: {err}", channel.topic());
                    }
                }
            }
            TpaAction::Log { level, message } => {
                match level {
                    LogLevel::Info | LogLevel::Success => info!("{message}"),
                    LogLevel::Warning => warn!("{message}"),
                    LogLevel::Error | LogLevel::Critical => error!("{message}"),
                }
                if connected {
                    publish_event(app_state, level, &message);
                }
            }
        }
    }
}

fn publish_event(app_state: &AppState, level: LogLevel, message: &str) {
    let body = EventBody {
        level: level.as_str(),
        message,
    };
    match serde_json::to_vec(&body) {
        Ok(payload) => {
            if let Err(err) =
                app_state
                    .mqtt
                    .try_publish(TOPIC_CONTROLLER_EVENT, QoS::AtMostOnce, false, payload)
            {
                warn!("event publish failed: {err}");
            }
        }
        Err(err) => warn!("event serialization failed: {err}"),
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let message = message.trim();
    let now_ms = monotonic_ms();

    let actions = match topic.as_str() {
        TOPIC_CMD_TPA_START | TOPIC_CMD_TPA_SCHEDULE => {
            if !is_press(message) {
                return Ok(());
            }
            let source = if topic == TOPIC_CMD_TPA_START {
                TriggerSource::Manual
            } else {
                TriggerSource::Cloud
            };
            let (_, actions) = app_state.engine.lock().await.trigger_cycle(source, now_ms);
            actions
        }
        TOPIC_CMD_BUFFER_START => {
            if !is_press(message) {
                return Ok(());
            }
            let (_, actions) = app_state.engine.lock().await.trigger_buffer_dosing(now_ms);
            actions
        }
        TOPIC_CMD_ALERT_RESET => {
            if !is_press(message) {
                return Ok(());
            }
            app_state.engine.lock().await.reset_alerts()
        }
        TOPIC_CMD_INPUT => {
            let event = message
                .parse::<InputEvent>()
                .map_err(anyhow::Error::msg)?;
            dispatch_input(app_state, event).await
        }
        other => {
            let Some(field) = SettingField::from_topic(other) else {
                return Ok(());
            };
            let update = SettingUpdate::parse(field, message)?;
            let (_, actions) = app_state.engine.lock().await.apply_setting(update);
            actions
        }
    };

    execute_actions(app_state, actions).await;
    Ok(())
}

fn is_press(message: &str) -> bool {
    matches!(message, "1" | "on" | "ON" | "true" | "")
}

async fn dispatch_input(app_state: &AppState, event: InputEvent) -> Vec<TpaAction> {
    let response = {
        let mut engine = app_state.engine.lock().await;
        let mut ui = app_state.ui.lock().await;
        ui.handle(event, &mut engine)
    };

    if let Some(request) = response.request {
        handle_peripheral_request(request);
    }
    response.actions
}

fn handle_peripheral_request(request: PeripheralRequest) {
    match request {
        PeripheralRequest::ResetSensorMinMax => {
            info!("sensor min/max reset requested; no sensor bus on host builds")
        }
        PeripheralRequest::ResetRtcAlert => {
            info!("RTC alert reset requested; host clock has no battery flag")
        }
        PeripheralRequest::StartPhCalibration => {
            warn!("pH calibration requested; no probe attached on host builds")
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.timezone.lock().await.clone();
    let now = now_in_timezone(&timezone);
    let time_synced = state.time_synced.load(Ordering::Relaxed);

    let status = {
        let engine = state.engine.lock().await;
        engine.status(now, time_synced, &timezone)
    };

    Json(status)
}

async fn handle_tpa_start(State(state): State<AppState>) -> impl IntoResponse {
    let (result, actions) = {
        let mut engine = state.engine.lock().await;
        engine.trigger_cycle(TriggerSource::Manual, monotonic_ms())
    };
    execute_actions(&state, actions).await;

    if let Err(refusal) = result {
        return refusal_response(refusal);
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_buffer_start(State(state): State<AppState>) -> impl IntoResponse {
    let (result, actions) = {
        let mut engine = state.engine.lock().await;
        engine.trigger_buffer_dosing(monotonic_ms())
    };
    execute_actions(&state, actions).await;

    if let Err(refusal) = result {
        return refusal_response(refusal);
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_setting(
    State(state): State<AppState>,
    Path(field): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(field) = SettingField::from_name(&field) else {
        return error_response(StatusCode::NOT_FOUND, &format!("Unknown setting '{field}'"));
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    let update = match SettingUpdate::parse(field, value) {
        Ok(update) => update,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    apply_setting_response(state, update).await
}

async fn handle_set_service_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(update) = SettingUpdate::parse(SettingField::ServiceMode, value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };
    apply_setting_response(state, update).await
}

async fn apply_setting_response(state: AppState, update: SettingUpdate) -> axum::response::Response {
    let (result, actions) = {
        let mut engine = state.engine.lock().await;
        engine.apply_setting(update)
    };
    execute_actions(&state, actions).await;

    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_alerts_reset(State(state): State<AppState>) -> impl IntoResponse {
    let actions = state.engine.lock().await.reset_alerts();
    execute_actions(&state, actions).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_input(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(raw) = params.get("event") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'event' parameter");
    };
    let event = match raw.parse::<InputEvent>() {
        Ok(event) => event,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let actions = dispatch_input(&state, event).await;
    execute_actions(&state, actions).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_hardware(State(state): State<AppState>) -> impl IntoResponse {
    let hardware = state.hardware.lock().await;
    Json(HardwareView {
        outputs: Output::ALL
            .into_iter()
            .map(|output| (output.as_str(), hardware.is_on(output)))
            .collect(),
        level_percent: hardware.level_pct,
        level_full: hardware.level_full(),
    })
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
        *timezone = update.timezone;
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await.into_response()
}

impl SimulatedHardware {
    const FILL_PCT_PER_SEC: f32 = 2.0;
    const DRAIN_PCT_PER_SEC: f32 = 1.0;

    fn new() -> Self {
        Self {
            outputs: Output::ALL.into_iter().map(|output| (output, false)).collect(),
            level_pct: 100.0,
            last_ms: None,
        }
    }

    fn set_output(&mut self, output: Output, on: bool) {
        self.outputs.insert(output, on);
    }

    fn is_on(&self, output: Output) -> bool {
        self.outputs.get(&output).copied().unwrap_or(false)
    }

    fn advance(&mut self, now_ms: u64) {
        let elapsed_s = self
            .last_ms
            .map(|last| now_ms.saturating_sub(last) as f32 / 1000.0)
            .unwrap_or(0.0);
        self.last_ms = Some(now_ms);

        if self.is_on(Output::RanValve) {
            self.level_pct += Self::FILL_PCT_PER_SEC * elapsed_s;
        }
        if self.is_on(Output::RepositionPump) {
            self.level_pct -= Self::DRAIN_PCT_PER_SEC * elapsed_s;
        }
        self.level_pct = self.level_pct.clamp(0.0, 100.0);
    }

    fn level_full(&self) -> bool {
        self.level_pct >= 100.0
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("AQUARIUM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.aquarium"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
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

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let settings = state.engine.lock().await.settings().clone();
    let timezone = state.timezone.lock().await.clone();

    let mut runtime = state.store.load_runtime_config().await?;
    runtime.settings = settings;
    runtime.timezone = timezone;
    state.store.save_runtime_config(&runtime).await?;
    info!("settings saved");
    Ok(())
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn refusal_response(refusal: StartRefusal) -> axum::response::Response {
    let status = match refusal {
        StartRefusal::ZeroDuration => StatusCode::BAD_REQUEST,
        StartRefusal::ServiceMode | StartRefusal::Busy(_) => StatusCode::CONFLICT,
    };
    error_response(status, &refusal.to_string())
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
