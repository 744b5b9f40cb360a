use core::convert::TryInto;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use aquarium_common::{
    InputEvent, LocalUi, LogLevel, NetworkConfig, Output, PeripheralRequest, PinConfig,
    RuntimeConfig, SettingField, SettingUpdate, StartRefusal, TpaAction, TpaEngine, TriggerSource,
    TOPIC_CMD_ALERT_RESET, TOPIC_CMD_BUFFER_START, TOPIC_CMD_INPUT, TOPIC_CMD_SETTINGS_PREFIX,
    TOPIC_CMD_TPA_SCHEDULE, TOPIC_CMD_TPA_START, TOPIC_CONTROLLER_EVENT, TOPIC_CONTROLLER_STATE,
    TOPIC_CONTROLLER_STATUS,
};
use chrono::{Datelike, Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, LastWill, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output as GpioOutput, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

const NVS_NAMESPACE: &str = "aquarium";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const CONTROL_LOOP_INTERVAL_MS: u64 = 200;
const SETTINGS_SAVE_RETRY_MS: u64 = 1_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
// Anything earlier means SNTP has not set the clock yet.
const MIN_VALID_YEAR: i32 = 2024;

const INDEX_HTML: &str = include_str!("../web/index.html");

type Mqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<TpaEngine>>,
    ui: Arc<Mutex<LocalUi>>,
    relays: Arc<Mutex<RelayBank>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    settings_save_deadline_ms: Arc<Mutex<Option<u64>>>,
    mqtt: Option<Mqtt>,
    mqtt_connected: Arc<AtomicBool>,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, GpioOutput>,
    active_low: bool,
}

/// Pumps and the reservoir valve, each driven with its own polarity.
struct RelayBank {
    relays: HashMap<Output, Relay>,
}

struct LevelSensor {
    pin: PinDriver<'static, AnyIOPin, Input>,
    full_when_low: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    level: &'a str,
    message: &'a str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    // Outputs go to their idle level before anything else can run.
    let relays = RelayBank::new(&runtime.pins)?;
    let level_sensor = LevelSensor::new(&runtime.pins)?;

    let engine = TpaEngine::new(runtime.tpa.clone(), runtime.settings.clone());
    info!(
        "extraction set to {:.2} L ({} ms), reposition {:.2} L",
        engine.extraction_volume_l(),
        engine.extraction_duration_ms(),
        engine.reposition_volume_l()
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable, running offline on the local schedule: {err:#}");
            None
        }
    };

    let sntp = match &wifi {
        Some(_) => match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                Some(sntp)
            }
            Err(err) => {
                warn!("failed to start SNTP: {err:?}");
                None
            }
        },
        None => None,
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mqtt = match &wifi {
        Some(_) => match create_mqtt_client(&runtime.network) {
            Ok((client, conn)) => Some((Arc::new(Mutex::new(client)), conn)),
            Err(err) => {
                warn!("mqtt client unavailable: {err:#}");
                None
            }
        },
        None => None,
    };

    let shared_state = SharedState {
        engine: Arc::new(Mutex::new(engine)),
        ui: Arc::new(Mutex::new(LocalUi::new())),
        relays: Arc::new(Mutex::new(relays)),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        time_synced: Arc::new(AtomicBool::new(false)),
        settings_save_deadline_ms: Arc::new(Mutex::new(None)),
        mqtt: mqtt.as_ref().map(|(client, _)| client.clone()),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    if let Some((_, conn)) = mqtt {
        spawn_mqtt_receiver(shared_state.clone(), conn)?;
    }
    spawn_control_loop(
        shared_state.clone(),
        nvs_store.clone(),
        level_sensor,
        runtime.tpa.settings_save_debounce_ms,
        runtime.tpa.state_publish_interval_ms,
    )?;

    let server = match &wifi {
        Some(_) => Some(create_http_server(shared_state, nvs_store)?),
        None => None,
    };

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _sntp = sntp;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayBank {
    fn new(pins: &PinConfig) -> anyhow::Result<Self> {
        let mut relays = HashMap::new();
        for output in Output::ALL {
            let assignment = pins.output(output);
            let pin = unsafe { PinDriver::output(AnyOutputPin::new(assignment.gpio)) }
                .with_context(|| format!("failed to claim GPIO{} for {}", assignment.gpio, output.as_str()))?;
            let mut relay = Relay {
                pin,
                active_low: assignment.active_low,
            };
            relay.set(false)?;
            info!(
                "{} on GPIO{} (active {})",
                output.as_str(),
                assignment.gpio,
                if assignment.active_low { "low" } else { "high" }
            );
            relays.insert(output, relay);
        }
        Ok(Self { relays })
    }

    fn set(&mut self, output: Output, on: bool) -> anyhow::Result<()> {
        let relay = self
            .relays
            .get_mut(&output)
            .ok_or_else(|| anyhow!("no relay configured for {}", output.as_str()))?;
        relay.set(on)
    }
}

impl Relay {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        if on != self.active_low {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}

impl LevelSensor {
    fn new(pins: &PinConfig) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input(AnyIOPin::new(pins.level_sensor)) }
            .with_context(|| format!("failed to claim GPIO{} for level sensor", pins.level_sensor))?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            pin,
            full_when_low: pins.level_full_when_low,
        })
    }

    fn is_full(&self) -> bool {
        self.pin.is_low() == self.full_when_low
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = network.wifi_ssid.trim();
    if ssid.is_empty() || ssid == "CHANGE_ME" {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.stop();
    Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"))
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("aquarium-controller"),
        username: (!network.mqtt_user.is_empty()).then_some(network.mqtt_user.as_str()),
        password: (!network.mqtt_pass.is_empty()).then_some(network.mqtt_pass.as_str()),
        lwt: Some(LastWill {
            topic: TOPIC_CONTROLLER_STATUS,
            payload: b"offline",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Mqtt) -> anyhow::Result<()> {
    let settings_filter = format!("{TOPIC_CMD_SETTINGS_PREFIX}+");
    let topics = [
        TOPIC_CMD_TPA_START,
        TOPIC_CMD_TPA_SCHEDULE,
        TOPIC_CMD_BUFFER_START,
        TOPIC_CMD_ALERT_RESET,
        TOPIC_CMD_INPUT,
        settings_filter.as_str(),
    ];

    let mut mqtt = lock(mqtt);
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    mqtt.enqueue(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, b"online")?;
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Some(mqtt) = &state.mqtt {
                            if let Err(err) = subscribe_topics(mqtt) {
                                warn!("mqtt subscribe failed: {err:#}");
                            }
                        }
                        let actions = {
                            let mut engine = lock(&state.engine);
                            engine.set_cloud_connected(true);
                            engine.sync_actions()
                        };
                        execute_engine_actions(&state, actions);
                    }
                    EventPayload::Disconnected => {
                        if state.mqtt_connected.swap(false, Ordering::Relaxed) {
                            warn!("mqtt link lost, local schedule armed");
                        }
                        lock(&state.engine).set_cloud_connected(false);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Ok(message) = core::str::from_utf8(data) {
                            if let Err(err) = handle_mqtt_message(&state, topic, message.trim()) {
                                warn!("mqtt message handling failed: {err:#}");
                            }
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    lock(&state.engine).set_cloud_connected(false);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();
    let is_press = matches!(message, "1" | "on" | "ON" | "true" | "");

    let actions = match topic {
        TOPIC_CMD_TPA_START if is_press => {
            lock(&state.engine).trigger_cycle(TriggerSource::Manual, now_ms).1
        }
        TOPIC_CMD_TPA_SCHEDULE if is_press => {
            lock(&state.engine).trigger_cycle(TriggerSource::Cloud, now_ms).1
        }
        TOPIC_CMD_BUFFER_START if is_press => lock(&state.engine).trigger_buffer_dosing(now_ms).1,
        TOPIC_CMD_ALERT_RESET if is_press => lock(&state.engine).reset_alerts(),
        TOPIC_CMD_INPUT => {
            let event = message.parse::<InputEvent>().map_err(anyhow::Error::msg)?;
            dispatch_input(state, event)
        }
        other => match SettingField::from_topic(other) {
            Some(field) => {
                let update = SettingUpdate::parse(field, message)?;
                lock(&state.engine).apply_setting(update).1
            }
            None => Vec::new(),
        },
    };

    execute_engine_actions(state, actions);
    Ok(())
}

fn dispatch_input(state: &SharedState, event: InputEvent) -> Vec<TpaAction> {
    let response = {
        let mut engine = lock(&state.engine);
        lock(&state.ui).handle(event, &mut engine)
    };

    match response.request {
        Some(PeripheralRequest::ResetSensorMinMax) => info!("sensor min/max reset requested"),
        Some(PeripheralRequest::ResetRtcAlert) => info!("RTC alert reset requested"),
        Some(PeripheralRequest::StartPhCalibration) => {
            warn!("pH calibration requested but no probe is wired")
        }
        None => {}
    }
    response.actions
}

fn spawn_control_loop(
    state: SharedState,
    nvs_store: NvsStore,
    level_sensor: LevelSensor,
    debounce_ms: u64,
    publish_interval_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_state_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                let timezone = lock(&state.timezone).clone();
                let now_in_tz = now_in_timezone(&timezone);
                state
                    .time_synced
                    .store(now_in_tz.is_some(), Ordering::Relaxed);

                let (actions, dirty) = {
                    let mut engine = lock(&state.engine);
                    engine.update_level_sensor(level_sensor.is_full());
                    let actions = engine.tick(now_ms, now_in_tz);
                    (actions, engine.take_config_dirty())
                };

                execute_engine_actions(&state, actions);
                if dirty {
                    queue_settings_save(&state, now_ms, debounce_ms);
                }
                flush_pending_settings_save(&nvs_store, &state, now_ms);

                if now_ms.saturating_sub(last_state_publish_ms) >= publish_interval_ms {
                    last_state_publish_ms = now_ms;
                    if let Err(err) = publish_state(&state) {
                        warn!("state publish failed: {err:#}");
                    }
                }

                thread::sleep(Duration::from_millis(CONTROL_LOOP_INTERVAL_MS));
            }
        })?;
    Ok(())
}

fn publish_state(state: &SharedState) -> anyhow::Result<()> {
    let Some(mqtt) = state.mqtt.as_ref() else {
        return Ok(());
    };
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return Ok(());
    }

    let payload = serde_json::to_vec(&lock(&state.engine).state_payload())?;
    lock(mqtt).enqueue(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn execute_engine_actions(state: &SharedState, actions: Vec<TpaAction>) {
    let mqtt = state
        .mqtt
        .as_ref()
        .filter(|_| state.mqtt_connected.load(Ordering::Relaxed));

    for action in actions {
        match action {
            TpaAction::SetOutput { output, on } => {
                if let Err(err) = lock(&state.relays).set(output, on) {
                    error!("failed to drive {}: {err:#}", output.as_str());
                } else {
                    info!("{} {}", output.as_str(), if on { "ON" } else { "OFF" });
                }
            }
            TpaAction::Publish { channel, value } => {
                if let Some(mqtt) = mqtt {
                    let payload = value.to_payload();
                    if let Err(err) =
                        lock(mqtt).enqueue(channel.topic(), QoS::AtMostOnce, true, payload.as_bytes())
                    {
                        warn!("telemetry publish to {} failed: {err:?}", channel.topic());
                    }
                }
            }
            TpaAction::Log { level, message } => {
                match level {
                    LogLevel::Info | LogLevel::Success => info!("{message}"),
                    LogLevel::Warning => warn!("{message}"),
                    LogLevel::Error | LogLevel::Critical => error!("{message}"),
                }
                if let Some(mqtt) = mqtt {
                    let body = EventBody {
                        level: level.as_str(),
                        message: &message,
                    };
                    match serde_json::to_vec(&body) {
                        Ok(payload) => {
                            if let Err(err) = lock(mqtt).enqueue(
                                TOPIC_CONTROLLER_EVENT,
                                QoS::AtMostOnce,
                                false,
                                &payload,
                            ) {
                                warn!("event publish failed: {err:?}");
                            }
                        }
                        Err(err) => warn!("event serialization failed: {err}"),
                    }
                }
            }
        }
    }
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/tpa/start", Method::Post, move |req| {
            let (result, actions) =
                lock(&state.engine).trigger_cycle(TriggerSource::Manual, monotonic_ms());
            execute_engine_actions(&state, actions);
            match result {
                Ok(()) => write_json(req, &build_status(&state)),
                Err(refusal) => write_refusal(req, refusal),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/tpa/buffer", Method::Post, move |req| {
            let (result, actions) = lock(&state.engine).trigger_buffer_dosing(monotonic_ms());
            execute_engine_actions(&state, actions);
            match result {
                Ok(()) => write_json(req, &build_status(&state)),
                Err(refusal) => write_refusal(req, refusal),
            }
        })?;
    }

    for field in SettingField::ALL {
        let state = state.clone();
        let uri = format!("/api/settings/{}", field.as_str());
        server.fn_handler(&uri, Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(value) = query_param(&uri, "value") else {
                return write_error(req, 400, "Missing 'value' parameter");
            };
            match SettingUpdate::parse(field, &value) {
                Ok(update) => apply_setting_and_respond(&state, req, update),
                Err(err) => write_error(req, 400, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/service", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let update = query_param(&uri, "value")
                .and_then(|value| SettingUpdate::parse(SettingField::ServiceMode, &value).ok());
            let Some(update) = update else {
                return write_error(req, 400, "Invalid value. Use 'on' or 'off'");
            };
            apply_setting_and_respond(&state, req, update)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/alerts/reset", Method::Post, move |req| {
            let actions = lock(&state.engine).reset_alerts();
            execute_engine_actions(&state, actions);
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/input", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(raw) = query_param(&uri, "event") else {
                return write_error(req, 400, "Missing 'event' parameter");
            };
            let event = match raw.parse::<InputEvent>() {
                Ok(event) => event,
                Err(message) => return write_error(req, 400, &message),
            };
            let actions = dispatch_input(&state, event);
            execute_engine_actions(&state, actions);
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            write_json(req, &build_time_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/timezone", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<TimezoneUpdate>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };
            if update.timezone.parse::<Tz>().is_err() {
                return write_error(req, 400, "Invalid timezone value");
            }

            *lock(&state.timezone) = update.timezone;
            if let Err(err) = persist_runtime_from_state(&nvs_store, &state) {
                warn!("failed to persist timezone update: {err:#}");
                return write_error(req, 500, "Failed to persist runtime settings");
            }
            write_json(req, &build_time_status(&state))
        })?;
    }

    Ok(server)
}

fn apply_setting_and_respond(
    state: &SharedState,
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    update: SettingUpdate,
) -> anyhow::Result<()> {
    let (result, actions) = lock(&state.engine).apply_setting(update);
    execute_engine_actions(state, actions);
    match result {
        Ok(_) => write_json(req, &build_status(state)),
        Err(err) => write_error(req, 400, &err.to_string()),
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_refusal(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    refusal: StartRefusal,
) -> anyhow::Result<()> {
    let status = match refusal {
        StartRefusal::ZeroDuration => 400,
        StartRefusal::ServiceMode | StartRefusal::Busy(_) => 409,
    };
    write_error(req, status, &refusal.to_string())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.replace('+', " "))
    })
}

fn build_status(state: &SharedState) -> aquarium_common::ControllerStatus {
    let timezone = lock(&state.timezone).clone();
    let now = now_in_timezone(&timezone);
    let time_synced = state.time_synced.load(Ordering::Relaxed);
    lock(&state.engine).status(now, time_synced, &timezone)
}

fn build_time_status(state: &SharedState) -> TimeStatus {
    TimeStatus {
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone: lock(&state.timezone).clone(),
        now_epoch: Utc::now().timestamp(),
    }
}

fn persist_runtime_from_state(nvs_store: &NvsStore, state: &SharedState) -> anyhow::Result<()> {
    let settings = lock(&state.engine).settings().clone();
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
    runtime.settings = settings;
    runtime.timezone = lock(&state.timezone).clone();
    nvs_store.save_runtime_config(&runtime)?;
    info!("settings saved to NVS");
    Ok(())
}

fn queue_settings_save(state: &SharedState, now_ms: u64, debounce_ms: u64) {
    *lock(&state.settings_save_deadline_ms) = Some(now_ms.saturating_add(debounce_ms.max(250)));
}

fn flush_pending_settings_save(nvs_store: &NvsStore, state: &SharedState, now_ms: u64) {
    let due = {
        let mut deadline = lock(&state.settings_save_deadline_ms);
        match *deadline {
            Some(due_ms) if now_ms >= due_ms => {
                *deadline = None;
                true
            }
            _ => false,
        }
    };

    if due {
        if let Err(err) = persist_runtime_from_state(nvs_store, state) {
            warn!("failed to persist debounced settings: {err:#}");
            queue_settings_save(state, now_ms, SETTINGS_SAVE_RETRY_MS);
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let utc = Utc::now();
    if utc.year() < MIN_VALID_YEAR {
        return None;
    }
    let tz: Tz = timezone.parse().ok()?;
    let local = utc.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
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
