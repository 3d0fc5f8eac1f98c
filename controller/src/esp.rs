use core::convert::TryInto;
use std::{
    io::BufRead,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{ADCPin, AnyIOPin, AnyOutputPin, Input, PinDriver, Pins, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals, rmt::RMT},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use circadian_common::{
    config::{ApiConfig, HardwareConfig, NetworkConfig},
    console::{self, ConsoleCommand},
    load_credential, recovery, ApiKey, CredentialStore, CycleInput, DeviceStatus, EngineAction,
    LightOutput, LightingEngine, PortalReply, RawInputs, RefreshOutcome, RefreshReason, RemoteError,
    RuntimeConfig, ScheduleStore, SensorDebouncers, TelemetryPayload, TOPIC_CMD_FETCH,
    TOPIC_DEVICE_SCHEDULE, TOPIC_DEVICE_STATE, TOPIC_DEVICE_TELEMETRY,
};

use crate::led::LedStrip;

const NVS_NAMESPACE: &str = "circadian";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_CREDENTIAL_KEY: &str = "apikey";
const MAX_HTTP_BODY: usize = 4096;
const MAX_SCHEDULE_BODY: usize = 16 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 20;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;
// 2025-01-01T01:00:00Z; anything earlier means SNTP has not answered yet.
const MIN_VALID_EPOCH: i64 = 1_735_693_200;

type DialReader = Box<dyn FnMut() -> anyhow::Result<u16>>;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<LightingEngine>>,
    schedule: Arc<Mutex<ScheduleStore>>,
    led: Arc<Mutex<LedStrip>>,
    timezone: Arc<String>,
    key_fingerprint: Option<String>,
    fetch_requested: Arc<AtomicBool>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct SensorInputs {
    button: Option<PinDriver<'static, AnyIOPin, Input>>,
    motion: Option<PinDriver<'static, AnyIOPin, Input>>,
    dial: Option<DialReader>,
    dial_raw: u16,
}

struct ApiClient {
    config: ApiConfig,
    key: Option<ApiKey>,
}

#[derive(Debug, Serialize)]
struct FetchQueued {
    queued: bool,
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
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, api=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid,
        runtime.api.base_url,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let mut credentials = nvs_store.clone();
    let key = load_credential(&mut credentials, &runtime.api.fallback_key);
    let key_fingerprint = key.as_ref().map(ApiKey::fingerprint);

    let Peripherals {
        modem,
        pins,
        rmt,
        adc1,
        ..
    } = Peripherals::take()?;

    let led = match init_led_strip(rmt, &runtime.hardware) {
        Ok(strip) => {
            info!(
                "LED ring initialized on RMT channel{} / GPIO{} ({} pixels)",
                runtime.hardware.rmt_channel, runtime.hardware.led_pin, runtime.hardware.led_count
            );
            strip
        }
        Err(err) => {
            warn!("failed to initialize LED ring, running dark: {err:#}");
            LedStrip::disabled(runtime.hardware.led_count)
        }
    };
    let mut sensors = SensorInputs::new(adc1, pins, &runtime);

    let (wifi, wifi_connected) =
        connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
            .context("wifi startup failed")?;

    let _sntp = if wifi_connected {
        let sntp = EspSntp::new_default().context("failed to start SNTP")?;
        wait_for_time_sync();
        Some(sntp)
    } else {
        None
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let state = SharedState {
        engine: Arc::new(Mutex::new(LightingEngine::new(runtime.lighting.clone()))),
        schedule: Arc::new(Mutex::new(ScheduleStore::new(
            runtime.lighting.default_color_temp_k,
        ))),
        led: Arc::new(Mutex::new(led)),
        timezone: Arc::new(runtime.timezone.clone()),
        key_fingerprint,
        fetch_requested: Arc::new(AtomicBool::new(false)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let mqtt = if wifi_connected && runtime.network.mqtt_enabled() {
        match create_mqtt_client(&runtime.network) {
            Ok((client, conn)) => {
                let client = Arc::new(Mutex::new(client));
                subscribe_topics(&client)?;
                spawn_mqtt_receiver(state.clone(), conn, client.clone());
                Some(client)
            }
            Err(err) => {
                warn!("mqtt client unavailable: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let server = create_http_server(state.clone(), nvs_store.clone())?;

    let (console_tx, console_rx) = mpsc::channel();
    spawn_console(console_tx);

    let api = ApiClient {
        config: runtime.api.clone(),
        key,
    };

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    add_current_task_to_watchdog()?;
    let period = Duration::from_millis(runtime.lighting.cycle_period_ms);
    let mut debouncers = SensorDebouncers::new(&runtime.lighting);
    let mut last_state_publish_ms = 0_u64;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let input = CycleInput {
            now_ms,
            now: Utc::now(),
            sensors: debouncers.sample(sensors.read(), now_ms),
        };

        let actions = {
            let mut engine = lock(&state.engine);
            let schedule = lock(&state.schedule);
            engine.tick(&input, &schedule)
        };
        execute_engine_actions(&state, &api, mqtt.as_ref(), actions);

        if state.fetch_requested.swap(false, Ordering::Relaxed) {
            if lock(&state.engine).in_recovery() {
                warn!("dropping queued fetch, device is in recovery");
            } else {
                refresh_schedule(&state, &api, RefreshReason::Manual);
            }
        }

        while let Ok(command) = console_rx.try_recv() {
            handle_console_command(&state, &api, &nvs_store, command);
        }

        if let Some(client) = &mqtt {
            if now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_INTERVAL_MS {
                last_state_publish_ms = now_ms;
                if let Err(err) = publish_state(&state, client) {
                    warn!("state publish failed: {err:#}");
                }
            }
        }

        thread::sleep(period);
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

    if runtime.api.fallback_key.is_empty() {
        if let Some(key) = option_env!("API_KEY") {
            runtime.api.fallback_key = key.to_string();
        }
    }
}

fn execute_engine_actions(
    state: &SharedState,
    api: &ApiClient,
    mqtt: Option<&Arc<Mutex<EspMqttClient<'static>>>>,
    actions: Vec<EngineAction>,
) {
    for action in actions {
        match action {
            EngineAction::Render(output) => render(state, &output),
            EngineAction::Telemetry(payload) => send_telemetry(state, api, mqtt, &payload),
            EngineAction::RefreshSchedule(reason) => {
                refresh_schedule(state, api, reason);
            }
        }

        // A 401 mid-cycle voids the rest of the batch; show the cue instead.
        let cue = {
            let engine = lock(&state.engine);
            engine.in_recovery().then(|| engine.light_output())
        };
        if let Some(cue) = cue {
            render(state, &cue);
            return;
        }
    }
}

fn render(state: &SharedState, output: &LightOutput) {
    if let Err(err) = lock(&state.led).render(output) {
        warn!("LED render failed: {err:#}");
    }
}

fn send_telemetry(
    state: &SharedState,
    api: &ApiClient,
    mqtt: Option<&Arc<Mutex<EspMqttClient<'static>>>>,
    payload: &TelemetryPayload,
) {
    info!("sending telemetry {}", payload.event_type.as_str());

    if let Some(mqtt) = mqtt {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                if let Err(err) =
                    lock(mqtt).publish(TOPIC_DEVICE_TELEMETRY, QoS::AtMostOnce, false, &body)
                {
                    warn!("telemetry mirror publish failed: {err:?}");
                }
            }
            Err(err) => warn!("telemetry serialization failed: {err}"),
        }
    }

    let result = api.send_telemetry(payload);
    lock(&state.engine).apply_telemetry_result(result);
}

fn refresh_schedule(state: &SharedState, api: &ApiClient, reason: RefreshReason) -> RefreshOutcome {
    info!("fetching schedule ({})", reason.as_str());
    let result = api.fetch_schedule();

    let mut engine = lock(&state.engine);
    let mut schedule = lock(&state.schedule);
    engine.apply_fetch(&mut schedule, result)
}

fn handle_console_command(
    state: &SharedState,
    api: &ApiClient,
    nvs_store: &NvsStore,
    command: ConsoleCommand,
) {
    match command {
        ConsoleCommand::Status => println!("{}", console::render_status(&build_status(state))),
        ConsoleCommand::Fetch => {
            if lock(&state.engine).in_recovery() {
                println!("[ERROR] device is in recovery mode; update the API key first");
                return;
            }
            let outcome = refresh_schedule(state, api, RefreshReason::Manual);
            println!("fetch finished: {outcome:?}");
        }
        ConsoleCommand::ResetKey => {
            let mut credentials = nvs_store.clone();
            match credentials.clear() {
                Ok(()) => {
                    println!("API Key cleared from NVS. Rebooting...");
                    schedule_restart("credential cleared from console");
                }
                Err(err) => println!("[ERROR] failed to clear API key: {err:#}"),
            }
        }
        ConsoleCommand::SetTime(at) => match set_system_time(at) {
            Ok(()) => println!("[Time] Set to: {at}"),
            Err(err) => println!("[ERROR] {err:#}"),
        },
    }
}

fn build_status(state: &SharedState) -> DeviceStatus {
    let now = Utc::now();
    let engine = lock(&state.engine);
    let schedule = lock(&state.schedule);
    engine.status(
        &schedule,
        now,
        state.key_fingerprint.clone(),
        local_time(&state.timezone, now),
    )
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

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let page = recovery::status_page(&build_status(&state));
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = String::from_utf8_lossy(&body);
            let mode = lock(&state.engine).mode();

            let mut credentials = nvs_store.clone();
            let reply = recovery::handle_save(mode, &form, &mut credentials);
            write_reply(req, &reply)?;

            if reply.restart {
                schedule_restart("credential replaced");
            }
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedule", Method::Get, move |req| {
            let schedule = lock(&state.schedule).schedule().clone();
            write_json(req, &schedule)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/led", Method::Get, move |req| {
            let diagnostics = lock(&state.led).diagnostics();
            write_json(req, &diagnostics)
        })?;
    }

    server.fn_handler("/api/fetch", Method::Post, move |req| {
        if lock(&state.engine).in_recovery() {
            return write_error(req, 409, "Device is in recovery mode");
        }
        state.fetch_requested.store(true, Ordering::Relaxed);
        write_json(req, &FetchQueued { queued: true })
    })?;

    Ok(server)
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
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_reply(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: &PortalReply,
) -> anyhow::Result<()> {
    req.into_response(reply.status, None, &[("Content-Type", reply.content_type)])?
        .write_all(reply.body.as_bytes())?;
    Ok(())
}

fn init_led_strip(rmt: RMT, hardware: &HardwareConfig) -> anyhow::Result<LedStrip> {
    let pin = hardware.led_pin;
    let count = hardware.led_count;

    match hardware.rmt_channel {
        0 => unsafe { LedStrip::new(rmt.channel0, AnyOutputPin::new(pin), count) },
        1 => unsafe { LedStrip::new(rmt.channel1, AnyOutputPin::new(pin), count) },
        2 => unsafe { LedStrip::new(rmt.channel2, AnyOutputPin::new(pin), count) },
        3 => unsafe { LedStrip::new(rmt.channel3, AnyOutputPin::new(pin), count) },
        channel => Err(anyhow!("unsupported RMT channel: {channel}")),
    }
}

impl SensorInputs {
    fn new(adc: ADC1, pins: Pins, runtime: &RuntimeConfig) -> Self {
        let hardware = &runtime.hardware;

        let button = input_pin(hardware.button_pin, Pull::Up)
            .inspect_err(|err| warn!("button unavailable on GPIO{}: {err:#}", hardware.button_pin))
            .ok();
        let motion = input_pin(hardware.motion_pin, Pull::Down)
            .inspect_err(|err| warn!("PIR unavailable on GPIO{}: {err:#}", hardware.motion_pin))
            .ok();
        let dial = init_dial(adc, pins, hardware.dial_pin)
            .inspect_err(|err| warn!("dial unavailable on GPIO{}: {err:#}", hardware.dial_pin))
            .ok();

        Self {
            button,
            motion,
            dial,
            // Without a dial the light runs at full brightness.
            dial_raw: runtime.lighting.dial_max_raw,
        }
    }

    fn read(&mut self) -> RawInputs {
        if let Some(dial) = self.dial.as_mut() {
            match dial() {
                Ok(raw) => self.dial_raw = raw,
                Err(err) => debug!("dial read failed: {err:#}"),
            }
        }

        RawInputs {
            // Active low with the internal pull-up.
            button_down: self.button.as_ref().is_some_and(|pin| pin.is_low()),
            motion: self.motion.as_ref().is_some_and(|pin| pin.is_high()),
            dial_raw: self.dial_raw,
        }
    }
}

fn input_pin(pin: i32, pull: Pull) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    if pin < 0 {
        return Err(anyhow!("invalid pin: {pin}"));
    }
    let mut driver = PinDriver::input(unsafe { AnyIOPin::new(pin) })?;
    driver.set_pull(pull)?;
    Ok(driver)
}

fn init_dial(adc: ADC1, pins: Pins, pin: i32) -> anyhow::Result<DialReader> {
    match pin {
        0 => dial_reader(adc, pins.gpio0),
        1 => dial_reader(adc, pins.gpio1),
        2 => dial_reader(adc, pins.gpio2),
        3 => dial_reader(adc, pins.gpio3),
        4 => dial_reader(adc, pins.gpio4),
        _ => Err(anyhow!("GPIO{pin} is not an ADC1 input")),
    }
}

fn dial_reader<P>(adc: ADC1, pin: P) -> anyhow::Result<DialReader>
where
    P: ADCPin<Adc = ADC1> + 'static,
{
    let config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut channel = AdcChannelDriver::new(AdcDriver::new(adc)?, pin, &config)?;
    Ok(Box::new(move || -> anyhow::Result<u16> {
        Ok(channel.read_raw()?)
    }))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<(EspWifi<'static>, bool)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing; running in offline mode");
        return Ok((esp_wifi, false));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok((esp_wifi, true));
            }
            Err(err) => {
                debug!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    warn!("could not connect to wifi; running in offline mode");
    Ok((esp_wifi, false))
}

fn wait_for_time_sync() {
    info!("synchronizing with NTP server");
    for _ in 0..WIFI_CONNECT_ATTEMPTS {
        if Utc::now().timestamp() >= MIN_VALID_EPOCH {
            info!("time synchronized, current UTC {}", Utc::now());
            return;
        }
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }
    warn!("could not sync time; clock continuity will catch the late update");
}

fn set_system_time(at: DateTime<Utc>) -> anyhow::Result<()> {
    let tv = esp_idf_svc::sys::timeval {
        tv_sec: at.timestamp() as _,
        tv_usec: 0,
    };
    let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
    if rc == 0 {
        return Ok(());
    }
    Err(anyhow!("settimeofday failed with code {rc}"))
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("circadian-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    lock(mqtt).subscribe(TOPIC_CMD_FETCH, QoS::AtMostOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    state.mqtt_connected.store(true, Ordering::Relaxed);

                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };

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

                    if topic == TOPIC_CMD_FETCH {
                        if lock(&state.engine).in_recovery() {
                            warn!("ignoring fetch command while in recovery");
                        } else {
                            state.fetch_requested.store(true, Ordering::Relaxed);
                        }
                    }
                }
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return Ok(());
    }

    let payload = serde_json::to_vec(&lock(&state.engine).state_payload())?;
    let schedule = serde_json::to_vec(lock(&state.schedule).schedule())?;

    let mut client = lock(mqtt);
    client.publish(TOPIC_DEVICE_STATE, QoS::AtLeastOnce, true, &payload)?;
    client.publish(TOPIC_DEVICE_SCHEDULE, QoS::AtLeastOnce, true, &schedule)?;
    Ok(())
}

fn spawn_console(commands: Sender<ConsoleCommand>) {
    let spawned = thread::Builder::new()
        .name("console".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            println!("{}", console::HELP);
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => thread::sleep(Duration::from_millis(100)),
                    Ok(_) => match ConsoleCommand::parse(&line) {
                        Ok(Some(command)) => {
                            if commands.send(command).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => println!("[ERROR] {err}. {}", console::HELP),
                    },
                    Err(_) => thread::sleep(Duration::from_millis(100)),
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn console thread: {err}");
    }
}

fn schedule_restart(reason: &'static str) {
    info!("restarting in {} ms: {reason}", recovery::RESTART_DELAY_MS);
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(recovery::RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });

    if let Err(err) = spawned {
        warn!("failed to spawn restart thread, restarting now: {err}");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

impl ApiClient {
    fn connect(&self) -> Result<HttpClient<EspHttpConnection>, RemoteError> {
        if !is_wifi_station_connected() {
            return Err(RemoteError::Offline);
        }

        let conf = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        EspHttpConnection::new(&conf)
            .map(HttpClient::wrap)
            .map_err(transport_error)
    }

    fn fetch_schedule(&self) -> Result<Vec<u8>, RemoteError> {
        let url = self.config.schedule_url();
        let mut headers = vec![("Accept", "application/json")];
        if let Some(key) = &self.key {
            headers.push((self.config.key_header.as_str(), key.as_str()));
        }

        let mut client = self.connect()?;
        let request = client
            .request(Method::Get, &url, &headers)
            .map_err(transport_error)?;
        let mut response = request.submit().map_err(transport_error)?;
        classify_status(response.status())?;

        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_SCHEDULE_BODY {
                return Err(RemoteError::Transport(format!(
                    "schedule body exceeds {MAX_SCHEDULE_BODY} bytes"
                )));
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(body)
    }

    fn send_telemetry(&self, payload: &TelemetryPayload) -> Result<(), RemoteError> {
        let body =
            serde_json::to_vec(payload).map_err(|err| RemoteError::Transport(err.to_string()))?;
        let url = self.config.telemetry_url();
        let content_length = body.len().to_string();
        let mut headers = vec![
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        if let Some(key) = &self.key {
            headers.push((self.config.key_header.as_str(), key.as_str()));
        }

        let mut client = self.connect()?;
        let mut request = client
            .request(Method::Post, &url, &headers)
            .map_err(transport_error)?;
        request.write_all(&body).map_err(transport_error)?;
        request.flush().map_err(transport_error)?;
        let response = request.submit().map_err(transport_error)?;
        classify_status(response.status())
    }
}

fn classify_status(status: u16) -> Result<(), RemoteError> {
    match status {
        401 => Err(RemoteError::Unauthorized),
        200..=299 => Ok(()),
        other => Err(RemoteError::Status(other)),
    }
}

fn transport_error<E: core::fmt::Debug>(err: E) -> RemoteError {
    RemoteError::Transport(format!("{err:?}"))
}

impl CredentialStore for NvsStore {
    type Error = anyhow::Error;

    fn load(&mut self) -> anyhow::Result<Option<String>> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 128];
        Ok(nvs
            .get_str(NVS_CREDENTIAL_KEY, &mut buffer)?
            .map(str::to_string))
    }

    fn save(&mut self, key: &ApiKey) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(NVS_CREDENTIAL_KEY, key.as_str())?;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.remove(NVS_CREDENTIAL_KEY)?;
        Ok(())
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
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

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn local_time(timezone: &str, now: DateTime<Utc>) -> Option<String> {
    let tz: Tz = timezone.parse().ok()?;
    Some(
        now.with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string(),
    )
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
