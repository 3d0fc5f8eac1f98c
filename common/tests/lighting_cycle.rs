use chrono::{DateTime, Duration, TimeZone, Utc};
use circadian_common::{
    recovery, ApiKey, CredentialStore, CycleInput, EngineAction, LightOutput, LightingConfig,
    LightingEngine, OperatingMode, RawInputs, RefreshOutcome, RefreshReason, RemoteError,
    ScheduleStore, SensorDebouncers, TelemetryEventKind,
};
use serde_json::json;

const CYCLE_MS: u64 = 50;

#[derive(Default)]
struct FlashSlot {
    value: Option<String>,
}

impl CredentialStore for FlashSlot {
    type Error = String;

    fn load(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.value.clone())
    }

    fn save(&mut self, key: &ApiKey) -> Result<(), Self::Error> {
        self.value = Some(key.as_str().to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.value = None;
        Ok(())
    }
}

/// Drives the real debouncers and engine on a simulated 50 ms loop.
struct Rig {
    engine: LightingEngine,
    sensors: SensorDebouncers,
    store: ScheduleStore,
    now_ms: u64,
    wall: DateTime<Utc>,
    inputs: RawInputs,
}

impl Rig {
    fn new() -> Self {
        let config = LightingConfig::default();
        Self {
            sensors: SensorDebouncers::new(&config),
            store: ScheduleStore::new(config.default_color_temp_k),
            engine: LightingEngine::new(config),
            now_ms: 0,
            wall: Utc.with_ymd_and_hms(2026, 4, 20, 13, 0, 0).unwrap(),
            inputs: RawInputs {
                dial_raw: 4_095,
                ..RawInputs::default()
            },
        }
    }

    fn step(&mut self) -> Vec<EngineAction> {
        let sensors = self.sensors.sample(self.inputs, self.now_ms);
        let input = CycleInput {
            now_ms: self.now_ms,
            now: self.wall,
            sensors,
        };
        let actions = self.engine.tick(&input, &self.store);
        self.now_ms += CYCLE_MS;
        self.wall += Duration::milliseconds(CYCLE_MS as i64);
        actions
    }

    fn run(&mut self, cycles: usize) -> Vec<EngineAction> {
        (0..cycles).flat_map(|_| self.step()).collect()
    }

    fn load(&mut self, night_mode: bool) -> RefreshOutcome {
        let body = serde_json::to_vec(&json!({
            "profile_id": 4,
            "sleep_start_utc_seconds": 79_200,
            "sleep_end_utc_seconds": 25_200,
            "min_color_temp": 1_900,
            "max_color_temp": 6_500,
            "night_mode_enabled": night_mode,
            "motion_timeout_seconds": 30,
            "generated_at": "2026-04-20T00:00:00Z",
            "valid_until": "2026-04-21T00:00:00Z",
            "schedule": [
                { "utc": "2026-04-20T06:00:00Z", "temp": 6_500 },
                { "utc": "2026-04-20T20:00:00Z", "temp": 2_500 },
            ],
        }))
        .unwrap();
        self.engine.apply_fetch(&mut self.store, Ok(body))
    }
}

fn telemetry_kinds(actions: &[EngineAction]) -> Vec<TelemetryEventKind> {
    actions
        .iter()
        .filter_map(|action| match action {
            EngineAction::Telemetry(payload) => Some(payload.event_type),
            _ => None,
        })
        .collect()
}

fn last_render(actions: &[EngineAction]) -> Option<LightOutput> {
    actions.iter().rev().find_map(|action| match action {
        EngineAction::Render(output) => Some(*output),
        _ => None,
    })
}

#[test]
fn startup_requests_schedule_and_stays_dark() {
    let mut rig = Rig::new();

    let actions = rig.step();

    assert!(actions.contains(&EngineAction::RefreshSchedule(RefreshReason::Startup)));
    assert_eq!(last_render(&actions), Some(LightOutput::Off));
}

#[test]
fn motion_burst_lights_up_then_times_out() {
    let mut rig = Rig::new();
    rig.step();
    assert_eq!(
        rig.load(false),
        RefreshOutcome::Loaded {
            profile_id: 4,
            points: 2
        }
    );

    rig.inputs.motion = true;
    let actions = rig.run(4);
    assert_eq!(telemetry_kinds(&actions), vec![TelemetryEventKind::MotionDetected]);
    assert!(rig.engine.state().light_on);
    // 13:00 sits halfway through the 06:00 -> 20:00 ramp.
    assert_eq!(rig.engine.state().color_temp_k, 4_500);
    assert_eq!(rig.engine.state().brightness_pct, 100);

    rig.inputs.motion = false;
    let actions = rig.run(30_000 / CYCLE_MS as usize + 10);
    assert_eq!(telemetry_kinds(&actions), vec![TelemetryEventKind::MotionTimeout]);
    assert_eq!(last_render(&actions), Some(LightOutput::Off));
}

#[test]
fn night_mode_forces_minimum_temperature() {
    let mut rig = Rig::new();
    rig.wall = Utc.with_ymd_and_hms(2026, 4, 20, 23, 30, 0).unwrap();
    rig.step();
    rig.load(true);

    rig.inputs.motion = true;
    rig.run(4);

    assert_eq!(rig.engine.state().color_temp_k, 1_900);
}

#[test]
fn held_button_toggles_mode_once() {
    let mut rig = Rig::new();
    rig.step();

    rig.inputs.button_down = true;
    let actions = rig.run(20);
    rig.inputs.button_down = false;
    rig.run(2);

    assert_eq!(rig.engine.mode(), OperatingMode::Manual);
    assert_eq!(telemetry_kinds(&actions), vec![TelemetryEventKind::ModeChange]);
    assert_eq!(
        last_render(&actions),
        Some(LightOutput::new(true, 100, 3_500))
    );

    rig.inputs.button_down = true;
    rig.run(1);
    assert_eq!(rig.engine.mode(), OperatingMode::Automatic);
    assert!(!rig.engine.state().light_on);
}

#[test]
fn unauthorized_leads_to_recovery_and_credential_restart() {
    let mut rig = Rig::new();
    rig.step();

    assert_eq!(
        rig.engine
            .apply_fetch(&mut rig.store, Err(RemoteError::Unauthorized)),
        RefreshOutcome::Unauthorized
    );
    assert_eq!(rig.engine.mode(), OperatingMode::Recovery);

    // Sensors no longer matter.
    rig.inputs.button_down = true;
    rig.inputs.motion = true;
    let actions = rig.run(10);
    assert!(telemetry_kinds(&actions).is_empty());
    assert_eq!(
        last_render(&actions),
        Some(LightOutput::new(true, 50, 1_000))
    );

    let mut slot = FlashSlot::default();
    let rejected = recovery::handle_save(rig.engine.mode(), "apikey=abc", &mut slot);
    assert_eq!(rejected.status, 400);
    assert!(!rejected.restart);
    assert_eq!(slot.value, None);
    assert_eq!(rig.engine.mode(), OperatingMode::Recovery);

    let key = "k".repeat(64);
    let accepted = recovery::handle_save(rig.engine.mode(), &format!("apikey={key}"), &mut slot);
    assert_eq!(accepted.status, 200);
    assert!(accepted.restart);
    assert_eq!(slot.value, Some(key));
}

#[test]
fn forward_time_set_turns_light_off_and_refetches() {
    let mut rig = Rig::new();
    rig.step();
    rig.load(false);

    rig.inputs.motion = true;
    rig.run(4);
    rig.inputs.motion = false;
    rig.run(4);
    assert!(rig.engine.state().light_on);

    rig.wall += Duration::hours(2);
    let actions = rig.step();

    assert!(!rig.engine.state().light_on);
    assert!(actions.contains(&EngineAction::RefreshSchedule(RefreshReason::ClockJump)));
}
