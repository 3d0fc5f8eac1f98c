use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    clock::{motion_expired, ClockMonitor},
    color::{kelvin_to_rgb, Rgb},
    config::LightingConfig,
    debounce::SensorFrame,
    error::RemoteError,
    schedule::ScheduleStore,
    telemetry::{LightSnapshot, TelemetryEmitter, TelemetryEventKind, TelemetryPayload},
    types::{DeviceStatePayload, DeviceStatus, OperatingMode},
};

const PWM_MAX: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Startup,
    Periodic,
    ClockJump,
    Manual,
}

impl RefreshReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Periodic => "periodic",
            Self::ClockJump => "clock_jump",
            Self::Manual => "manual",
        }
    }
}

/// What the LED collaborator should show this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LightOutput {
    Off,
    On {
        #[serde(rename = "brightness")]
        brightness_pct: u8,
        level: u8,
        #[serde(rename = "colorTemp")]
        color_temp_k: u32,
        rgb: Rgb,
    },
}

impl LightOutput {
    pub fn new(light_on: bool, brightness_pct: u8, color_temp_k: u32) -> Self {
        if !light_on {
            return Self::Off;
        }
        let brightness_pct = brightness_pct.min(100);
        Self::On {
            brightness_pct,
            level: (u32::from(brightness_pct) * PWM_MAX / 100) as u8,
            color_temp_k,
            rgb: kelvin_to_rgb(color_temp_k),
        }
    }

    /// Per-pixel color with brightness folded in, for strips without a global level.
    pub fn pixel(&self) -> Rgb {
        match *self {
            Self::Off => Rgb::BLACK,
            Self::On { level, rgb, .. } => rgb.scaled(level),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    Render(LightOutput),
    Telemetry(TelemetryPayload),
    RefreshSchedule(RefreshReason),
}

#[derive(Debug, Clone)]
pub struct CycleInput {
    pub now_ms: u64,
    pub now: DateTime<Utc>,
    pub sensors: SensorFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Loaded { profile_id: i64, points: usize },
    Rejected(String),
    Failed(RemoteError),
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub mode: OperatingMode,
    pub light_on: bool,
    pub brightness_pct: u8,
    pub color_temp_k: u32,
    pub last_motion_ms: Option<u64>,
    pub last_motion_at: Option<DateTime<Utc>>,
    pub schedule_loaded: bool,
    pub stale_warned: bool,
}

#[derive(Debug, Clone)]
pub struct LightingEngine {
    pub config: LightingConfig,
    state: DeviceState,
    clock: ClockMonitor,
    telemetry: TelemetryEmitter,
    last_refresh_ms: Option<u64>,
}

impl LightingEngine {
    pub fn new(mut config: LightingConfig) -> Self {
        config.sanitize();
        Self {
            state: DeviceState {
                mode: OperatingMode::Automatic,
                light_on: false,
                brightness_pct: 0,
                color_temp_k: config.default_color_temp_k,
                last_motion_ms: None,
                last_motion_at: None,
                schedule_loaded: false,
                stale_warned: false,
            },
            clock: ClockMonitor::new(config.time_jump_refetch_threshold_secs),
            telemetry: TelemetryEmitter::new(&config),
            last_refresh_ms: None,
            config,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn mode(&self) -> OperatingMode {
        self.state.mode
    }

    pub fn in_recovery(&self) -> bool {
        self.state.mode == OperatingMode::Recovery
    }

    pub fn last_known_time(&self) -> Option<DateTime<Utc>> {
        self.clock.last_known()
    }

    pub fn light_output(&self) -> LightOutput {
        LightOutput::new(
            self.state.light_on,
            self.state.brightness_pct,
            self.state.color_temp_k,
        )
    }

    /// Runs one control cycle. The returned actions are meant to be executed in order.
    pub fn tick(&mut self, input: &CycleInput, schedule: &ScheduleStore) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if self.in_recovery() {
            actions.push(EngineAction::Render(self.light_output()));
            return actions;
        }

        self.reconcile_clock(input, schedule, &mut actions);
        if input.sensors.button_pressed {
            self.toggle_mode(input.now_ms, &mut actions);
        }
        self.evaluate_motion(input, schedule, &mut actions);
        self.evaluate_dial(input.sensors.dial_percent);
        self.check_periodic_refresh(input.now_ms, &mut actions);

        actions.push(EngineAction::Render(self.light_output()));
        actions
    }

    /// Switches to recovery and shows the attention cue. There is no way back
    /// short of a restart.
    pub fn enter_recovery(&mut self) {
        if self.in_recovery() {
            return;
        }
        warn!("entering recovery mode; the API key must be replaced");
        self.state.mode = OperatingMode::Recovery;
        self.state.light_on = true;
        self.state.color_temp_k = self.config.recovery_color_temp_k;
        self.state.brightness_pct = self.config.recovery_brightness_pct;
    }

    pub fn apply_fetch(
        &mut self,
        store: &mut ScheduleStore,
        result: Result<Vec<u8>, RemoteError>,
    ) -> RefreshOutcome {
        let body = match result {
            Ok(body) => body,
            Err(RemoteError::Unauthorized) => {
                warn!("schedule fetch unauthorized");
                self.enter_recovery();
                return RefreshOutcome::Unauthorized;
            }
            Err(err) => {
                warn!("schedule fetch failed: {err}");
                return RefreshOutcome::Failed(err);
            }
        };

        match store.refresh(&body) {
            Ok(schedule) => {
                info!(
                    "schedule loaded: profile {}, {} points, motion timeout {}s, night mode {}",
                    schedule.profile_id,
                    schedule.points.len(),
                    schedule.motion_timeout_secs,
                    if schedule.night_mode_enabled { "on" } else { "off" },
                );
                self.state.schedule_loaded = true;
                self.state.stale_warned = false;
                RefreshOutcome::Loaded {
                    profile_id: schedule.profile_id,
                    points: schedule.points.len(),
                }
            }
            Err(err) => {
                warn!("schedule rejected, keeping previous: {err}");
                RefreshOutcome::Rejected(err.to_string())
            }
        }
    }

    pub fn apply_telemetry_result(&mut self, result: Result<(), RemoteError>) {
        match result {
            Ok(()) => debug!("telemetry sent"),
            Err(RemoteError::Unauthorized) => {
                warn!("telemetry unauthorized");
                self.enter_recovery();
            }
            Err(err) => warn!("telemetry failed: {err}"),
        }
    }

    pub fn status(
        &self,
        schedule: &ScheduleStore,
        now: DateTime<Utc>,
        key_fingerprint: Option<String>,
        local_time: Option<String>,
    ) -> DeviceStatus {
        let active = schedule.schedule();
        DeviceStatus {
            mode: self.state.mode.as_str(),
            light_on: self.state.light_on,
            brightness: self.state.brightness_pct,
            color_temp_k: self.state.color_temp_k,
            schedule_loaded: self.state.schedule_loaded,
            schedule_stale: self.state.schedule_loaded && schedule.is_stale(now),
            profile_id: active.profile_id,
            point_count: active.points.len(),
            night_mode_enabled: active.night_mode_enabled,
            night_mode_active: schedule.night_mode_active(now),
            telemetry_enabled: self.telemetry.enabled(),
            telemetry_dropped: self.telemetry.dropped(),
            key_fingerprint,
            now_epoch: now.timestamp(),
            local_time,
        }
    }

    pub fn state_payload(&self) -> DeviceStatePayload {
        DeviceStatePayload {
            mode: self.state.mode.as_str(),
            light: self.state.light_on,
            brightness: self.state.brightness_pct,
            color_temp_k: self.state.color_temp_k,
            schedule_loaded: self.state.schedule_loaded,
        }
    }

    fn reconcile_clock(
        &mut self,
        input: &CycleInput,
        schedule: &ScheduleStore,
        actions: &mut Vec<EngineAction>,
    ) {
        let timeout_secs = schedule.motion_timeout_secs();
        let event = self.clock.observe(input.now, timeout_secs);
        if !event.is_discontinuity() {
            return;
        }

        if self.state.mode == OperatingMode::Automatic
            && self.state.light_on
            && motion_expired(input.now, self.state.last_motion_at, timeout_secs)
        {
            info!("motion timeout ran out across the clock jump, light off");
            self.state.light_on = false;
        }

        if event.refresh_requested {
            info!("large forward clock jump, refreshing schedule");
            self.request_refresh(RefreshReason::ClockJump, input.now_ms, actions);
        }
    }

    fn toggle_mode(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        match self.state.mode {
            OperatingMode::Automatic => {
                self.state.mode = OperatingMode::Manual;
                self.state.light_on = true;
                self.state.color_temp_k = self.config.default_color_temp_k;
            }
            OperatingMode::Manual => {
                self.state.mode = OperatingMode::Automatic;
                self.state.light_on = false;
            }
            OperatingMode::Recovery => return,
        }

        info!("mode switched to {}", self.state.mode.as_str());
        self.emit(TelemetryEventKind::ModeChange, false, now_ms, actions);
    }

    fn evaluate_motion(
        &mut self,
        input: &CycleInput,
        schedule: &ScheduleStore,
        actions: &mut Vec<EngineAction>,
    ) {
        if self.state.mode != OperatingMode::Automatic {
            return;
        }

        if input.sensors.motion_present {
            let turned_on = !self.state.light_on;
            self.state.light_on = true;
            self.state.last_motion_ms = Some(input.now_ms);
            self.state.last_motion_at = Some(input.now);
            self.state.color_temp_k = self.lookup_color_temp(input.now, schedule);

            if turned_on {
                info!("motion detected, light on at {}K", self.state.color_temp_k);
                self.emit(TelemetryEventKind::MotionDetected, true, input.now_ms, actions);
            }
            return;
        }

        let timeout_ms = u64::from(schedule.motion_timeout_secs()) * 1_000;
        let expired = self
            .state
            .last_motion_ms
            .map(|last| input.now_ms.saturating_sub(last) > timeout_ms)
            .unwrap_or(true);

        if self.state.light_on && expired {
            info!("motion timeout, light off");
            self.state.light_on = false;
            self.emit(TelemetryEventKind::MotionTimeout, false, input.now_ms, actions);
        }
    }

    fn evaluate_dial(&mut self, brightness: u8) {
        let manual = self.state.mode == OperatingMode::Manual;

        if brightness <= self.config.brightness_off_threshold_pct {
            if self.state.light_on && manual {
                info!("dial at minimum, light off");
                self.state.light_on = false;
            }
            self.state.brightness_pct = 0;
            return;
        }

        if manual && !self.state.light_on {
            info!("dial raised, light on");
            self.state.light_on = true;
        }

        if brightness.abs_diff(self.state.brightness_pct) >= self.config.brightness_hysteresis_pct {
            self.state.brightness_pct = brightness;
        }
    }

    fn check_periodic_refresh(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        match self.last_refresh_ms {
            None => self.request_refresh(RefreshReason::Startup, now_ms, actions),
            Some(last)
                if now_ms.saturating_sub(last) >= self.config.schedule_refresh_interval_ms =>
            {
                self.request_refresh(RefreshReason::Periodic, now_ms, actions)
            }
            Some(_) => {}
        }
    }

    fn request_refresh(
        &mut self,
        reason: RefreshReason,
        now_ms: u64,
        actions: &mut Vec<EngineAction>,
    ) {
        self.last_refresh_ms = Some(now_ms);
        let pending = actions
            .iter()
            .any(|action| matches!(action, EngineAction::RefreshSchedule(_)));
        if !pending {
            actions.push(EngineAction::RefreshSchedule(reason));
        }
    }

    fn lookup_color_temp(&mut self, now: DateTime<Utc>, schedule: &ScheduleStore) -> u32 {
        if self.state.schedule_loaded && !self.state.stale_warned && schedule.is_stale(now) {
            warn!("schedule expired, reusing its points cyclically");
            self.state.stale_warned = true;
        }
        schedule.lookup(now)
    }

    fn emit(
        &mut self,
        kind: TelemetryEventKind,
        motion_detected: bool,
        now_ms: u64,
        actions: &mut Vec<EngineAction>,
    ) {
        let snapshot = LightSnapshot {
            light_on: self.state.light_on,
            brightness_pct: self.state.brightness_pct,
            color_temp_k: self.state.color_temp_k,
        };
        if let Some(payload) = self.telemetry.emit(kind, motion_detected, snapshot, now_ms) {
            actions.push(EngineAction::Telemetry(payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::{Schedule, SchedulePoint, SleepWindow};

    const HOUR_MS: u64 = 3_600_000;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn loaded_store() -> ScheduleStore {
        let day = |hour| Utc.with_ymd_and_hms(2026, 5, 30, hour, 0, 0).unwrap();
        let mut store = ScheduleStore::new(3_500);
        store.replace(Schedule {
            profile_id: 11,
            sleep: SleepWindow {
                start_secs: 79_200,
                end_secs: 25_200,
            },
            min_color_temp_k: 1_900,
            max_color_temp_k: 6_500,
            night_mode_enabled: false,
            motion_timeout_secs: 60,
            generated_at: day(0),
            valid_until: Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap(),
            points: [(6, 6_500), (20, 2_500)]
                .into_iter()
                .map(|(hour, color_temp_k)| SchedulePoint {
                    at: day(hour),
                    color_temp_k,
                })
                .collect(),
        });
        store
    }

    fn frame(motion: bool, dial_percent: u8) -> SensorFrame {
        SensorFrame {
            button_pressed: false,
            motion_present: motion,
            dial_percent,
        }
    }

    fn press(dial_percent: u8) -> SensorFrame {
        SensorFrame {
            button_pressed: true,
            ..frame(false, dial_percent)
        }
    }

    fn cycle(now_ms: u64, now: DateTime<Utc>, sensors: SensorFrame) -> CycleInput {
        CycleInput {
            now_ms,
            now,
            sensors,
        }
    }

    fn telemetry(actions: &[EngineAction]) -> Vec<&TelemetryPayload> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Telemetry(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn refreshes(actions: &[EngineAction]) -> Vec<RefreshReason> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::RefreshSchedule(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Engine that has already run its first cycle at `noon()`.
    fn started(store: &ScheduleStore) -> LightingEngine {
        let mut engine = LightingEngine::new(LightingConfig::default());
        engine.state.schedule_loaded = true;
        let _ = engine.tick(&cycle(0, noon(), frame(false, 60)), store);
        engine
    }

    #[test]
    fn button_press_from_automatic_enters_manual_with_default_temp() {
        let store = loaded_store();
        let mut engine = LightingEngine::new(LightingConfig::default());
        engine.state.color_temp_k = 5_200;

        let actions = engine.tick(&cycle(0, noon(), press(60)), &store);

        assert_eq!(engine.mode(), OperatingMode::Manual);
        assert!(engine.state().light_on);
        assert_eq!(engine.state().color_temp_k, 3_500);

        let sent = telemetry(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, TelemetryEventKind::ModeChange);
        assert!(!sent[0].motion_detected);
        assert_eq!(
            actions.last(),
            Some(&EngineAction::Render(LightOutput::new(true, 60, 3_500)))
        );
    }

    #[test]
    fn button_press_from_manual_returns_to_automatic_dark() {
        let store = loaded_store();
        let mut engine = started(&store);

        let _ = engine.tick(&cycle(50, noon(), press(60)), &store);
        let actions = engine.tick(&cycle(5_000, noon(), press(60)), &store);

        assert_eq!(engine.mode(), OperatingMode::Automatic);
        assert!(!engine.state().light_on);
        assert_eq!(telemetry(&actions).len(), 1);
        assert_eq!(actions.last(), Some(&EngineAction::Render(LightOutput::Off)));
    }

    #[test]
    fn motion_turns_light_on_with_scheduled_temp() {
        let store = loaded_store();
        let mut engine = started(&store);
        let one_pm = noon() + Duration::hours(1);

        let actions = engine.tick(&cycle(3_000, one_pm, frame(true, 60)), &store);

        assert!(engine.state().light_on);
        assert_eq!(engine.state().color_temp_k, 4_500);
        assert_eq!(engine.state().last_motion_at, Some(one_pm));
        let sent = telemetry(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, TelemetryEventKind::MotionDetected);
        assert!(sent[0].motion_detected);

        // Continued motion keeps the light on without repeating telemetry.
        let actions = engine.tick(&cycle(6_000, one_pm, frame(true, 60)), &store);
        assert!(telemetry(&actions).is_empty());
    }

    #[test]
    fn motion_timeout_turns_light_off_once() {
        let store = loaded_store();
        let mut engine = started(&store);

        let _ = engine.tick(&cycle(1_000, noon(), frame(true, 60)), &store);
        let actions = engine.tick(&cycle(61_000, noon(), frame(false, 60)), &store);
        assert!(engine.state().light_on, "timeout is strictly greater-than");
        assert!(telemetry(&actions).is_empty());

        let actions = engine.tick(&cycle(61_001, noon(), frame(false, 60)), &store);
        assert!(!engine.state().light_on);
        let sent = telemetry(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, TelemetryEventKind::MotionTimeout);

        let actions = engine.tick(&cycle(70_000, noon(), frame(false, 60)), &store);
        assert!(telemetry(&actions).is_empty());
    }

    #[test]
    fn motion_is_ignored_in_manual() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), press(60)), &store);

        let _ = engine.tick(&cycle(500, noon() + Duration::hours(1), frame(true, 60)), &store);

        assert_eq!(engine.state().color_temp_k, 3_500);
        assert_eq!(engine.state().last_motion_ms, None);
    }

    #[test]
    fn dial_changes_inside_hysteresis_band_are_ignored() {
        let store = loaded_store();
        let mut engine = started(&store);
        assert_eq!(engine.state().brightness_pct, 60);

        let _ = engine.tick(&cycle(50, noon(), frame(false, 64)), &store);
        assert_eq!(engine.state().brightness_pct, 60);

        let _ = engine.tick(&cycle(100, noon(), frame(false, 56)), &store);
        assert_eq!(engine.state().brightness_pct, 60);

        let _ = engine.tick(&cycle(150, noon(), frame(false, 65)), &store);
        assert_eq!(engine.state().brightness_pct, 65);
    }

    #[test]
    fn dial_at_minimum_turns_manual_light_off() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), press(60)), &store);
        assert!(engine.state().light_on);

        let _ = engine.tick(&cycle(100, noon(), frame(false, 10)), &store);
        assert!(!engine.state().light_on);
        assert_eq!(engine.state().brightness_pct, 0);

        let _ = engine.tick(&cycle(150, noon(), frame(false, 11)), &store);
        assert!(engine.state().light_on);
        assert_eq!(engine.state().brightness_pct, 11);
    }

    #[test]
    fn dial_at_minimum_keeps_automatic_light_on_but_dark() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), frame(true, 60)), &store);

        let actions = engine.tick(&cycle(100, noon(), frame(true, 3)), &store);

        assert!(engine.state().light_on);
        assert_eq!(engine.state().brightness_pct, 0);
        match actions.last() {
            Some(EngineAction::Render(output)) => assert_eq!(output.pixel(), Rgb::BLACK),
            other => panic!("expected render, got {other:?}"),
        }
    }

    #[test]
    fn forward_clock_jump_forces_light_off_same_cycle() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), frame(true, 60)), &store);
        let _ = engine.tick(&cycle(100, noon(), frame(false, 60)), &store);

        let actions = engine.tick(
            &cycle(150, noon() + Duration::minutes(30), frame(false, 60)),
            &store,
        );

        assert!(!engine.state().light_on);
        assert!(refreshes(&actions).is_empty());
        assert_eq!(actions.last(), Some(&EngineAction::Render(LightOutput::Off)));
    }

    #[test]
    fn large_forward_jump_requests_refresh() {
        let store = loaded_store();
        let mut engine = started(&store);

        let actions = engine.tick(
            &cycle(50, noon() + Duration::hours(3), frame(false, 60)),
            &store,
        );

        assert_eq!(refreshes(&actions), vec![RefreshReason::ClockJump]);
    }

    #[test]
    fn clock_jump_leaves_manual_light_on() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), press(60)), &store);
        assert!(engine.state().light_on);

        let actions = engine.tick(
            &cycle(100, noon() + Duration::hours(5), frame(false, 60)),
            &store,
        );

        assert_eq!(engine.mode(), OperatingMode::Manual);
        assert!(engine.state().light_on);
        assert_eq!(refreshes(&actions), vec![RefreshReason::ClockJump]);
        assert_eq!(
            actions.last(),
            Some(&EngineAction::Render(LightOutput::new(true, 60, 3_500)))
        );
    }

    #[test]
    fn backward_jumps_never_refresh_or_force_off() {
        let store = loaded_store();
        let mut engine = started(&store);
        let _ = engine.tick(&cycle(50, noon(), frame(true, 60)), &store);
        let _ = engine.tick(&cycle(100, noon(), frame(false, 60)), &store);

        let actions = engine.tick(
            &cycle(150, noon() - Duration::seconds(45), frame(false, 60)),
            &store,
        );
        assert!(engine.state().light_on);
        assert!(refreshes(&actions).is_empty());

        let actions = engine.tick(
            &cycle(200, noon() - Duration::hours(5), frame(false, 60)),
            &store,
        );
        assert!(engine.state().light_on);
        assert!(refreshes(&actions).is_empty());
        assert_eq!(engine.last_known_time(), Some(noon() - Duration::hours(5)));
    }

    #[test]
    fn refresh_requested_at_startup_then_each_interval() {
        let store = loaded_store();
        let mut engine = LightingEngine::new(LightingConfig::default());

        let first = engine.tick(&cycle(0, noon(), frame(false, 60)), &store);
        let early = engine.tick(&cycle(HOUR_MS - 1, noon(), frame(false, 60)), &store);
        let due = engine.tick(&cycle(HOUR_MS, noon(), frame(false, 60)), &store);

        assert_eq!(refreshes(&first), vec![RefreshReason::Startup]);
        assert!(refreshes(&early).is_empty());
        assert_eq!(refreshes(&due), vec![RefreshReason::Periodic]);
    }

    #[test]
    fn unauthorized_fetch_enters_terminal_recovery() {
        let mut store = loaded_store();
        let mut engine = started(&store);

        let outcome = engine.apply_fetch(&mut store, Err(RemoteError::Unauthorized));

        assert_eq!(outcome, RefreshOutcome::Unauthorized);
        assert_eq!(engine.mode(), OperatingMode::Recovery);

        let actions = engine.tick(
            &cycle(5_000, noon() + Duration::hours(4), press(0)),
            &store,
        );
        assert_eq!(engine.mode(), OperatingMode::Recovery);
        assert_eq!(
            actions,
            vec![EngineAction::Render(LightOutput::new(true, 50, 1_000))]
        );
    }

    #[test]
    fn unauthorized_telemetry_enters_recovery() {
        let store = loaded_store();
        let mut engine = started(&store);

        engine.apply_telemetry_result(Err(RemoteError::Offline));
        assert_eq!(engine.mode(), OperatingMode::Automatic);

        engine.apply_telemetry_result(Err(RemoteError::Unauthorized));
        assert_eq!(engine.mode(), OperatingMode::Recovery);
    }

    #[test]
    fn failed_or_malformed_fetch_keeps_schedule() {
        let mut store = loaded_store();
        let mut engine = started(&store);
        let before = store.schedule().clone();

        let outcome = engine.apply_fetch(&mut store, Err(RemoteError::Status(503)));
        assert_eq!(outcome, RefreshOutcome::Failed(RemoteError::Status(503)));

        let outcome = engine.apply_fetch(&mut store, Ok(b"not json".to_vec()));
        assert!(matches!(outcome, RefreshOutcome::Rejected(_)));
        assert_eq!(store.schedule(), &before);
        assert_eq!(engine.mode(), OperatingMode::Automatic);
    }

    #[test]
    fn stale_warning_latches_until_next_refresh() {
        let mut store = loaded_store();
        let mut engine = started(&store);
        let after_expiry = Utc.with_ymd_and_hms(2026, 7, 2, 13, 0, 0).unwrap();

        // Jump past expiry, then let the light pick a temperature.
        let _ = engine.tick(&cycle(50, after_expiry, frame(true, 60)), &store);
        assert!(engine.state().stale_warned);
        assert_eq!(engine.state().color_temp_k, 4_500);

        let payload = serde_json::to_vec(&serde_json::json!({
            "profile_id": 12,
            "sleep_start_utc_seconds": 0,
            "sleep_end_utc_seconds": 0,
            "min_color_temp": 2_000,
            "max_color_temp": 6_000,
            "night_mode_enabled": false,
            "motion_timeout_seconds": 60,
            "generated_at": "2026-07-02T00:00:00Z",
            "valid_until": "2026-07-03T00:00:00Z",
            "schedule": [],
        }))
        .unwrap();
        let outcome = engine.apply_fetch(&mut store, Ok(payload));

        assert_eq!(
            outcome,
            RefreshOutcome::Loaded {
                profile_id: 12,
                points: 0
            }
        );
        assert!(!engine.state().stale_warned);
    }

    #[test]
    fn light_output_maps_percent_to_pwm_level() {
        match LightOutput::new(true, 100, 6_600) {
            LightOutput::On { level, rgb, .. } => {
                assert_eq!(level, 255);
                assert_eq!(rgb, kelvin_to_rgb(6_600));
            }
            LightOutput::Off => panic!("expected light on"),
        }
        match LightOutput::new(true, 50, 6_600) {
            LightOutput::On { level, .. } => assert_eq!(level, 127),
            LightOutput::Off => panic!("expected light on"),
        }
        assert_eq!(LightOutput::new(false, 100, 6_600), LightOutput::Off);
    }
}
