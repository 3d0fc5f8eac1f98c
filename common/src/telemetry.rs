use log::debug;
use serde::Serialize;

use crate::config::LightingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventKind {
    ModeChange,
    MotionDetected,
    MotionTimeout,
}

impl TelemetryEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModeChange => "mode_change",
            Self::MotionDetected => "motion_detected",
            Self::MotionTimeout => "motion_timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSnapshot {
    pub light_on: bool,
    pub brightness_pct: u8,
    pub color_temp_k: u32,
}

/// Body posted to the telemetry route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPayload {
    pub event_type: TelemetryEventKind,
    pub motion_detected: bool,
    pub light_is_on: bool,
    pub brightness: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temp: Option<u32>,
}

/// Rate limiter in front of the telemetry transport. Requests inside the
/// debounce window are dropped, never queued.
#[derive(Debug, Clone)]
pub struct TelemetryEmitter {
    enabled: bool,
    debounce_ms: u64,
    min_color_temp_k: u32,
    last_emit_ms: Option<u64>,
    dropped: u64,
}

impl TelemetryEmitter {
    pub fn new(config: &LightingConfig) -> Self {
        Self {
            enabled: config.telemetry_enabled,
            debounce_ms: config.telemetry_debounce_ms,
            min_color_temp_k: config.telemetry_min_color_temp_k,
            last_emit_ms: None,
            dropped: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn emit(
        &mut self,
        kind: TelemetryEventKind,
        motion_detected: bool,
        snapshot: LightSnapshot,
        now_ms: u64,
    ) -> Option<TelemetryPayload> {
        if !self.enabled {
            return None;
        }

        if let Some(last) = self.last_emit_ms {
            if now_ms.saturating_sub(last) < self.debounce_ms {
                self.dropped += 1;
                debug!("telemetry {} dropped by rate limit", kind.as_str());
                return None;
            }
        }
        self.last_emit_ms = Some(now_ms);

        Some(TelemetryPayload {
            event_type: kind,
            motion_detected,
            light_is_on: snapshot.light_on,
            brightness: snapshot.brightness_pct,
            color_temp: (snapshot.color_temp_k >= self.min_color_temp_k)
                .then_some(snapshot.color_temp_k),
        })
    }
}
