//! Per-sensor state machines that turn raw polled samples into logical inputs.

use crate::config::LightingConfig;

/// One poll of the physical inputs, before any debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInputs {
    pub button_down: bool,
    pub motion: bool,
    pub dial_raw: u16,
}

/// Debounced view of the inputs for a single control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorFrame {
    /// Set only on the cycle the press edge was accepted.
    pub button_pressed: bool,
    pub motion_present: bool,
    pub dial_percent: u8,
}

/// Emits a press on the released-to-pressed edge, at most once per debounce window.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    held: bool,
    debounce_ms: u64,
    last_press_ms: Option<u64>,
}

impl ButtonDebouncer {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            held: false,
            debounce_ms,
            last_press_ms: None,
        }
    }

    pub fn sample(&mut self, down: bool, now_ms: u64) -> bool {
        let rising = down && !self.held;
        self.held = down;
        if !rising {
            return false;
        }

        let accepted = self
            .last_press_ms
            .map(|last| now_ms.saturating_sub(last) > self.debounce_ms)
            .unwrap_or(true);
        if accepted {
            self.last_press_ms = Some(now_ms);
        }
        accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionState {
    Idle,
    Rising { since_ms: u64 },
    Active,
    Falling { since_ms: u64 },
}

/// A raw motion level has to hold for `settle_ms` before it is believed.
#[derive(Debug, Clone)]
pub struct MotionDebouncer {
    state: MotionState,
    settle_ms: u64,
}

impl MotionDebouncer {
    pub fn new(settle_ms: u64) -> Self {
        Self {
            state: MotionState::Idle,
            settle_ms,
        }
    }

    fn is_present(&self) -> bool {
        matches!(self.state, MotionState::Active | MotionState::Falling { .. })
    }

    /// Returns the debounced presence after taking this sample.
    pub fn sample(&mut self, raw: bool, now_ms: u64) -> bool {
        let settled = |since_ms: u64| now_ms.saturating_sub(since_ms) >= self.settle_ms;

        self.state = match (self.state, raw) {
            (MotionState::Idle, true) if self.settle_ms == 0 => MotionState::Active,
            (MotionState::Idle, true) => MotionState::Rising { since_ms: now_ms },
            (MotionState::Rising { since_ms }, true) if settled(since_ms) => MotionState::Active,
            (MotionState::Rising { .. }, false) => MotionState::Idle,
            (MotionState::Active, false) if self.settle_ms == 0 => MotionState::Idle,
            (MotionState::Active, false) => MotionState::Falling { since_ms: now_ms },
            (MotionState::Falling { since_ms }, false) if settled(since_ms) => MotionState::Idle,
            (MotionState::Falling { .. }, true) => MotionState::Active,
            (state, _) => state,
        };

        self.is_present()
    }
}

/// Linear map of the ADC reading onto 0..=100 %.
#[derive(Debug, Clone, Copy)]
pub struct DialSampler {
    max_raw: u16,
}

impl DialSampler {
    pub fn new(max_raw: u16) -> Self {
        Self {
            max_raw: max_raw.max(1),
        }
    }

    pub fn percent(&self, raw: u16) -> u8 {
        let raw = u32::from(raw.min(self.max_raw));
        (raw * 100 / u32::from(self.max_raw)) as u8
    }
}

#[derive(Debug, Clone)]
pub struct SensorDebouncers {
    button: ButtonDebouncer,
    motion: MotionDebouncer,
    dial: DialSampler,
}

impl SensorDebouncers {
    pub fn new(config: &LightingConfig) -> Self {
        Self {
            button: ButtonDebouncer::new(config.button_debounce_ms),
            motion: MotionDebouncer::new(config.motion_settle_ms),
            dial: DialSampler::new(config.dial_max_raw),
        }
    }

    pub fn sample(&mut self, raw: RawInputs, now_ms: u64) -> SensorFrame {
        SensorFrame {
            button_pressed: self.button.sample(raw.button_down, now_ms),
            motion_present: self.motion.sample(raw.motion, now_ms),
            dial_percent: self.dial.percent(raw.dial_raw),
        }
    }
}
