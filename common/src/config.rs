use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightingConfig {
    pub cycle_period_ms: u64,
    pub button_debounce_ms: u64,
    pub motion_settle_ms: u64,
    pub schedule_refresh_interval_ms: u64,
    pub telemetry_debounce_ms: u64,
    pub telemetry_enabled: bool,
    pub telemetry_min_color_temp_k: u32,
    pub time_jump_refetch_threshold_secs: i64,
    pub default_color_temp_k: u32,
    pub recovery_color_temp_k: u32,
    pub recovery_brightness_pct: u8,
    pub brightness_off_threshold_pct: u8,
    pub brightness_hysteresis_pct: u8,
    pub dial_max_raw: u16,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 50,
            button_debounce_ms: 200,
            motion_settle_ms: 100,
            schedule_refresh_interval_ms: 3_600_000,
            telemetry_debounce_ms: 2_000,
            telemetry_enabled: true,
            telemetry_min_color_temp_k: 1_800,
            time_jump_refetch_threshold_secs: 3_600,
            default_color_temp_k: 3_500,
            recovery_color_temp_k: 1_000,
            recovery_brightness_pct: 50,
            brightness_off_threshold_pct: 10,
            brightness_hysteresis_pct: 5,
            dial_max_raw: 4_095,
        }
    }
}

impl LightingConfig {
    pub fn sanitize(&mut self) {
        self.cycle_period_ms = self.cycle_period_ms.clamp(10, 1_000);
        self.schedule_refresh_interval_ms = self.schedule_refresh_interval_ms.max(60_000);
        self.time_jump_refetch_threshold_secs = self.time_jump_refetch_threshold_secs.max(60);
        self.default_color_temp_k = self.default_color_temp_k.clamp(1_000, 40_000);
        self.recovery_color_temp_k = self.recovery_color_temp_k.clamp(1_000, 40_000);
        self.recovery_brightness_pct = self.recovery_brightness_pct.min(100);
        self.brightness_off_threshold_pct = self.brightness_off_threshold_pct.min(100);
        self.brightness_hysteresis_pct = self.brightness_hysteresis_pct.clamp(1, 50);
        if self.dial_max_raw == 0 {
            self.dial_max_raw = 4_095;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub schedule_route: String,
    pub telemetry_route: String,
    pub key_header: String,
    /// Used when no valid credential has been stored yet.
    pub fallback_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.18.103:3000".to_string(),
            schedule_route: "/devices/circadian".to_string(),
            telemetry_route: "/telemetry".to_string(),
            key_header: "x-api-key".to_string(),
            fallback_key: String::new(),
        }
    }
}

impl ApiConfig {
    pub fn schedule_url(&self) -> String {
        join_url(&self.base_url, &self.schedule_route)
    }

    pub fn telemetry_url(&self) -> String {
        join_url(&self.base_url, &self.telemetry_route)
    }
}

fn join_url(base: &str, route: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        route.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub button_pin: i32,
    pub motion_pin: i32,
    pub dial_pin: i32,
    pub led_pin: i32,
    pub led_count: u16,
    pub rmt_channel: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            button_pin: 3,
            motion_pin: 1,
            dial_pin: 0,
            led_pin: 8,
            led_count: 16,
            rmt_channel: 0,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.button_pin < 0 {
            self.button_pin = defaults.button_pin;
        }
        if self.motion_pin < 0 {
            self.motion_pin = defaults.motion_pin;
        }
        if self.dial_pin < 0 {
            self.dial_pin = defaults.dial_pin;
        }
        if self.led_pin < 0 {
            self.led_pin = defaults.led_pin;
        }
        self.led_count = self.led_count.clamp(1, 256);
        if self.rmt_channel > 3 {
            self.rmt_channel = 0;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub lighting: LightingConfig,
    pub api: ApiConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Only used to render local time on status views; schedule math is UTC.
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lighting: LightingConfig::default(),
            api: ApiConfig::default(),
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
            timezone: "UTC".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.lighting.sanitize();
        self.hardware.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_routes_without_doubled_slashes() {
        let api = ApiConfig {
            base_url: "http://lumi.local:3000/".to_string(),
            ..ApiConfig::default()
        };

        assert_eq!(api.schedule_url(), "http://lumi.local:3000/devices/circadian");
        assert_eq!(api.telemetry_url(), "http://lumi.local:3000/telemetry");
    }

    #[test]
    fn sanitize_restores_unusable_values() {
        let mut runtime = RuntimeConfig::default();
        runtime.lighting.dial_max_raw = 0;
        runtime.lighting.brightness_hysteresis_pct = 0;
        runtime.hardware.led_pin = -1;
        runtime.hardware.rmt_channel = 9;

        runtime.sanitize();

        assert_eq!(runtime.lighting.dial_max_raw, 4_095);
        assert_eq!(runtime.lighting.brightness_hysteresis_pct, 1);
        assert_eq!(runtime.hardware.led_pin, 8);
        assert_eq!(runtime.hardware.rmt_channel, 0);
    }

    #[test]
    fn missing_hardware_section_uses_defaults() {
        let mut value = serde_json::to_value(RuntimeConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("hardware");

        let runtime: RuntimeConfig = serde_json::from_value(value).unwrap();

        assert_eq!(runtime.hardware, HardwareConfig::default());
    }
}
