use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Automatic,
    Manual,
    Recovery,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "AUTO",
            Self::Manual => "MANUAL",
            Self::Recovery => "RECOVERY",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub mode: &'static str,
    #[serde(rename = "lightOn")]
    pub light_on: bool,
    pub brightness: u8,
    #[serde(rename = "colorTemp")]
    pub color_temp_k: u32,
    #[serde(rename = "scheduleLoaded")]
    pub schedule_loaded: bool,
    #[serde(rename = "scheduleStale")]
    pub schedule_stale: bool,
    #[serde(rename = "profileId")]
    pub profile_id: i64,
    #[serde(rename = "pointCount")]
    pub point_count: usize,
    #[serde(rename = "nightModeEnabled")]
    pub night_mode_enabled: bool,
    #[serde(rename = "nightModeActive")]
    pub night_mode_active: bool,
    #[serde(rename = "telemetryEnabled")]
    pub telemetry_enabled: bool,
    #[serde(rename = "telemetryDropped")]
    pub telemetry_dropped: u64,
    #[serde(rename = "keyFingerprint")]
    pub key_fingerprint: Option<String>,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatePayload {
    pub mode: &'static str,
    pub light: bool,
    pub brightness: u8,
    #[serde(rename = "colorTemp")]
    pub color_temp_k: u32,
    #[serde(rename = "scheduleLoaded")]
    pub schedule_loaded: bool,
}
