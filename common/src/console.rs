//! Line-oriented diagnostic commands accepted on the device's serial console.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::types::DeviceStatus;

pub const HELP: &str = "Commands: 'status', 'reset_key', 'fetch', 'time YYYY-MM-DD HH:MM:SS'";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Fetch,
    ResetKey,
    /// Wall clock in UTC.
    SetTime(DateTime<Utc>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("invalid time format, use: YYYY-MM-DD HH:MM:SS")]
    InvalidTime,
}

impl ConsoleCommand {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let line = line.trim();
        let command = match line {
            "" => return Ok(None),
            "status" => Self::Status,
            "fetch" => Self::Fetch,
            "reset_key" => Self::ResetKey,
            _ => match line.strip_prefix("time ") {
                Some(value) => {
                    let naive = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT)
                        .map_err(|_| ConsoleError::InvalidTime)?;
                    Self::SetTime(naive.and_utc())
                }
                None => return Err(ConsoleError::Unknown(line.to_string())),
            },
        };
        Ok(Some(command))
    }
}

pub fn render_status(status: &DeviceStatus) -> String {
    let yes_no = |flag: bool| if flag { "Yes" } else { "No" };
    let mut out = String::from("\nDEVICE STATUS\n");
    out.push_str(&format!("Mode: {}\n", status.mode));
    out.push_str(&format!(
        "Light: {}\n",
        if status.light_on { "ON" } else { "OFF" }
    ));
    out.push_str(&format!("Brightness: {}%\n", status.brightness));
    out.push_str(&format!("Color Temp: {}K\n", status.color_temp_k));
    out.push_str(&format!(
        "Schedule loaded:    {}\n",
        yes_no(status.schedule_loaded)
    ));
    out.push_str(&format!(
        "Night mode enabled: {}\n",
        yes_no(status.night_mode_enabled)
    ));
    out.push_str(&format!(
        "Night mode status:  {}\n",
        if status.night_mode_active {
            "Active"
        } else {
            "Inactive"
        }
    ));
    out.push_str(&format!(
        "Telemetry: {}\n",
        if status.telemetry_enabled {
            "Enabled"
        } else {
            "Disabled"
        }
    ));
    out.push_str(&format!(
        "API key: {}\n",
        status.key_fingerprint.as_deref().unwrap_or("none")
    ));
    match &status.local_time {
        Some(local) => out.push_str(&format!("Current time: {local}\n")),
        None => out.push_str(&format!("Current epoch: {}\n", status.now_epoch)),
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(ConsoleCommand::parse("status\r"), Ok(Some(ConsoleCommand::Status)));
        assert_eq!(ConsoleCommand::parse("  fetch "), Ok(Some(ConsoleCommand::Fetch)));
        assert_eq!(
            ConsoleCommand::parse("reset_key"),
            Ok(Some(ConsoleCommand::ResetKey))
        );
        assert_eq!(ConsoleCommand::parse(""), Ok(None));
    }

    #[test]
    fn time_command_is_read_as_utc() {
        assert_eq!(
            ConsoleCommand::parse("time 2026-04-20 06:30:00"),
            Ok(Some(ConsoleCommand::SetTime(
                Utc.with_ymd_and_hms(2026, 4, 20, 6, 30, 0).unwrap()
            )))
        );
        assert_eq!(
            ConsoleCommand::parse("time 20/04/2026"),
            Err(ConsoleError::InvalidTime)
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            ConsoleCommand::parse("reboot"),
            Err(ConsoleError::Unknown("reboot".to_string()))
        );
    }

    #[test]
    fn status_report_hides_key_material() {
        let status = DeviceStatus {
            mode: "AUTO",
            light_on: false,
            brightness: 80,
            color_temp_k: 4_200,
            schedule_loaded: true,
            schedule_stale: false,
            profile_id: 7,
            point_count: 24,
            night_mode_enabled: true,
            night_mode_active: false,
            telemetry_enabled: true,
            telemetry_dropped: 0,
            key_fingerprint: Some("0f1e2d3c".to_string()),
            now_epoch: 1_776_672_000,
            local_time: None,
        };

        let report = render_status(&status);

        assert!(report.contains("Mode: AUTO"));
        assert!(report.contains("Light: OFF"));
        assert!(report.contains("Night mode status:  Inactive"));
        assert!(report.contains("API key: 0f1e2d3c"));
        assert!(report.contains("Current epoch: 1776672000"));
    }
}
