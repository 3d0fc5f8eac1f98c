use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use heapless::Vec as HeaplessVec;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ScheduleError;

pub const MAX_SCHEDULE_POINTS: usize = 96;
pub const SECONDS_PER_DAY: u32 = 86_400;

/// Schedule payload as served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSchedule {
    pub profile_id: i64,
    pub sleep_start_utc_seconds: u32,
    pub sleep_end_utc_seconds: u32,
    pub min_color_temp: i32,
    pub max_color_temp: i32,
    pub night_mode_enabled: bool,
    pub motion_timeout_seconds: i32,
    #[serde(deserialize_with = "utc_timestamp")]
    pub generated_at: DateTime<Utc>,
    #[serde(deserialize_with = "utc_timestamp")]
    pub valid_until: DateTime<Utc>,
    pub schedule: Vec<RawPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPoint {
    #[serde(rename = "utc", deserialize_with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "temp")]
    pub color_temp: i32,
}

/// Sleep window in seconds since midnight UTC. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SleepWindow {
    #[serde(rename = "startSeconds")]
    pub start_secs: u32,
    #[serde(rename = "endSeconds")]
    pub end_secs: u32,
}

impl SleepWindow {
    pub fn contains(&self, day_secs: u32) -> bool {
        if self.start_secs <= self.end_secs {
            day_secs >= self.start_secs && day_secs < self.end_secs
        } else {
            day_secs >= self.start_secs || day_secs < self.end_secs
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulePoint {
    pub at: DateTime<Utc>,
    #[serde(rename = "colorTemp")]
    pub color_temp_k: u32,
}

impl SchedulePoint {
    pub fn day_seconds(&self) -> u32 {
        seconds_of_day(self.at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    #[serde(rename = "profileId")]
    pub profile_id: i64,
    pub sleep: SleepWindow,
    #[serde(rename = "minColorTemp")]
    pub min_color_temp_k: u32,
    #[serde(rename = "maxColorTemp")]
    pub max_color_temp_k: u32,
    #[serde(rename = "nightModeEnabled")]
    pub night_mode_enabled: bool,
    #[serde(rename = "motionTimeoutSeconds")]
    pub motion_timeout_secs: u32,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    #[serde(rename = "validUntil")]
    pub valid_until: DateTime<Utc>,
    pub points: HeaplessVec<SchedulePoint, MAX_SCHEDULE_POINTS>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            profile_id: 0,
            sleep: SleepWindow {
                start_secs: 0,
                end_secs: 0,
            },
            min_color_temp_k: 3_500,
            max_color_temp_k: 6_500,
            night_mode_enabled: false,
            motion_timeout_secs: 300,
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            valid_until: DateTime::<Utc>::UNIX_EPOCH,
            points: HeaplessVec::new(),
        }
    }
}

impl TryFrom<RawSchedule> for Schedule {
    type Error = ScheduleError;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        let sleep = SleepWindow {
            start_secs: day_offset("sleep_start_utc_seconds", raw.sleep_start_utc_seconds)?,
            end_secs: day_offset("sleep_end_utc_seconds", raw.sleep_end_utc_seconds)?,
        };
        let min_color_temp_k = kelvin("min_color_temp", raw.min_color_temp)?;
        let max_color_temp_k = kelvin("max_color_temp", raw.max_color_temp)?;
        if min_color_temp_k > max_color_temp_k {
            return Err(ScheduleError::Invalid {
                field: "min_color_temp",
                reason: format!("{min_color_temp_k}K exceeds max {max_color_temp_k}K"),
            });
        }
        let motion_timeout_secs =
            u32::try_from(raw.motion_timeout_seconds).map_err(|_| ScheduleError::Invalid {
                field: "motion_timeout_seconds",
                reason: format!("{} is negative", raw.motion_timeout_seconds),
            })?;

        if raw.schedule.len() > MAX_SCHEDULE_POINTS {
            warn!(
                "schedule has {} points, keeping the first {MAX_SCHEDULE_POINTS}",
                raw.schedule.len()
            );
        }

        let mut points = HeaplessVec::new();
        for point in raw.schedule.iter().take(MAX_SCHEDULE_POINTS) {
            let color_temp_k = kelvin("schedule.temp", point.color_temp)?;
            // Capacity is guaranteed by the take() above.
            let _ = points.push(SchedulePoint {
                at: point.timestamp,
                color_temp_k,
            });
        }
        points.sort_by_key(SchedulePoint::day_seconds);

        Ok(Self {
            profile_id: raw.profile_id,
            sleep,
            min_color_temp_k,
            max_color_temp_k,
            night_mode_enabled: raw.night_mode_enabled,
            motion_timeout_secs,
            generated_at: raw.generated_at,
            valid_until: raw.valid_until,
            points,
        })
    }
}

/// Owns the single active [`Schedule`]; replaced wholesale on every successful refresh.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    schedule: Schedule,
    default_color_temp_k: u32,
}

impl ScheduleStore {
    pub fn new(default_color_temp_k: u32) -> Self {
        Self {
            schedule: Schedule::default(),
            default_color_temp_k,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn motion_timeout_secs(&self) -> u32 {
        self.schedule.motion_timeout_secs
    }

    /// Decodes a fetched payload and swaps it in. On error the active schedule is untouched.
    pub fn refresh(&mut self, payload: &[u8]) -> Result<&Schedule, ScheduleError> {
        let raw: RawSchedule = serde_json::from_slice(payload)?;
        self.replace(Schedule::try_from(raw)?);
        Ok(&self.schedule)
    }

    pub fn replace(&mut self, schedule: Schedule) {
        self.schedule = schedule;
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.schedule.valid_until
    }

    pub fn night_mode_active(&self, now: DateTime<Utc>) -> bool {
        self.schedule.night_mode_enabled && self.schedule.sleep.contains(seconds_of_day(now))
    }

    /// Color temperature for `now`, reading the point table as a repeating day.
    pub fn lookup(&self, now: DateTime<Utc>) -> u32 {
        if self.night_mode_active(now) {
            return self.schedule.min_color_temp_k;
        }

        let points = &self.schedule.points;
        let Some(last) = points.last() else {
            return self.default_color_temp_k;
        };

        let current = seconds_of_day(now);
        for pair in points.windows(2) {
            let (start, end) = (pair[0].day_seconds(), pair[1].day_seconds());
            if current >= start && current < end {
                let progress = (current - start) as f32 / (end - start) as f32;
                let from = i64::from(pair[0].color_temp_k);
                let to = i64::from(pair[1].color_temp_k);
                let interpolated = from + (progress * (to - from) as f32) as i64;
                return interpolated as u32;
            }
        }

        last.color_temp_k
    }
}

/// RFC 3339, or a bare `YYYY-MM-DDTHH:MM:SS[.fff]` which is taken as UTC.
fn utc_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

pub fn seconds_of_day(at: DateTime<Utc>) -> u32 {
    at.num_seconds_from_midnight()
}

fn day_offset(field: &'static str, seconds: u32) -> Result<u32, ScheduleError> {
    if seconds < SECONDS_PER_DAY {
        Ok(seconds)
    } else {
        Err(ScheduleError::Invalid {
            field,
            reason: format!("{seconds} is not a time of day"),
        })
    }
}

fn kelvin(field: &'static str, value: i32) -> Result<u32, ScheduleError> {
    match u32::try_from(value) {
        Ok(kelvin) if kelvin > 0 => Ok(kelvin),
        _ => Err(ScheduleError::Invalid {
            field,
            reason: format!("{value}K is not a color temperature"),
        }),
    }
}
