use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::NaiveTime;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    error::{ConfigError, PersistenceError},
    schedule::WorkingHours,
    storage,
    types::{OperatingMode, Quality},
};

/// Shortest accepted capture period, in seconds.
pub const MINIMUM_WAIT_TIME: u32 = 5;
/// Longest accepted capture period, in seconds. Also the largest gap accepted
/// as a boot+shutdown calibration sample.
pub const MAXIMUM_WAIT_TIME: u32 = 10_800;

const CONFIG_FIELDS: [&str; 5] = ["quality", "mode", "period", "wakeUpTime", "shutDownTime"];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Waiting times at or below this are slept through in-process.
    pub shutdown_threshold_secs: f64,
    /// Boot+shutdown estimate used until the first calibration sample.
    pub default_boot_shutdown_secs: f64,
    /// Calibration samples above this are treated as manual power loss.
    pub max_calibration_gap_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_threshold_secs: 40.0,
            default_boot_shutdown_secs: 30.0,
            max_calibration_gap_secs: f64::from(MAXIMUM_WAIT_TIME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatingConfig {
    pub quality: Quality,
    pub mode: OperatingMode,
    pub period: u32,
    #[serde(rename = "wakeUpTime", serialize_with = "serialize_hms")]
    pub wake_up_time: NaiveTime,
    #[serde(rename = "shutDownTime", serialize_with = "serialize_hms")]
    pub shut_down_time: NaiveTime,
}

impl Default for OperatingConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl OperatingConfig {
    pub fn defaults() -> Self {
        Self {
            quality: Quality::Med,
            mode: OperatingMode::Periodic,
            period: 15,
            wake_up_time: hms(6, 59, 31),
            shut_down_time: hms(22, 0, 0),
        }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::validate(&value)
    }

    /// Checks a decoded payload in a fixed order so the first reported problem
    /// is deterministic: shape, field set, quality, mode, period, times.
    pub fn validate(value: &Value) -> Result<Self, ConfigError> {
        let Some(fields) = value.as_object() else {
            return Err(ConfigError::SchemaMismatch(
                "config is not a JSON object".to_string(),
            ));
        };

        check_field_set(fields)?;

        let quality = serde_json::from_value::<Quality>(fields["quality"].clone()).map_err(|_| {
            ConfigError::FieldOutOfRange {
                field: "quality",
                reason: format!("must be one of HD, 3K, 4K (got {})", fields["quality"]),
            }
        })?;

        let mode = serde_json::from_value::<OperatingMode>(fields["mode"].clone()).map_err(|_| {
            ConfigError::FieldOutOfRange {
                field: "mode",
                reason: format!(
                    "must be one of periodic, single-shot, always-on (got {})",
                    fields["mode"]
                ),
            }
        })?;

        let period = validate_period(&fields["period"], mode)?;
        let wake_up_time = parse_time_of_day("wakeUpTime", &fields["wakeUpTime"])?;
        let shut_down_time = parse_time_of_day("shutDownTime", &fields["shutDownTime"])?;

        Ok(Self {
            quality,
            mode,
            period,
            wake_up_time,
            shut_down_time,
        })
    }

    pub fn working_hours(&self) -> WorkingHours {
        WorkingHours::new(self.wake_up_time, self.shut_down_time)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means "no operator config yet" and yields the defaults.
    pub fn load(&self) -> Result<OperatingConfig, ConfigError> {
        match storage::read_optional(&self.path)? {
            Some(raw) => OperatingConfig::from_slice(&raw),
            None => Ok(OperatingConfig::defaults()),
        }
    }

    pub fn save(&self, config: &OperatingConfig) -> Result<(), PersistenceError> {
        let payload =
            serde_json::to_vec_pretty(config).map_err(|source| PersistenceError::Encode {
                what: "operating config",
                source,
            })?;
        storage::write_atomic(&self.path, &payload)
    }
}

fn check_field_set(fields: &Map<String, Value>) -> Result<(), ConfigError> {
    let expected: BTreeSet<&str> = CONFIG_FIELDS.into_iter().collect();
    let actual: BTreeSet<&str> = fields.keys().map(String::as_str).collect();
    if actual == expected {
        return Ok(());
    }

    let missing: Vec<&str> = expected.difference(&actual).copied().collect();
    let unexpected: Vec<&str> = actual.difference(&expected).copied().collect();
    let mut reason = String::from("config keys do not match");
    if !missing.is_empty() {
        reason.push_str(&format!(", missing: {}", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        reason.push_str(&format!(", unexpected: {}", unexpected.join(", ")));
    }
    Err(ConfigError::SchemaMismatch(reason))
}

/// Only periodic mode uses the period. Other modes accept any value and keep
/// it when it fits a `u32`, storing 0 otherwise.
fn validate_period(value: &Value, mode: OperatingMode) -> Result<u32, ConfigError> {
    if mode != OperatingMode::Periodic {
        return Ok(value
            .as_u64()
            .and_then(|period| u32::try_from(period).ok())
            .unwrap_or(0));
    }

    let period = value
        .as_u64()
        .and_then(|period| u32::try_from(period).ok())
        .ok_or_else(|| ConfigError::FieldOutOfRange {
            field: "period",
            reason: format!("must be a non-negative integer (got {value})"),
        })?;

    if period < MINIMUM_WAIT_TIME {
        return Err(ConfigError::FieldOutOfRange {
            field: "period",
            reason: format!("{period} is less than the minimum of {MINIMUM_WAIT_TIME} seconds"),
        });
    }
    if period > MAXIMUM_WAIT_TIME {
        return Err(ConfigError::FieldOutOfRange {
            field: "period",
            reason: format!("{period} is more than the maximum of {MAXIMUM_WAIT_TIME} seconds"),
        });
    }
    Ok(period)
}

/// Strict `HH:MM:SS`, 24h, two digits per component.
pub fn parse_time_of_day(field: &'static str, value: &Value) -> Result<NaiveTime, ConfigError> {
    let bad = || ConfigError::BadTimeFormat {
        field,
        value: value.as_str().map_or_else(|| value.to_string(), str::to_string),
    };

    let text = value.as_str().ok_or_else(bad)?;
    let bytes = text.as_bytes();
    let shape_ok = bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| bytes[i].is_ascii_digit());
    if !shape_ok {
        return Err(bad());
    }

    let component = |range: std::ops::Range<usize>| text[range].parse::<u32>().ok();
    match (component(0..2), component(3..5), component(6..8)) {
        (Some(hour), Some(minute), Some(second)) if second < 60 => {
            NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(bad)
        }
        _ => Err(bad()),
    }
}

fn hms(hour: u32, minute: u32, second: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, second).unwrap_or(NaiveTime::MIN)
}

fn serialize_hms<S: serde::Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format("%H:%M:%S"))
}
