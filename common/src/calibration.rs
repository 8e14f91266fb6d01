use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::PersistenceError, storage};

/// Running estimate of the shutdown+boot round trip, carried across power
/// cycles in the state file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    pub boot_shutdown_seconds: f64,
    pub last_shutdown_time: Option<DateTime<Utc>>,
}

impl CalibrationState {
    pub fn fresh(default_boot_shutdown_secs: f64) -> Self {
        Self {
            boot_shutdown_seconds: default_boot_shutdown_secs,
            last_shutdown_time: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    boot_shutdown_time: Option<f64>,
    last_shutdown_time: Option<DateTime<Utc>>,
}

/// What a calibration pass did with the latest sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    FirstRun,
    PeriodTooShort,
    Measured(f64),
    LongShutdown(f64),
    NoElapsedTime,
}

impl fmt::Display for CalibrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstRun => write!(
                f,
                "first run or state file was reset, measuring boot time on next cycle"
            ),
            Self::PeriodTooShort => {
                write!(f, "period too small to shut down, boot time not measured")
            }
            Self::Measured(secs) => write!(f, "measured boot and shutdown time: {secs:.1} seconds"),
            Self::LongShutdown(secs) => write!(
                f,
                "long shutdown detected ({secs:.1} seconds), not updating boot time"
            ),
            Self::NoElapsedTime => write!(
                f,
                "no time elapsed since the recorded shutdown, keeping boot time"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file or a `null` estimate both fall back to the default.
    pub fn load(&self, default_boot_shutdown_secs: f64) -> Result<CalibrationState, PersistenceError> {
        let Some(raw) = storage::read_optional(&self.path)? else {
            return Ok(CalibrationState::fresh(default_boot_shutdown_secs));
        };

        let file: StateFile =
            serde_json::from_slice(&raw).map_err(|source| PersistenceError::Decode {
                path: self.path.clone(),
                source,
            })?;

        Ok(CalibrationState {
            boot_shutdown_seconds: file
                .boot_shutdown_time
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .unwrap_or(default_boot_shutdown_secs),
            last_shutdown_time: file.last_shutdown_time,
        })
    }

    pub fn save(&self, state: &CalibrationState) -> Result<(), PersistenceError> {
        let file = StateFile {
            boot_shutdown_time: Some(state.boot_shutdown_seconds),
            last_shutdown_time: state.last_shutdown_time,
        };
        let payload = serde_json::to_vec(&file).map_err(|source| PersistenceError::Encode {
            what: "calibration state",
            source,
        })?;
        storage::write_atomic(&self.path, &payload)
    }
}
