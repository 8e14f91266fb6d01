use std::{
    path::{Path, PathBuf},
    process::Command,
};

use base64::{prelude::BASE64_STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use solarcam_common::{Capture, CollaboratorError, ImageMessage, Notify, Quality, TOPIC_IMAGE};

pub const DEFAULT_CPU_THERMAL: &str = "/sys/class/thermal/thermal_zone0/temp";
pub const DEFAULT_BATTERY_UEVENT: &str = "/sys/class/power_supply/bq2562x-battery/uevent";

#[derive(Debug, Clone)]
pub struct SensorPaths {
    pub cpu_thermal: PathBuf,
    pub battery_uevent: PathBuf,
}

impl Default for SensorPaths {
    fn default() -> Self {
        Self {
            cpu_thermal: PathBuf::from(DEFAULT_CPU_THERMAL),
            battery_uevent: PathBuf::from(DEFAULT_BATTERY_UEVENT),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub temperature: Option<f32>,
    pub charge: Option<u8>,
}

/// Stills camera driven through an external command that writes one JPEG to
/// stdout. Each frame is published as an [`ImageMessage`].
pub struct CommandCapture<N> {
    command: String,
    quality: Quality,
    sensors: SensorPaths,
    notify: N,
}

impl<N: Notify> CommandCapture<N> {
    pub fn new(command: impl Into<String>, sensors: SensorPaths, notify: N) -> Self {
        Self {
            command: command.into(),
            quality: Quality::Med,
            sensors,
            notify,
        }
    }

    fn take_picture(&self) -> Result<Vec<u8>, CollaboratorError> {
        let output = Command::new(&self.command)
            .args(capture_args(self.quality))
            .output()
            .map_err(|err| format!("failed to start {}: {err}", self.command))?;

        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }
        if output.stdout.is_empty() {
            return Err(format!("{} produced no image data", self.command).into());
        }
        Ok(output.stdout)
    }

    fn build_message(&self, jpeg: &[u8]) -> ImageMessage {
        let battery = read_battery(&self.sensors.battery_uevent);
        ImageMessage {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            image: BASE64_STANDARD.encode(jpeg),
            cpu_temp: read_cpu_temperature(&self.sensors.cpu_thermal),
            battery_temp: battery.temperature,
            battery_charge: battery.charge,
        }
    }
}

impl<N: Notify> Capture for CommandCapture<N> {
    fn apply_quality(&mut self, quality: Quality) {
        if quality != self.quality {
            let (width, height) = quality.resolution();
            info!("camera quality set to {} ({width}x{height})", quality.as_str());
        }
        self.quality = quality;
    }

    fn capture_and_transmit(&mut self) -> Result<(), CollaboratorError> {
        let jpeg = self.take_picture()?;
        debug!("captured {} bytes", jpeg.len());

        let message = self.build_message(&jpeg);
        let payload = serde_json::to_string(&message)?;
        self.notify.publish(TOPIC_IMAGE, &payload)
    }
}

fn capture_args(quality: Quality) -> Vec<String> {
    let (width, height) = quality.resolution();
    vec![
        "--nopreview".to_string(),
        "--immediate".to_string(),
        "--width".to_string(),
        width.to_string(),
        "--height".to_string(),
        height.to_string(),
        "--encoding".to_string(),
        "jpg".to_string(),
        "--output".to_string(),
        "-".to_string(),
    ]
}

/// Degrees Celsius from a thermal zone reporting millidegrees.
fn read_cpu_temperature(path: &Path) -> Option<f32> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| debug!("cpu temperature unavailable at {}: {err}", path.display()))
        .ok()?;
    match raw.trim().parse::<i64>() {
        Ok(millidegrees) => Some(millidegrees as f32 / 1000.0),
        Err(err) => {
            warn!("unexpected cpu temperature {:?}: {err}", raw.trim());
            None
        }
    }
}

fn read_battery(path: &Path) -> BatteryReading {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_battery_uevent(&contents),
        Err(err) => {
            debug!("battery status unavailable at {}: {err}", path.display());
            BatteryReading::default()
        }
    }
}

/// `POWER_SUPPLY_TEMP` is in tenths of a degree, `POWER_SUPPLY_CAPACITY` in percent.
fn parse_battery_uevent(contents: &str) -> BatteryReading {
    let mut reading = BatteryReading::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "POWER_SUPPLY_TEMP" => {
                reading.temperature = value.trim().parse::<i32>().ok().map(|t| t as f32 / 10.0);
            }
            "POWER_SUPPLY_CAPACITY" => {
                reading.charge = value.trim().parse::<u8>().ok().filter(|pct| *pct <= 100);
            }
            _ => {}
        }
    }
    reading
}
