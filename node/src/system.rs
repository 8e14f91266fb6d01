use std::process::Command;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use solarcam_common::{Clock, HardwareError, Power};

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Power control through the board RTC and systemd.
pub struct RtcPower {
    rtc_device: String,
}

impl RtcPower {
    pub fn new(rtc_device: impl Into<String>) -> Self {
        Self {
            rtc_device: rtc_device.into(),
        }
    }

    fn wakeup_args(&self, at: DateTime<Utc>) -> Vec<String> {
        // rtcwake takes whole seconds; never wake before the requested instant.
        let epoch = at.timestamp() + i64::from(at.timestamp_subsec_nanos() > 0);
        vec![
            "rtcwake".to_string(),
            "-d".to_string(),
            self.rtc_device.clone(),
            "-m".to_string(),
            "no".to_string(),
            "-u".to_string(),
            "-t".to_string(),
            epoch.to_string(),
        ]
    }
}

impl Power for RtcPower {
    fn schedule_wakeup(&self, at: DateTime<Utc>) -> Result<(), HardwareError> {
        run_privileged(&self.wakeup_args(at)).map_err(HardwareError::WakeAlarm)?;
        info!("wake alarm set on {} for {at}", self.rtc_device);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), HardwareError> {
        let args = ["systemctl", "poweroff", "--no-block"].map(String::from);
        run_privileged(&args).map_err(HardwareError::PowerOff)
    }
}

fn run_privileged(args: &[String]) -> Result<(), String> {
    let command_line = args.join(" ");
    debug!("running sudo {command_line}");

    let output = Command::new("sudo")
        .args(args)
        .output()
        .map_err(|err| format!("failed to run `{command_line}`: {err}"))?;

    if output.status.success() {
        return Ok(());
    }

    Err(format!(
        "`{command_line}` exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}
