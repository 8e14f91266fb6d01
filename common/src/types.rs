use serde::{Deserialize, Serialize};

/// Capture quality. The wire names are the resolution labels operators use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "HD")]
    Low,
    #[serde(rename = "3K")]
    Med,
    #[serde(rename = "4K")]
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "HD",
            Self::Med => "3K",
            Self::High => "4K",
        }
    }

    /// Frame size in pixels, width first.
    pub fn resolution(self) -> (u32, u32) {
        match self {
            Self::Low => (1920, 1080),
            Self::Med => (2560, 1440),
            Self::High => (3840, 2160),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    SingleShot,
    AlwaysOn,
    Periodic,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleShot => "single-shot",
            Self::AlwaysOn => "always-on",
            Self::Periodic => "periodic",
        }
    }
}

/// Message published on the image topic after every capture.
#[derive(Debug, Clone, Serialize)]
pub struct ImageMessage {
    pub timestamp: String,
    pub image: String,
    #[serde(rename = "cpuTemp")]
    pub cpu_temp: Option<f32>,
    #[serde(rename = "batteryTemp")]
    pub battery_temp: Option<f32>,
    #[serde(rename = "batteryCharge")]
    pub battery_charge: Option<u8>,
}
