use chrono::{DateTime, Utc};

use crate::{
    error::{CollaboratorError, HardwareError},
    types::Quality,
};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub trait Power {
    /// Programs the RTC to power the board back on at `at`.
    fn schedule_wakeup(&self, at: DateTime<Utc>) -> Result<(), HardwareError>;

    /// Starts powering the machine off. Returning `Ok` means the request was
    /// accepted; the process is expected to be terminated shortly after.
    fn shutdown(&self) -> Result<(), HardwareError>;
}

pub trait Capture {
    fn apply_quality(&mut self, quality: Quality);

    fn capture_and_transmit(&mut self) -> Result<(), CollaboratorError>;
}

pub trait Notify {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), CollaboratorError>;
}

/// Hardware and transport handles the cycle loop drives.
pub struct Devices<C, P, K, N> {
    pub clock: C,
    pub power: P,
    pub capture: K,
    pub notify: N,
}
