pub mod calibration;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod schedule;
pub mod storage;
pub mod topics;
pub mod types;
pub mod update;

pub use calibration::{CalibrationOutcome, CalibrationState, CalibrationStore};
pub use config::{
    ConfigStore, OperatingConfig, SchedulerConfig, MAXIMUM_WAIT_TIME, MINIMUM_WAIT_TIME,
};
pub use device::{Capture, Clock, Devices, Notify, Power};
pub use error::{CollaboratorError, ConfigError, HardwareError, PersistenceError};
pub use orchestrator::{load_startup_config, CycleOrchestrator, RunExit, StepOutcome};
pub use schedule::{ScheduleDecision, Scheduler, WorkingHours};
pub use topics::*;
pub use types::{ImageMessage, OperatingMode, Quality};
pub use update::{ConfigUpdateChannel, ConfigUpdateResult, WaitOutcome, ACK_NOK_PREFIX, ACK_OK};
