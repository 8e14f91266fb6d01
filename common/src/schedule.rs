use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use tracing::{error, info, warn};

use crate::{
    calibration::{CalibrationOutcome, CalibrationState, CalibrationStore},
    config::SchedulerConfig,
    error::PersistenceError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleDecision {
    Shutdown {
        wake_at: DateTime<Utc>,
        duration: Duration,
    },
    SleepInProcess {
        duration: Duration,
    },
    ContinueImmediately,
}

/// UTC time-of-day window in which the camera may run. A shutdown time
/// earlier than the wake-up time describes an overnight window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub wake_up: NaiveTime,
    pub shut_down: NaiveTime,
}

impl WorkingHours {
    pub fn new(wake_up: NaiveTime, shut_down: NaiveTime) -> Self {
        Self { wake_up, shut_down }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.wake_up < self.shut_down {
            self.wake_up <= time && time < self.shut_down
        } else if self.shut_down < self.wake_up {
            time >= self.wake_up || time < self.shut_down
        } else {
            true
        }
    }

    /// First instant strictly after `now` whose time of day is the wake-up time.
    pub fn next_wake_up(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.wake_up).and_utc();
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }

    /// Forced shutdown until the next wake-up when `now` is outside the window.
    pub fn gate(&self, now: DateTime<Utc>) -> Option<ScheduleDecision> {
        if self.contains(now.time()) {
            return None;
        }

        let wake_at = self.next_wake_up(now);
        let duration = (wake_at - now).to_std().unwrap_or_default();
        Some(ScheduleDecision::Shutdown { wake_at, duration })
    }
}

/// Decides, once per cycle, whether to power off or sleep in-process, and keeps
/// the boot+shutdown estimate calibrated from the gaps between cycles.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    period_secs: f64,
    store: CalibrationStore,
    state: CalibrationState,
}

impl Scheduler {
    /// Loads persisted calibration, starting fresh if the state file is unusable.
    pub fn new(config: SchedulerConfig, period: u32, store: CalibrationStore) -> Self {
        let state = store
            .load(config.default_boot_shutdown_secs)
            .unwrap_or_else(|err| {
                warn!("failed to load calibration state, starting fresh: {err}");
                CalibrationState::fresh(config.default_boot_shutdown_secs)
            });

        Self {
            config,
            period_secs: f64::from(period),
            store,
            state,
        }
    }

    pub fn set_period(&mut self, period: u32) {
        self.period_secs = f64::from(period);
    }

    pub fn period_secs(&self) -> f64 {
        self.period_secs
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn waiting_time(&self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> f64 {
        let elapsed = seconds_between(start_time, end_time);
        (self.period_secs - elapsed).max(0.0)
    }

    /// Folds the gap since the last recorded shutdown into the estimate and
    /// flushes the state to disk. The in-memory state is updated even when the
    /// flush fails, so the next cycle retries the write.
    pub fn update_calibration(
        &mut self,
        end_time: DateTime<Utc>,
    ) -> Result<CalibrationOutcome, PersistenceError> {
        let threshold = self.config.shutdown_threshold_secs;

        let outcome = match self.state.last_shutdown_time {
            None => {
                self.state.last_shutdown_time = Some(end_time);
                if self.period_secs > threshold {
                    CalibrationOutcome::FirstRun
                } else {
                    CalibrationOutcome::PeriodTooShort
                }
            }
            Some(last) if end_time <= last => CalibrationOutcome::NoElapsedTime,
            Some(last) => {
                let boot_time = seconds_between(last, end_time);
                self.state.last_shutdown_time = Some(end_time);

                if self.period_secs < threshold {
                    CalibrationOutcome::PeriodTooShort
                } else if boot_time <= self.config.max_calibration_gap_secs {
                    self.state.boot_shutdown_seconds = boot_time;
                    CalibrationOutcome::Measured(boot_time)
                } else {
                    CalibrationOutcome::LongShutdown(boot_time)
                }
            }
        };

        self.store.save(&self.state)?;
        Ok(outcome)
    }

    /// Runs calibration and picks what to do with the rest of the cycle.
    /// Never returns `Shutdown` unless the calibration state reached disk.
    pub fn decide(&mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> ScheduleDecision {
        let waiting_time = self.waiting_time(start_time, end_time);
        info!("waiting time is {waiting_time:.1} seconds");

        let persisted = match self.update_calibration(end_time) {
            Ok(outcome) => {
                match outcome {
                    CalibrationOutcome::LongShutdown(_) => warn!("{outcome}"),
                    _ => info!("{outcome}"),
                }
                true
            }
            Err(err) => {
                error!("failed to persist calibration state: {err}");
                false
            }
        };

        if waiting_time > self.config.shutdown_threshold_secs {
            let shutdown_secs = (waiting_time - self.state.boot_shutdown_seconds).max(0.0);
            let duration = Duration::from_secs_f64(shutdown_secs);

            if !persisted {
                warn!("not powering off with unflushed calibration state, sleeping {shutdown_secs:.1} seconds in-process");
                return ScheduleDecision::SleepInProcess { duration };
            }

            let wake_at = end_time + TimeDelta::milliseconds(duration.as_millis() as i64);
            ScheduleDecision::Shutdown { wake_at, duration }
        } else if waiting_time > 0.0 {
            ScheduleDecision::SleepInProcess {
                duration: Duration::from_secs_f64(waiting_time),
            }
        } else {
            ScheduleDecision::ContinueImmediately
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, second).unwrap()
    }

    fn time(hour: u32, minute: u32, second: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, second).unwrap()
    }

    fn scheduler_with(
        dir: &TempDir,
        threshold: f64,
        period: u32,
        state: Option<CalibrationState>,
    ) -> Scheduler {
        let store = CalibrationStore::new(dir.path().join("state_file.json"));
        if let Some(state) = state {
            store.save(&state).unwrap();
        }
        let config = SchedulerConfig {
            shutdown_threshold_secs: threshold,
            ..SchedulerConfig::default()
        };
        Scheduler::new(config, period, store)
    }

    fn persisted(dir: &TempDir) -> CalibrationState {
        CalibrationStore::new(dir.path().join("state_file.json"))
            .load(-1.0)
            .unwrap()
    }

    #[test]
    fn first_run_records_shutdown_time_only() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler_with(&dir, 70.0, 120, None);
        let end = at(8, 0, 0);

        let outcome = scheduler.update_calibration(end).unwrap();

        assert_eq!(outcome, CalibrationOutcome::FirstRun);
        assert_eq!(scheduler.state().boot_shutdown_seconds, 30.0);
        assert_eq!(scheduler.state().last_shutdown_time, Some(end));
        assert_eq!(persisted(&dir).last_shutdown_time, Some(end));
    }

    #[test]
    fn accepts_sample_within_ceiling() {
        let dir = TempDir::new().unwrap();
        let t0 = at(8, 0, 0);
        let mut scheduler = scheduler_with(
            &dir,
            70.0,
            120,
            Some(CalibrationState {
                boot_shutdown_seconds: 30.0,
                last_shutdown_time: Some(t0),
            }),
        );

        let end = t0 + TimeDelta::seconds(42);
        let outcome = scheduler.update_calibration(end).unwrap();

        assert_eq!(outcome, CalibrationOutcome::Measured(42.0));
        assert_eq!(persisted(&dir).boot_shutdown_seconds, 42.0);
        assert_eq!(persisted(&dir).last_shutdown_time, Some(end));
    }

    #[test]
    fn repeated_end_time_does_not_double_count() {
        let dir = TempDir::new().unwrap();
        let t0 = at(8, 0, 0);
        let mut scheduler = scheduler_with(
            &dir,
            70.0,
            120,
            Some(CalibrationState {
                boot_shutdown_seconds: 30.0,
                last_shutdown_time: Some(t0),
            }),
        );
        let end = t0 + TimeDelta::seconds(55);

        scheduler.update_calibration(end).unwrap();
        let first = persisted(&dir).boot_shutdown_seconds;
        let outcome = scheduler.update_calibration(end).unwrap();

        assert_eq!(outcome, CalibrationOutcome::NoElapsedTime);
        assert_eq!(persisted(&dir).boot_shutdown_seconds, first);
        assert_eq!(scheduler.state().boot_shutdown_seconds, 55.0);
    }

    #[test]
    fn long_gap_is_treated_as_outlier() {
        let dir = TempDir::new().unwrap();
        let t0 = at(0, 0, 0);
        let mut scheduler = scheduler_with(
            &dir,
            70.0,
            120,
            Some(CalibrationState {
                boot_shutdown_seconds: 18.0,
                last_shutdown_time: Some(t0),
            }),
        );
        let end = t0 + TimeDelta::seconds(i64::from(crate::config::MAXIMUM_WAIT_TIME) + 1);

        let outcome = scheduler.update_calibration(end).unwrap();

        assert!(matches!(outcome, CalibrationOutcome::LongShutdown(_)));
        assert_eq!(scheduler.state().boot_shutdown_seconds, 18.0);
        assert_eq!(scheduler.state().last_shutdown_time, Some(end));
    }

    #[test]
    fn short_period_never_calibrates() {
        let dir = TempDir::new().unwrap();
        let t0 = at(8, 0, 0);
        let mut scheduler = scheduler_with(
            &dir,
            70.0,
            30,
            Some(CalibrationState {
                boot_shutdown_seconds: 22.0,
                last_shutdown_time: Some(t0),
            }),
        );

        let outcome = scheduler
            .update_calibration(t0 + TimeDelta::seconds(30))
            .unwrap();

        assert_eq!(outcome, CalibrationOutcome::PeriodTooShort);
        assert_eq!(scheduler.state().boot_shutdown_seconds, 22.0);
    }

    #[test]
    fn shutdown_duration_subtracts_boot_estimate() {
        let dir = TempDir::new().unwrap();
        let start = at(8, 0, 0);
        let end = start + TimeDelta::seconds(10);
        let mut scheduler = scheduler_with(
            &dir,
            70.0,
            100,
            Some(CalibrationState {
                boot_shutdown_seconds: 15.0,
                // Outside the ceiling so the estimate survives this cycle.
                last_shutdown_time: Some(at(0, 0, 0) - TimeDelta::days(1)),
            }),
        );

        let decision = scheduler.decide(start, end);

        assert_eq!(
            decision,
            ScheduleDecision::Shutdown {
                wake_at: end + TimeDelta::seconds(75),
                duration: Duration::from_secs(75),
            }
        );
    }

    #[test]
    fn small_period_never_shuts_down() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler_with(&dir, 70.0, 30, None);
        let start = at(8, 0, 0);

        for elapsed in 0..=30 {
            let end = start + TimeDelta::seconds(elapsed);
            let decision = scheduler.decide(start, end);
            assert!(
                !matches!(decision, ScheduleDecision::Shutdown { .. }),
                "elapsed {elapsed}s produced {decision:?}"
            );
        }
    }

    #[test]
    fn sleeps_when_below_threshold_and_continues_when_overrun() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler_with(&dir, 40.0, 30, None);
        let start = at(8, 0, 0);

        assert_eq!(
            scheduler.decide(start, start + TimeDelta::seconds(12)),
            ScheduleDecision::SleepInProcess {
                duration: Duration::from_secs(18),
            }
        );
        assert_eq!(
            scheduler.decide(start, start + TimeDelta::seconds(45)),
            ScheduleDecision::ContinueImmediately
        );
    }

    #[test]
    fn shutdown_duration_is_clamped_at_zero() {
        let dir = TempDir::new().unwrap();
        let start = at(8, 0, 0);
        let end = start + TimeDelta::seconds(10);
        let mut scheduler = scheduler_with(
            &dir,
            40.0,
            60,
            Some(CalibrationState {
                boot_shutdown_seconds: 90.0,
                last_shutdown_time: Some(at(0, 0, 0) - TimeDelta::days(1)),
            }),
        );

        assert_eq!(
            scheduler.decide(start, end),
            ScheduleDecision::Shutdown {
                wake_at: end,
                duration: Duration::ZERO,
            }
        );
    }

    #[test]
    fn unflushed_state_downgrades_shutdown_to_sleep() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let store = CalibrationStore::new(blocker.join("state_file.json"));
        let config = SchedulerConfig {
            shutdown_threshold_secs: 70.0,
            default_boot_shutdown_secs: 15.0,
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::new(config, 100, store);
        let start = at(8, 0, 0);

        let decision = scheduler.decide(start, start + TimeDelta::seconds(10));

        assert_eq!(
            decision,
            ScheduleDecision::SleepInProcess {
                duration: Duration::from_secs(75),
            }
        );
    }

    #[test]
    fn daytime_window() {
        let hours = WorkingHours::new(time(6, 0, 0), time(20, 0, 0));

        assert!(hours.contains(time(6, 0, 0)));
        assert!(hours.contains(time(12, 0, 0)));
        assert!(!hours.contains(time(20, 0, 0)));
        assert!(!hours.contains(time(5, 59, 59)));
    }

    #[test]
    fn overnight_window() {
        let hours = WorkingHours::new(time(20, 0, 0), time(6, 0, 0));

        assert_eq!(hours.gate(at(2, 0, 0)), None);

        let now = at(10, 0, 0);
        assert_eq!(
            hours.gate(now),
            Some(ScheduleDecision::Shutdown {
                wake_at: at(20, 0, 0),
                duration: Duration::from_secs(10 * 3600),
            })
        );
    }

    #[test]
    fn next_wake_up_rolls_over_to_tomorrow() {
        let hours = WorkingHours::new(time(6, 0, 0), time(20, 0, 0));

        let wake_at = hours.next_wake_up(at(21, 30, 0));

        assert_eq!(wake_at, at(6, 0, 0) + TimeDelta::days(1));
        assert!(matches!(
            hours.gate(at(21, 30, 0)),
            Some(ScheduleDecision::Shutdown { duration, .. })
                if duration == Duration::from_secs(8 * 3600 + 30 * 60)
        ));
    }

    #[test]
    fn equal_times_mean_always_on_duty() {
        let hours = WorkingHours::new(time(7, 0, 0), time(7, 0, 0));
        assert_eq!(hours.gate(at(3, 0, 0)), None);
        assert_eq!(hours.gate(at(7, 0, 0)), None);
    }
}
