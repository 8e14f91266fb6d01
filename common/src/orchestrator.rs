use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::{
    config::{ConfigStore, OperatingConfig},
    device::{Capture, Clock, Devices, Notify, Power},
    schedule::{ScheduleDecision, Scheduler},
    types::OperatingMode,
    update::{ConfigUpdateChannel, ConfigUpdateResult, WaitOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    SingleShotComplete,
    PoweringOff { wake_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Finished(RunExit),
}

/// Loads the operator config, falling back to the defaults when the file is
/// unusable. The failure is reported once on `ack_topic`.
pub fn load_startup_config<N: Notify>(
    store: &ConfigStore,
    notify: &N,
    ack_topic: &str,
) -> OperatingConfig {
    match store.load() {
        Ok(config) => config,
        Err(err) => {
            error!(
                "failed to load config from {}, using defaults: {err}",
                store.path().display()
            );
            let message = ConfigUpdateResult::rejected(&err).message;
            if let Err(err) = notify.publish(ack_topic, &message) {
                warn!("failed to report config load failure: {err}");
            }
            OperatingConfig::defaults()
        }
    }
}

pub struct CycleOrchestrator<C, P, K, N> {
    devices: Devices<C, P, K, N>,
    updates: ConfigUpdateChannel,
    scheduler: Scheduler,
    config: OperatingConfig,
    ack_topic: String,
    resume_after_update: bool,
}

impl<C, P, K, N> CycleOrchestrator<C, P, K, N>
where
    C: Clock,
    P: Power,
    K: Capture,
    N: Notify,
{
    pub fn new(
        mut devices: Devices<C, P, K, N>,
        updates: ConfigUpdateChannel,
        mut scheduler: Scheduler,
        config: OperatingConfig,
        ack_topic: impl Into<String>,
    ) -> Self {
        devices.capture.apply_quality(config.quality);
        scheduler.set_period(config.period);

        Self {
            devices,
            updates,
            scheduler,
            config,
            ack_topic: ack_topic.into(),
            resume_after_update: false,
        }
    }

    pub fn config(&self) -> &OperatingConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn devices(&self) -> &Devices<C, P, K, N> {
        &self.devices
    }

    /// Runs until single-shot mode completes or the machine is powering off.
    pub fn run(&mut self) -> RunExit {
        info!(
            "starting in {} mode, period {}s",
            self.config.mode.as_str(),
            self.config.period
        );
        loop {
            if let StepOutcome::Finished(exit) = self.step() {
                return exit;
            }
        }
    }

    /// One iteration of the loop for the current mode. A config update can
    /// change the mode between steps.
    pub fn step(&mut self) -> StepOutcome {
        match self.config.mode {
            OperatingMode::SingleShot => {
                self.apply_pending_update();
                self.capture();
                StepOutcome::Finished(RunExit::SingleShotComplete)
            }
            OperatingMode::AlwaysOn => {
                self.apply_pending_update();
                self.capture();
                StepOutcome::Continue
            }
            OperatingMode::Periodic => self.periodic_cycle(),
        }
    }

    /// Acknowledges every pending config update in arrival order. Accepted
    /// updates reload the file, which always holds the newest accepted config;
    /// a rejected update keeps whatever config is in force at that point.
    pub fn apply_pending_update(&mut self) -> Vec<ConfigUpdateResult> {
        let mut acknowledged = Vec::new();

        while let Some(mut result) = self.updates.take_pending() {
            if result.accepted {
                match self.updates.store().load() {
                    Ok(config) => self.apply_config(config),
                    Err(err) => {
                        error!("accepted config could not be reloaded, keeping previous: {err}");
                        result = ConfigUpdateResult::rejected(err);
                    }
                }
            } else {
                warn!(
                    "config update rejected, keeping previous config: {}",
                    result.message
                );
            }

            if let Err(err) = self.devices.notify.publish(&self.ack_topic, &result.message) {
                warn!("failed to acknowledge config update: {err}");
            }
            acknowledged.push(result);
        }

        acknowledged
    }

    fn periodic_cycle(&mut self) -> StepOutcome {
        if !std::mem::take(&mut self.resume_after_update) {
            let now = self.devices.clock.now();
            if let Some(decision) = self.config.working_hours().gate(now) {
                info!(
                    "{} is outside working hours {}-{}",
                    now.time().format("%H:%M:%S"),
                    self.config.wake_up_time,
                    self.config.shut_down_time
                );
                return self.act(decision);
            }
        }

        self.apply_pending_update();
        if self.config.mode != OperatingMode::Periodic {
            return StepOutcome::Continue;
        }

        let start = self.devices.clock.now();
        self.capture();
        let end = self.devices.clock.now();

        let decision = self.scheduler.decide(start, end);
        self.act(decision)
    }

    fn act(&mut self, decision: ScheduleDecision) -> StepOutcome {
        match decision {
            ScheduleDecision::Shutdown { wake_at, duration } => self.power_off(wake_at, duration),
            ScheduleDecision::SleepInProcess { duration } => self.sleep(duration),
            ScheduleDecision::ContinueImmediately => {
                warn!(
                    "period of {}s is shorter than a capture cycle, starting the next one immediately",
                    self.config.period
                );
                StepOutcome::Continue
            }
        }
    }

    fn power_off(&mut self, wake_at: DateTime<Utc>, duration: Duration) -> StepOutcome {
        info!(
            "shutting down for {:.1} seconds, wake-up scheduled for {wake_at}",
            duration.as_secs_f64()
        );

        if let Err(err) = self.devices.power.schedule_wakeup(wake_at) {
            error!("{err}, refusing to power off without a wake alarm");
            return self.sleep(self.remaining_until(wake_at));
        }
        if let Err(err) = self.devices.power.shutdown() {
            error!("{err}, sleeping in-process until {wake_at} instead");
            return self.sleep(self.remaining_until(wake_at));
        }

        if self.updates.has_pending() {
            info!("config update arrived during shutdown, it takes effect on next boot");
        }
        StepOutcome::Finished(RunExit::PoweringOff { wake_at })
    }

    fn sleep(&mut self, duration: Duration) -> StepOutcome {
        info!("sleeping for {:.1} seconds", duration.as_secs_f64());
        match self.updates.wait(duration) {
            WaitOutcome::TimedOut => {}
            WaitOutcome::Signaled(result) => {
                info!("sleep interrupted by config update: {}", result.message);
                self.resume_after_update = true;
            }
        }
        StepOutcome::Continue
    }

    fn capture(&mut self) {
        let started = std::time::Instant::now();
        match self.devices.capture.capture_and_transmit() {
            Ok(()) => info!(
                "taking a picture and sending it took {:.3} seconds",
                started.elapsed().as_secs_f64()
            ),
            Err(err) => error!("capture and transmit failed: {err}"),
        }
    }

    fn apply_config(&mut self, config: OperatingConfig) {
        if config.mode != self.config.mode {
            info!(
                "switching mode from {} to {}",
                self.config.mode.as_str(),
                config.mode.as_str()
            );
        }
        self.devices.capture.apply_quality(config.quality);
        self.scheduler.set_period(config.period);
        info!(
            "updated configuration: period {}s, quality {}",
            config.period,
            config.quality.as_str()
        );
        self.config = config;
    }

    fn remaining_until(&self, wake_at: DateTime<Utc>) -> Duration {
        (wake_at - self.devices.clock.now())
            .to_std()
            .unwrap_or_default()
    }
}
