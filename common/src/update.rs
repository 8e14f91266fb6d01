use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigStore, OperatingConfig},
    error::ConfigError,
};

pub const ACK_OK: &str = "config-ok";
pub const ACK_NOK_PREFIX: &str = "config-nok|";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdateResult {
    pub accepted: bool,
    pub message: String,
}

impl ConfigUpdateResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: ACK_OK.to_string(),
        }
    }

    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        Self {
            accepted: false,
            message: format!("{ACK_NOK_PREFIX}{reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    TimedOut,
    /// The oldest pending result. It stays pending until `take_pending`.
    Signaled(ConfigUpdateResult),
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<VecDeque<ConfigUpdateResult>>,
    signal: Condvar,
}

/// Receives configuration payloads on the transport's thread, persists the
/// valid ones, and hands the outcome to the cycle loop. Clones share state:
/// the transport keeps one, the orchestrator another.
#[derive(Debug, Clone)]
pub struct ConfigUpdateChannel {
    store: ConfigStore,
    shared: Arc<Shared>,
}

impl ConfigUpdateChannel {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Never panics on bad input; every payload ends in a raised signal.
    pub fn on_payload_received(&self, payload: &[u8]) {
        let result = match self.apply(payload) {
            Ok(config) => {
                info!(
                    "config update saved to {}: mode={} period={} quality={}",
                    self.store.path().display(),
                    config.mode.as_str(),
                    config.period,
                    config.quality.as_str()
                );
                ConfigUpdateResult::accepted()
            }
            Err(UpdateError::Invalid(ConfigError::Parse(reason))) => {
                warn!("invalid JSON received on config topic: {reason}");
                ConfigUpdateResult::rejected(format!("Invalid JSON received: {reason}"))
            }
            Err(UpdateError::Invalid(err)) => {
                warn!("rejected config update: {err}");
                ConfigUpdateResult::rejected(err)
            }
            Err(UpdateError::Persist(err)) => {
                error!("validated config update could not be saved: {err}");
                ConfigUpdateResult::rejected(err)
            }
        };

        self.raise(result);
    }

    /// Consumes the oldest pending result. Results come out in arrival order,
    /// each exactly once; the signal clears when none are left.
    pub fn take_pending(&self) -> Option<ConfigUpdateResult> {
        self.lock().pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Blocks until a result is pending or `timeout` passes. Returns at once if
    /// one is already pending.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();

        loop {
            if let Some(result) = pending.front() {
                return WaitOutcome::Signaled(result.clone());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }

            pending = match self.shared.signal.wait_timeout(pending, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn apply(&self, payload: &[u8]) -> Result<OperatingConfig, UpdateError> {
        let config = OperatingConfig::from_slice(payload).map_err(UpdateError::Invalid)?;
        self.store.save(&config).map_err(UpdateError::Persist)?;
        Ok(config)
    }

    fn raise(&self, result: ConfigUpdateResult) {
        let mut pending = self.lock();
        pending.push_back(result);
        if pending.len() > 1 {
            debug!("{} config updates awaiting acknowledgment", pending.len());
        }
        self.shared.signal.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ConfigUpdateResult>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
enum UpdateError {
    Invalid(ConfigError),
    Persist(crate::error::PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperatingMode, Quality};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::thread;
    use tempfile::TempDir;

    fn channel(dir: &TempDir) -> ConfigUpdateChannel {
        ConfigUpdateChannel::new(ConfigStore::new(dir.path().join("config.json")))
    }

    fn valid_payload() -> Vec<u8> {
        json!({
            "quality": "HD",
            "mode": "periodic",
            "period": 300,
            "wakeUpTime": "06:00:00",
            "shutDownTime": "20:00:00"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_update_is_persisted_and_acknowledged() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        channel.on_payload_received(&valid_payload());

        assert_eq!(channel.take_pending(), Some(ConfigUpdateResult::accepted()));
        assert_eq!(channel.take_pending(), None);

        let saved = ConfigStore::new(dir.path().join("config.json"))
            .load()
            .unwrap();
        assert_eq!(saved.quality, Quality::Low);
        assert_eq!(saved.mode, OperatingMode::Periodic);
        assert_eq!(saved.period, 300);
    }

    #[test]
    fn rejected_update_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);
        channel.on_payload_received(&valid_payload());
        channel.take_pending();
        let before = std::fs::read(dir.path().join("config.json")).unwrap();

        let payload = json!({
            "quality": "4K",
            "mode": "periodic",
            "wakeUpTime": "06:00:00",
            "shutDownTime": "20:00:00"
        });
        channel.on_payload_received(payload.to_string().as_bytes());

        let result = channel.take_pending().unwrap();
        assert!(!result.accepted);
        assert!(result.message.starts_with("config-nok|"), "{}", result.message);
        assert_eq!(std::fs::read(dir.path().join("config.json")).unwrap(), before);
    }

    #[test]
    fn garbage_payload_is_rejected_not_fatal() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        channel.on_payload_received(&[0xff, 0x00, b'{']);

        let result = channel.take_pending().unwrap();
        assert!(!result.accepted);
        assert!(result.message.starts_with("config-nok|Invalid JSON received"));
        assert!(!dir.path().join("config.json").exists());
    }

    #[test]
    fn wait_times_out_without_update() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        let started = Instant::now();
        assert_eq!(channel.wait(Duration::from_millis(50)), WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn update_interrupts_long_sleep() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);
        let listener = channel.clone();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            listener.on_payload_received(&valid_payload());
        });

        let started = Instant::now();
        let outcome = channel.wait(Duration::from_secs(60));
        let waited = started.elapsed();
        sender.join().unwrap();

        assert_eq!(outcome, WaitOutcome::Signaled(ConfigUpdateResult::accepted()));
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
        assert_eq!(channel.take_pending(), Some(ConfigUpdateResult::accepted()));
        assert_eq!(channel.take_pending(), None);
    }

    #[test]
    fn pending_result_short_circuits_wait() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);
        channel.on_payload_received(b"[]");

        let outcome = channel.wait(Duration::from_secs(60));

        assert!(matches!(outcome, WaitOutcome::Signaled(ref result) if !result.accepted));
        assert!(channel.has_pending());
    }

    #[test]
    fn every_update_is_kept_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let channel = channel(&dir);

        channel.on_payload_received(&valid_payload());
        channel.on_payload_received(b"not json");

        assert_eq!(
            channel.wait(Duration::from_secs(60)),
            WaitOutcome::Signaled(ConfigUpdateResult::accepted())
        );
        assert_eq!(channel.take_pending(), Some(ConfigUpdateResult::accepted()));
        let second = channel.take_pending().unwrap();
        assert!(second.message.starts_with("config-nok|Invalid JSON received"));
        assert_eq!(channel.take_pending(), None);
    }

    #[test]
    fn failed_save_is_rejected() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let channel = ConfigUpdateChannel::new(ConfigStore::new(blocker.join("config.json")));

        channel.on_payload_received(&valid_payload());

        let result = channel.take_pending().unwrap();
        assert!(!result.accepted);
        assert!(
            result.message.starts_with("config-nok|failed to write"),
            "{}",
            result.message
        );
    }
}
