use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use tokio::{runtime::Handle, sync::oneshot};
use tracing::{info, warn};

use solarcam_common::{
    load_startup_config, CalibrationStore, CollaboratorError, ConfigStore, ConfigUpdateChannel,
    CycleOrchestrator, Devices, Notify, RunExit, Scheduler, SchedulerConfig, TOPIC_CONFIG_ACK,
    TOPIC_CONFIG_SET,
};

use crate::{
    capture::{CommandCapture, SensorPaths},
    system::{RtcPower, SystemClock},
};

// Base64 frames at 4K run to several megabytes.
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

struct Settings {
    data_dir: PathBuf,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_user: String,
    mqtt_pass: String,
    client_id: String,
    capture_command: String,
    rtc_device: String,
    sensors: SensorPaths,
    publish_timeout: Duration,
}

impl Settings {
    fn from_env() -> Self {
        let mut sensors = SensorPaths::default();
        if let Ok(path) = std::env::var("SOLARCAM_BATTERY_UEVENT") {
            sensors.battery_uevent = PathBuf::from(path);
        }

        Self {
            data_dir: std::env::var("SOLARCAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.solarcam")),
            mqtt_host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: std::env::var("MQTT_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(1883),
            mqtt_user: std::env::var("MQTT_USER").unwrap_or_default(),
            mqtt_pass: std::env::var("MQTT_PASS").unwrap_or_default(),
            client_id: std::env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "solarcam-node".to_string()),
            capture_command: std::env::var("SOLARCAM_CAPTURE_CMD")
                .unwrap_or_else(|_| "rpicam-still".to_string()),
            rtc_device: std::env::var("SOLARCAM_RTC_DEVICE").unwrap_or_else(|_| "rtc0".to_string()),
            sensors,
            publish_timeout: std::env::var("MQTT_PUBLISH_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5)),
        }
    }
}

/// Pairs QoS 1 publishes with their PUBACKs. The event loop sends requests in
/// the order they were queued, so waiters are matched to packet ids FIFO.
#[derive(Clone, Default)]
struct PublishTracker {
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Default)]
struct TrackerState {
    queued: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl PublishTracker {
    /// Must be called before the publish is queued on the client.
    fn register(&self) -> oneshot::Receiver<()> {
        let (confirm, confirmed) = oneshot::channel();
        self.lock().queued.push_back(confirm);
        confirmed
    }

    /// Drops the newest waiter after its publish failed to queue.
    fn cancel_last(&self) {
        self.lock().queued.pop_back();
    }

    fn on_sent(&self, pkid: u16) {
        let mut state = self.lock();
        if let Some(confirm) = state.queued.pop_front() {
            state.in_flight.insert(pkid, confirm);
        }
    }

    fn on_acked(&self, pkid: u16) {
        if let Some(confirm) = self.lock().in_flight.remove(&pkid) {
            let _ = confirm.send(());
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Publishes from the blocking cycle loop onto the async MQTT client and waits
/// for the broker to confirm delivery.
#[derive(Clone)]
struct MqttNotify {
    client: AsyncClient,
    tracker: PublishTracker,
    timeout: Duration,
    runtime: Handle,
}

impl Notify for MqttNotify {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), CollaboratorError> {
        let confirmed = self.tracker.register();
        self.runtime.block_on(async {
            if let Err(err) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
                .await
            {
                self.tracker.cancel_last();
                return Err(CollaboratorError::from(err));
            }

            match tokio::time::timeout(self.timeout, confirmed).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(CollaboratorError::from(format!(
                    "{topic} publish was dropped before the broker confirmed it"
                ))),
                Err(_) => Err(CollaboratorError::from(format!(
                    "broker did not confirm {topic} publish within {:.1}s",
                    self.timeout.as_secs_f64()
                ))),
            }
        })
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();

    let mut mqtt_options =
        MqttOptions::new(settings.client_id.clone(), settings.mqtt_host.clone(), settings.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    if !settings.mqtt_user.is_empty() {
        mqtt_options.set_credentials(settings.mqtt_user.clone(), settings.mqtt_pass.clone());
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let updates = ConfigUpdateChannel::new(ConfigStore::new(settings.data_dir.join("config.json")));
    let tracker = PublishTracker::default();
    spawn_mqtt_loop(mqtt.clone(), updates.clone(), tracker.clone(), eventloop);

    let notify = MqttNotify {
        client: mqtt.clone(),
        tracker,
        timeout: settings.publish_timeout,
        runtime: Handle::current(),
    };

    info!(
        "solarcam node starting, data in {}, broker {}:{}",
        settings.data_dir.display(),
        settings.mqtt_host,
        settings.mqtt_port
    );

    let exit = tokio::task::spawn_blocking(move || run_cycle_loop(settings, updates, notify))
        .await
        .context("cycle loop panicked")?;

    match exit {
        RunExit::SingleShotComplete => info!("single shot complete"),
        RunExit::PoweringOff { wake_at } => info!("powering off, next wake-up at {wake_at}"),
    }

    if let Err(err) = mqtt.disconnect().await {
        warn!("mqtt disconnect failed: {err}");
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

fn run_cycle_loop(settings: Settings, updates: ConfigUpdateChannel, notify: MqttNotify) -> RunExit {
    let config = load_startup_config(updates.store(), &notify, TOPIC_CONFIG_ACK);
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        config.period,
        CalibrationStore::new(settings.data_dir.join("state_file.json")),
    );

    let devices = Devices {
        clock: SystemClock,
        power: RtcPower::new(settings.rtc_device),
        capture: CommandCapture::new(settings.capture_command, settings.sensors, notify.clone()),
        notify,
    };

    CycleOrchestrator::new(devices, updates, scheduler, config, TOPIC_CONFIG_ACK).run()
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    updates: ConfigUpdateChannel,
    tracker: PublishTracker,
    mut eventloop: rumqttc::EventLoop,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic == TOPIC_CONFIG_SET {
                        let updates = updates.clone();
                        let payload = message.payload.to_vec();
                        // Validation and the atomic file write block.
                        if let Err(err) = tokio::task::spawn_blocking(move || {
                            updates.on_payload_received(&payload)
                        })
                        .await
                        {
                            warn!("config update handling failed: {err}");
                        }
                    } else {
                        warn!("ignoring message on unexpected topic {}", message.topic);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Clean sessions drop subscriptions on every reconnect.
                    if let Err(err) = mqtt.try_subscribe(TOPIC_CONFIG_SET, QoS::AtLeastOnce) {
                        warn!("failed to subscribe to {TOPIC_CONFIG_SET}: {err}");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => tracker.on_sent(pkid),
                Ok(Event::Incoming(Incoming::PubAck(ack))) => tracker.on_acked(ack.pkid),
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
