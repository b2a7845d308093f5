//! Telemetry publisher service.
//!
//! Owns one broker connection and a background loop that collects a
//! [`TelemetrySnapshot`] and publishes it on a fixed cadence. The control
//! surface (settings UI, provisioning tooling) drives the service through
//! `start` / `stop` / `reconfigure`; those calls serialize against each
//! other so the service can never hold two live connections.

use crate::config::{BrokerSettings, SettingsError};
use crate::telemetry::TelemetrySnapshot;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bound on the initial connect and on the once-per-tick reconnect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `stop` waits for the background loop to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Topic suffixes published on every tick, joined to the topic prefix.
pub const TOPIC_SUFFIXES: [&str; 4] = ["system", "network", "resources", "full"];

/// Transport events, translated out of the MQTT event loop so connection
/// handling is a single linear dispatch instead of registered callbacks.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Delivered(u16),
    MessageReceived { topic: String },
}

impl LinkEvent {
    fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    Some(LinkEvent::Connected)
                } else {
                    Some(LinkEvent::Disconnected)
                }
            }
            Event::Incoming(Incoming::Disconnect) => Some(LinkEvent::Disconnected),
            Event::Incoming(Incoming::PubAck(ack)) => Some(LinkEvent::Delivered(ack.pkid)),
            Event::Incoming(Incoming::Publish(publish)) => Some(LinkEvent::MessageReceived {
                topic: publish.topic.clone(),
            }),
            _ => None,
        }
    }
}

/// Connection state shared between the event loop and the tick logic.
#[derive(Clone, Default)]
struct LinkState {
    connected: Arc<AtomicBool>,
}

impl LinkState {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn apply(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                self.connected.store(true, Ordering::Relaxed);
                info!("connected to MQTT broker");
            }
            LinkEvent::Disconnected => {
                if self.connected.swap(false, Ordering::Relaxed) {
                    warn!("disconnected from MQTT broker");
                }
            }
            LinkEvent::Delivered(pkid) => debug!("message {pkid} acknowledged"),
            LinkEvent::MessageReceived { topic } => {
                debug!("ignoring inbound message on {topic}");
            }
        }
    }
}

/// Connection handle and background task, owned exclusively by the service.
#[derive(Default)]
struct Runtime {
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
}

pub struct PublisherService {
    client_id: String,
    settings: parking_lot::Mutex<BrokerSettings>,
    running: Arc<AtomicBool>,
    // Serializes start/stop/reconfigure so two loops can never coexist.
    control: tokio::sync::Mutex<Runtime>,
}

impl PublisherService {
    /// Creates the service. `client_id` pins the broker identity; when
    /// absent a process-scoped random identity is generated.
    pub fn new(
        settings: BrokerSettings,
        client_id: Option<String>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let client_id = client_id.unwrap_or_else(generated_client_id);
        Ok(Self {
            client_id,
            settings: parking_lot::Mutex::new(settings),
            running: Arc::new(AtomicBool::new(false)),
            control: tokio::sync::Mutex::new(Runtime::default()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> BrokerSettings {
        self.settings.lock().clone()
    }

    /// Spawns the publish loop and returns immediately. Calling while
    /// already running is a logged no-op, not an error.
    pub async fn start(&self) {
        let mut runtime = self.control.lock().await;
        self.start_locked(&mut runtime);
    }

    /// Requests disconnect and waits (bounded) for the loop to exit.
    /// Idempotent.
    pub async fn stop(&self) {
        let mut runtime = self.control.lock().await;
        self.stop_locked(&mut runtime).await;
    }

    /// Replaces the broker settings, tearing the old connection fully down
    /// before the new one opens.
    pub async fn reconfigure(&self, settings: BrokerSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        let mut runtime = self.control.lock().await;
        self.stop_locked(&mut runtime).await;
        *self.settings.lock() = settings;
        self.start_locked(&mut runtime);
        info!("publisher reconfigured");
        Ok(())
    }

    fn start_locked(&self, runtime: &mut Runtime) {
        if self.running.load(Ordering::SeqCst) {
            warn!("publisher is already running");
            return;
        }

        let settings = self.settings.lock().clone();
        let (client, eventloop) = open_client(&self.client_id, &settings);
        self.running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(run_loop(
            client.clone(),
            eventloop,
            settings,
            self.client_id.clone(),
            Arc::clone(&self.running),
        ));
        runtime.client = Some(client);
        runtime.task = Some(task);
        info!("publisher started (client id {})", self.client_id);
    }

    async fn stop_locked(&self, runtime: &mut Runtime) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(client) = runtime.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("disconnect request not deliverable: {e}");
            }
        }

        if let Some(task) = runtime.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(_) => info!("publisher stopped"),
                Err(_) => warn!(
                    "publish loop did not exit within {STOP_TIMEOUT:?}, leaking the task"
                ),
            }
        }
    }
}

fn generated_client_id() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("vigil-{}", &token[..8])
}

fn open_client(client_id: &str, settings: &BrokerSettings) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(client_id, &settings.host, settings.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        options.set_credentials(username, password);
    }
    AsyncClient::new(options, 10)
}

/// Polls the event loop until the broker acknowledges the connection.
/// One attempt: the first transport error or an exceeded deadline fails it.
async fn wait_for_connack(
    eventloop: &mut EventLoop,
    link: &LinkState,
    wait: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Err(_) => anyhow::bail!("no connection acknowledgment within {wait:?}"),
            Ok(Ok(event)) => {
                if let Some(link_event) = LinkEvent::from_event(&event) {
                    let connected = matches!(link_event, LinkEvent::Connected);
                    link.apply(link_event);
                    if connected {
                        return Ok(());
                    }
                }
            }
            Ok(Err(e)) => {
                link.apply(LinkEvent::Disconnected);
                anyhow::bail!("broker connection failed: {e}");
            }
        }
    }
}

/// Background loop: connect, then collect + publish on every interval tick.
/// Every exit path requests a clean disconnect.
async fn run_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    settings: BrokerSettings,
    device_id: String,
    running: Arc<AtomicBool>,
) {
    let link = LinkState::default();

    match wait_for_connack(&mut eventloop, &link, CONNECT_TIMEOUT).await {
        Ok(()) => info!("broker session open at {}:{}", settings.host, settings.port),
        Err(e) => {
            error!("initial broker connect failed: {e}");
            running.store(false, Ordering::SeqCst);
            let _ = client.disconnect().await;
            return;
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.publish_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ticker.tick() => {
                if !link.is_connected() {
                    warn!("not connected to MQTT broker, attempting to reconnect...");
                    if let Err(e) = wait_for_connack(&mut eventloop, &link, CONNECT_TIMEOUT).await {
                        error!("reconnect failed, skipping this tick: {e}");
                        continue;
                    }
                }

                let snapshot = TelemetrySnapshot::collect(&device_id).await;
                let sent = publish_snapshot(&client, &settings.topic_prefix, &snapshot).await;
                debug!("tick published {sent}/{} messages", TOPIC_SUFFIXES.len());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(event) => {
                        if let Some(link_event) = LinkEvent::from_event(&event) {
                            link.apply(link_event);
                        }
                    }
                    Err(e) => {
                        link.apply(LinkEvent::Disconnected);
                        if running.load(Ordering::SeqCst) {
                            warn!("MQTT connection error: {e}");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    }

    let _ = client.disconnect().await;
    info!("publish loop exited");
}

/// The four per-tick payloads: each section on its own topic, plus the
/// whole snapshot on `full`.
fn snapshot_payloads(snapshot: &TelemetrySnapshot) -> serde_json::Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("system", serde_json::to_string(&snapshot.system)?),
        ("network", serde_json::to_string(&snapshot.network)?),
        ("resources", serde_json::to_string(&snapshot.resources)?),
        ("full", serde_json::to_string(snapshot)?),
    ])
}

/// Publishes one snapshot across the topic hierarchy at QoS 1. A failed
/// publish is logged and the remaining topics are still attempted; returns
/// how many messages were accepted by the transport.
async fn publish_snapshot(
    client: &AsyncClient,
    topic_prefix: &str,
    snapshot: &TelemetrySnapshot,
) -> usize {
    let payloads = match snapshot_payloads(snapshot) {
        Ok(payloads) => payloads,
        Err(e) => {
            error!("failed to encode telemetry snapshot: {e}");
            return 0;
        }
    };

    let mut sent = 0;
    for (suffix, payload) in payloads {
        let topic = format!("{topic_prefix}/{suffix}");
        match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
            Ok(()) => {
                debug!("published to {topic}");
                sent += 1;
            }
            Err(e) => warn!("failed to publish to {topic}: {e}"),
        }
    }
    sent
}
