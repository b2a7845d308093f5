/*!
Mock MQTT client for broker-free development.

Records every published message, tracks subscriptions, and can simulate
inbound deliveries through a channel, so publisher and receiver logic can
be exercised without a running broker.
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Stand-in for `rumqttc::AsyncClient` with the same publish/subscribe
/// surface.
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the channel simulated inbound messages are delivered on.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Records a publish (compatible with the AsyncClient signature).
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        self.published_messages.lock().unwrap().push(message.clone());

        log::info!("[MOCK] published to {}: {} bytes", message.topic, message.payload.len());
        Ok(())
    }

    /// Records a subscription (compatible with the AsyncClient signature).
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        self.subscriptions.lock().unwrap().push(topic.clone());
        log::info!("[MOCK] subscribed to {}", topic);
        Ok(())
    }

    /// Simulates an inbound delivery, as the broker would hand it to a
    /// subscriber.
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        }

        log::info!("[MOCK] simulated incoming: {}", message.topic);
        Ok(())
    }

    /// All recorded publishes, for test assertions.
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// All recorded subscriptions, for test assertions.
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Recorded publishes on one topic.
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the latest message on a topic as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Drops every recorded message and subscription.
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Builders for payloads matching the vigil topic contracts.
pub struct VigilMessageBuilder;

impl VigilMessageBuilder {
    /// A full telemetry snapshot with a pinned timestamp.
    pub fn snapshot<S: Into<String>>(device_id: S, timestamp: S) -> Value {
        let device_id = device_id.into();
        serde_json::json!({
            "timestamp": timestamp.into(),
            "device_id": device_id,
            "system": Self::system("test-host"),
            "network": Self::network("test-host", "192.168.1.20"),
            "resources": Self::resources(12.5, 48.0, 61.3),
        })
    }

    /// A full telemetry snapshot stamped with the current time.
    pub fn snapshot_now<S: Into<String>>(device_id: S) -> Value {
        let now = chrono::Utc::now().to_rfc3339();
        Self::snapshot(device_id.into(), now)
    }

    /// A `system` section payload.
    pub fn system<S: Into<String>>(hostname: S) -> Value {
        serde_json::json!({
            "os_name": "Linux",
            "os_version": "6.1",
            "os_release": "6.1.0-test",
            "device_version": "0.1.0",
            "runtime_version": "0.1.0",
            "hostname": hostname.into(),
            "processor": "test-cpu",
            "architecture": "x86_64"
        })
    }

    /// A `network` section payload.
    pub fn network<S: Into<String>>(hostname: S, ip_address: S) -> Value {
        serde_json::json!({
            "hostname": hostname.into(),
            "ip_address": ip_address.into()
        })
    }

    /// A `resources` section payload.
    pub fn resources(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Value {
        serde_json::json!({
            "cpu_percent": cpu_percent,
            "memory_percent": memory_percent,
            "memory_used_mb": 3072.0,
            "memory_total_mb": 8192.0,
            "disk_percent": disk_percent,
            "disk_used_gb": 98.0,
            "disk_total_gb": 256.0
        })
    }
}
