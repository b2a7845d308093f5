//! Vigil Receiver - Telemetry storage service
//!
//! Subscribes to the device telemetry topic subtree and persists every
//! message it is handed: one line per message, one file per
//! (device, day, topic suffix). Malformed payloads are logged and dropped;
//! nothing a single message does can take the subscription down.

mod store;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use store::RecordStore;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Receiver-side connection parameters, environment-driven.
#[derive(Debug, Clone)]
struct ReceiverConfig {
    broker_host: String,
    broker_port: u16,
    username: Option<String>,
    password: Option<String>,
    topic: String,
    client_id: String,
    data_dir: String,
}

impl ReceiverConfig {
    fn from_env() -> Self {
        let broker_port = std::env::var("MQTT_BROKER_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(1883);

        Self {
            broker_host: env_or("MQTT_BROKER_HOST", "mosquitto"),
            broker_port,
            username: std::env::var("MQTT_USERNAME").ok().filter(|v| !v.is_empty()),
            password: std::env::var("MQTT_PASSWORD").ok().filter(|v| !v.is_empty()),
            topic: env_or("MQTT_TOPIC", "iot/device/#"),
            client_id: std::env::var("MQTT_CLIENT_ID").ok().filter(|v| !v.is_empty())
                .unwrap_or_else(generated_client_id),
            data_dir: env_or("DATA_DIR", "/data"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn generated_client_id() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("vigil-receiver-{}", &token[..8])
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = ReceiverConfig::from_env();
    let record_store = RecordStore::new(&config.data_dir);

    info!(
        "connecting to MQTT broker at {}:{} as {}...",
        config.broker_host, config.broker_port, config.client_id
    );

    let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);

    info!("starting receiver loop, storing under {}", config.data_dir);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!(
                        "connected to MQTT broker at {}:{}",
                        config.broker_host, config.broker_port
                    );
                    // Re-subscribe on every (re)connect: sessions are clean.
                    match client.subscribe(config.topic.as_str(), QoS::AtLeastOnce).await {
                        Ok(()) => info!("subscribed to topic: {}", config.topic),
                        Err(e) => error!("failed to subscribe to {}: {e}", config.topic),
                    }
                } else {
                    error!("broker refused the connection: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                handle_message(&record_store, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Persists one inbound message. Every failure is logged and swallowed:
/// the subscription loop must survive anything a message can throw at it.
fn handle_message(record_store: &RecordStore, topic: &str, payload: &[u8]) {
    info!("received message on topic {topic}");
    match record_store.record(topic, payload) {
        Ok(path) => debug!("stored message from {topic} at {path:?}"),
        Err(e) => error!("error processing message on {topic}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_devkit::{MockMqttClient, VigilMessageBuilder};

    #[tokio::test]
    async fn simulated_delivery_flows_into_storage() {
        let dir = tempfile::tempdir().unwrap();
        let record_store = RecordStore::new(dir.path());

        // Drive the handler through the devkit's simulated transport the
        // way the event loop would.
        let mock = MockMqttClient::new();
        let mut inbound = mock.setup_receiver();
        mock.subscribe("iot/device/#", QoS::AtLeastOnce).await.unwrap();

        let snapshot = VigilMessageBuilder::snapshot("abc123", "2023-01-01T12:00:00");
        mock.simulate_incoming(
            "iot/device/abc123/full",
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .await
        .unwrap();

        let message = inbound.recv().await.unwrap();
        handle_message(&record_store, &message.topic, &message.payload);

        let stored = std::fs::read_to_string(
            dir.path().join("abc123").join("2023-01-01_full.jsonl"),
        )
        .unwrap();
        assert_eq!(stored.lines().count(), 1);
        let line: serde_json::Value = serde_json::from_str(stored.lines().next().unwrap()).unwrap();
        assert_eq!(line["device_id"], "abc123");
    }

    #[tokio::test]
    async fn malformed_delivery_is_dropped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let record_store = RecordStore::new(dir.path());

        let mock = MockMqttClient::new();
        let mut inbound = mock.setup_receiver();
        mock.simulate_incoming("iot/device/abc123/system", b"This is not JSON".to_vec())
            .await
            .unwrap();

        let message = inbound.recv().await.unwrap();
        handle_message(&record_store, &message.topic, &message.payload);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn generated_client_ids_are_receiver_scoped() {
        let id = generated_client_id();
        assert!(id.starts_with("vigil-receiver-"));
        assert_ne!(id, generated_client_id());
    }
}
