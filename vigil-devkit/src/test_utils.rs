/*!
Test harness for the Vigil pipeline.

Wraps the mock MQTT client with:
- Expectations on published message counts
- Assertions on recorded payloads and their fields
- Simulated inbound telemetry
*/

use crate::mqtt_stub::{MockMqttClient, VigilMessageBuilder};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Transport-free test environment for publisher and receiver logic.
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Logging for tests

        Self {
            mqtt_client: MockMqttClient::new(),
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` messages on `topic` by the time
    /// [`Self::verify_expectations`] runs.
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Simulates an inbound full-snapshot delivery for `device_id`.
    pub async fn send_snapshot(&self, topic_prefix: &str, device_id: &str) -> Result<()> {
        let payload = VigilMessageBuilder::snapshot_now(device_id);
        let topic = format!("{topic_prefix}/{device_id}/full");
        self.mqtt_client
            .simulate_incoming(topic, serde_json::to_vec(&payload)?)
            .await?;
        log::info!("sent simulated snapshot for device {device_id}");
        Ok(())
    }

    /// Waits until a message shows up on `topic`, or times out.
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        log::warn!("timeout waiting for message on {topic}");
        Ok(None)
    }

    /// Checks every configured expectation against the recorded messages.
    pub async fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let messages = self.mqtt_client.find_messages_by_topic(&expectation.topic);
            let actual_count = messages.len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }

        Ok(())
    }

    /// Asserts that an exact payload was published on `topic`.
    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        let messages = self.mqtt_client.find_messages_by_topic(topic);

        for msg in messages {
            let payload: Value = serde_json::from_slice(&msg.payload)?;
            if payload == *expected_payload {
                return Ok(());
            }
        }

        anyhow::bail!("expected message not found on topic: {}", topic);
    }

    /// Asserts that a (dotted) field path exists in the latest message.
    pub fn assert_field_exists(&self, topic: &str, field_path: &str) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if get_nested_field(&msg, field_path).is_some() {
                return Ok(());
            }
        }

        anyhow::bail!("field '{}' not found in latest message on {}", field_path, topic);
    }

    /// Asserts a (dotted) field path in the latest message equals `expected`.
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = get_nested_field(&msg, field_path) {
                if actual == expected {
                    return Ok(());
                }
                anyhow::bail!(
                    "field '{}' mismatch: expected {:?}, got {:?}",
                    field_path,
                    expected,
                    actual
                );
            }
        }

        anyhow::bail!("field '{}' not found for comparison in {}", field_path, topic);
    }

    /// Per-topic message counts for quick diagnostics.
    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }

    /// Resets the harness for the next test.
    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}
