/*!
# Vigil DevKit - Stubs and Test Utilities

Development support for the Vigil telemetry pipeline:
- MQTT stubs for working without a broker
- Payload builders for the vigil topic contracts
- Assertion helpers for publish/subscribe tests
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMqttClient, VigilMessageBuilder};
pub use test_utils::TestHarness;
