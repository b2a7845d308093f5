//! One-shot broker connectivity probe.
//!
//! Answers "can I currently reach this broker with these credentials?"
//! for candidate settings without disturbing the running publisher: the
//! probe connects under its own uniquely suffixed client id, waits for the
//! connection acknowledgment under a hard timeout, and tears the probe
//! connection down whatever the verdict.

use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub reachable: bool,
    pub message: String,
}

pub async fn probe_broker(
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> ProbeReport {
    let token = Uuid::new_v4().simple().to_string();
    let probe_id = format!("vigil-probe-{}", &token[..8]);
    info!("probing {host}:{port} as {probe_id}");

    let mut options = MqttOptions::new(&probe_id, host, port);
    options.set_keep_alive(Duration::from_secs(5));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (username, password) {
        options.set_credentials(username, password);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let verdict = tokio::time::timeout(PROBE_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(format!("broker refused the connection: {:?}", ack.code));
                }
                Ok(_) => {}
                Err(e) => return Err(format!("connection failed: {e}")),
            }
        }
    })
    .await;

    // Release the probe connection on every path; a short drain lets a
    // successful session say goodbye before the socket drops.
    let _ = client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_millis(250), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    drop(eventloop);

    match verdict {
        Ok(Ok(())) => ProbeReport {
            reachable: true,
            message: format!("Successfully connected to {host}:{port}"),
        },
        Ok(Err(message)) => ProbeReport {
            reachable: false,
            message,
        },
        Err(_) => ProbeReport {
            reachable: false,
            message: format!("No response from {host}:{port} within {PROBE_TIMEOUT:?}"),
        },
    }
}
