//! Vigil Agent - Edge device telemetry publisher
//!
//! Collects host telemetry (CPU, memory, disk, network, OS identity) and
//! publishes it to an MQTT broker on a fixed cadence:
//! - Connection parameters from the environment, overridden by the device
//!   settings store when present
//! - Four topics per tick: system / network / resources / full
//! - start / stop / reconfigure driven by the management surface
//! - One-shot connectivity probe for candidate broker settings

mod config;
mod probe;
mod publisher;
mod settings;
mod telemetry;

#[cfg(test)]
mod testsupport;

use anyhow::{Context, Result};
use config::BrokerSettings;
use publisher::PublisherService;
use settings::SettingsStore;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    info!("vigil agent starting...");

    let store = match SettingsStore::open_default() {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("settings store unavailable, using environment only: {e}");
            None
        }
    };

    let mut broker_settings = BrokerSettings::from_env();
    let mut client_id = None;
    if let Some(store) = &store {
        broker_settings.apply_store(store);
        client_id = store.get("mqtt_client_id").filter(|id| !id.is_empty());
    }

    // `vigil-agent probe` checks the configured broker and exits; the
    // settings surface shells out to this to vet candidate settings.
    if std::env::args().nth(1).as_deref() == Some("probe") {
        let report = probe::probe_broker(
            &broker_settings.host,
            broker_settings.port,
            broker_settings.username.as_deref(),
            broker_settings.password.as_deref(),
        )
        .await;
        info!("{}", report.message);
        std::process::exit(if report.reachable { 0 } else { 1 });
    }

    // The service is owned here and handed by reference to whatever control
    // surface needs start/stop/reconfigure access.
    let service = PublisherService::new(broker_settings, client_id)
        .context("broker settings are invalid")?;
    info!("publisher configured (client id {})", service.client_id());

    let enabled = store
        .as_ref()
        .and_then(|s| s.get_bool("mqtt_enabled"))
        .unwrap_or(true);
    if enabled {
        service.start().await;
    } else {
        info!("mqtt_enabled is false, publisher idle until reconfigured");
    }

    wait_for_shutdown(&service, store.as_ref()).await?;
    info!("shutdown signal received");
    service.stop().await;

    Ok(())
}

/// Blocks until ctrl-c. On Unix, SIGHUP re-reads the settings store and
/// reconfigures the running publisher; this is how the management surface
/// commands a reload.
#[cfg(unix)]
async fn wait_for_shutdown(service: &PublisherService, store: Option<&SettingsStore>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install the reload handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("failed to listen for the shutdown signal");
            }
            _ = hangup.recv() => {
                info!("reload signal received");
                reload(service, store).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_service: &PublisherService, _store: Option<&SettingsStore>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")
}

#[cfg(unix)]
async fn reload(service: &PublisherService, store: Option<&SettingsStore>) {
    let mut next = BrokerSettings::from_env();
    if let Some(store) = store {
        if let Err(e) = store.reload() {
            warn!("settings reload failed, keeping the current configuration: {e}");
            return;
        }
        next.apply_store(store);
    }

    let enabled = store.and_then(|s| s.get_bool("mqtt_enabled")).unwrap_or(true);
    if !enabled {
        if service.is_running() {
            service.stop().await;
            info!("mqtt_enabled is false, publisher stopped");
        }
        return;
    }

    match service.reconfigure(next).await {
        Ok(()) => {
            let settings = service.settings();
            info!(
                "publisher now targeting {}:{} under {}",
                settings.host, settings.port, settings.topic_prefix
            );
        }
        Err(e) => warn!("reconfigure rejected: {e}"),
    }
}
