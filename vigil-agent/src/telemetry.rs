//! Host telemetry collection.
//!
//! Produces point-in-time snapshots of system identity, network identity
//! and resource usage. Collection never fails: anything that cannot be
//! determined degrades to a placeholder (or, for the network block, an
//! error record) so a partially-broken host still reports.

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// One point-in-time capture of everything the agent publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: String,
    pub device_id: String,
    pub system: SystemFacts,
    pub network: NetworkFacts,
    pub resources: ResourceFacts,
}

/// OS and hardware identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFacts {
    pub os_name: String,
    pub os_version: String,
    pub os_release: String,
    pub device_version: String,
    pub runtime_version: String,
    pub hostname: String,
    pub processor: String,
    pub architecture: String,
}

/// Network identity, or the reason it could not be determined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkFacts {
    Known { hostname: String, ip_address: String },
    Unavailable { error: String },
}

/// Resource usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFacts {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_percent: f32,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

impl TelemetrySnapshot {
    /// Collects a fresh snapshot. Takes ~200ms: CPU usage needs two
    /// refreshes with a delay between them to be meaningful.
    pub async fn collect(device_id: &str) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        sys.refresh_cpu_usage();

        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            device_id: device_id.to_string(),
            system: SystemFacts::collect(&sys),
            network: NetworkFacts::discover(),
            resources: ResourceFacts::collect(&sys),
        }
    }
}

impl SystemFacts {
    fn collect(sys: &System) -> Self {
        let processor = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());

        Self {
            os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
            os_release: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            device_version: std::env::var("DEVICE_VERSION")
                .unwrap_or_else(|_| "0.1.0".to_string()),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: local_hostname(),
            processor,
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

impl NetworkFacts {
    /// Resolves the host's name and primary IP address. Prefers IPv4 on a
    /// non-loopback interface, falls back to IPv6.
    pub fn discover() -> Self {
        let hostname = local_hostname();

        let if_addrs = match if_addrs::get_if_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                return NetworkFacts::Unavailable {
                    error: format!("failed to enumerate network interfaces: {e}"),
                }
            }
        };

        let mut fallback_v6 = None;
        for if_addr in &if_addrs {
            if if_addr.is_loopback() {
                continue;
            }
            match if_addr.addr {
                if_addrs::IfAddr::V4(ref v4) => {
                    return NetworkFacts::Known {
                        hostname,
                        ip_address: v4.ip.to_string(),
                    };
                }
                if_addrs::IfAddr::V6(ref v6) => {
                    fallback_v6.get_or_insert_with(|| v6.ip.to_string());
                }
            }
        }

        match fallback_v6 {
            Some(ip_address) => NetworkFacts::Known { hostname, ip_address },
            None => NetworkFacts::Unavailable {
                error: "no non-loopback network interface found".to_string(),
            },
        }
    }
}

impl ResourceFacts {
    fn collect(sys: &System) -> Self {
        let total_bytes = sys.total_memory();
        let used_bytes = sys.used_memory();
        let memory_percent = if total_bytes > 0 {
            (used_bytes as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };

        let (disk_total, disk_used) = root_disk_usage();
        let disk_percent = if disk_total > 0 {
            (disk_used as f32 / disk_total as f32) * 100.0
        } else {
            0.0
        };

        const MB: f64 = 1024.0 * 1024.0;
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;

        Self {
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            memory_percent,
            memory_used_mb: used_bytes as f64 / MB,
            memory_total_mb: total_bytes as f64 / MB,
            disk_percent,
            disk_used_gb: disk_used as f64 / GB,
            disk_total_gb: disk_total as f64 / GB,
        }
    }
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Total and used bytes for the root filesystem; when no disk is mounted
/// exactly at "/" (e.g. some containers), sums every listed disk instead.
fn root_disk_usage() -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();

    for disk in disks.list() {
        if disk.mount_point() == std::path::Path::new("/") {
            let total = disk.total_space();
            return (total, total.saturating_sub(disk.available_space()));
        }
    }

    let mut total = 0u64;
    let mut available = 0u64;
    for disk in disks.list() {
        total += disk.total_space();
        available += disk.available_space();
    }
    (total, total.saturating_sub(available))
}
