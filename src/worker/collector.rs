//! Host metrics collection for registration and heartbeats.

use std::net::{IpAddr, UdpSocket};
use std::time::Instant;

use sysinfo::{Disks, Networks, System};
use tracing::debug;

use crate::protocol::messages::{NodeInfo, NodeStatus};

/// The address is never contacted; a connected UDP socket just makes the OS
/// pick the interface (and thus the source address) it would route through.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

pub struct Collector {
    sys: System,
    networks: Networks,
    last_net_sample: Instant,
}

impl Collector {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            last_net_sample: Instant::now(),
        }
    }

    /// MAC of the interface carrying the outbound IP, falling back to the
    /// first interface with a non-zero MAC.
    fn mac_addr(&self, ip: Option<IpAddr>) -> String {
        if let Some(ip) = ip {
            for (_, data) in &self.networks {
                if data.ip_networks().iter().any(|n| n.addr == ip) {
                    return data.mac_address().to_string();
                }
            }
        }
        self.networks
            .list()
            .values()
            .map(|data| data.mac_address())
            .find(|mac| mac.0 != [0u8; 6])
            .map(|mac| mac.to_string())
            .unwrap_or_default()
    }

    pub fn node_info(&mut self, node_id: &str) -> NodeInfo {
        self.sys.refresh_memory();
        self.networks.refresh();

        let ip = outbound_ip();
        let disks = Disks::new_with_refreshed_list();
        let disk_total = disks.list().iter().map(|d| d.total_space()).sum();

        NodeInfo {
            id: node_id.to_string(),
            ip: ip.map(|i| i.to_string()).unwrap_or_default(),
            hostname: System::host_name().unwrap_or_default(),
            mac_addr: self.mac_addr(ip),
            os: format!(
                "{} {}",
                System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
                System::os_version().unwrap_or_default()
            )
            .trim()
            .to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores: self.sys.cpus().len(),
            mem_total: self.sys.total_memory() / (1024 * 1024),
            disk_total,
        }
    }

    pub fn node_status(&mut self) -> NodeStatus {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        // Per-interface counters reset on each refresh, so refresh cadence
        // defines the sampling window.
        self.networks.refresh();
        let elapsed = self.last_net_sample.elapsed().as_secs_f64().max(0.001);
        self.last_net_sample = Instant::now();
        let (rx, tx) = self
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(r, t), data| {
                (r + data.received(), t + data.transmitted())
            });

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_avail) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
        let disk_usage = if disk_total > 0 {
            (disk_total - disk_avail) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        let mem_total = self.sys.total_memory();
        let status = NodeStatus {
            cpu_usage: self.sys.global_cpu_usage() as f64,
            mem_usage: if mem_total > 0 {
                self.sys.used_memory() as f64 / mem_total as f64 * 100.0
            } else {
                0.0
            },
            disk_usage,
            net_in_speed: rx as f64 / elapsed / 1024.0,
            net_out_speed: tx as f64 / elapsed / 1024.0,
            uptime: System::uptime(),
            time: chrono::Utc::now().timestamp(),
        };
        debug!(
            cpu = status.cpu_usage,
            mem = status.mem_usage,
            disk = status.disk_usage,
            "sampled node status"
        );
        status
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_has_sane_shape() {
        let mut c = Collector::new();
        let info = c.node_info("node-1");
        assert_eq!(info.id, "node-1");
        assert!(info.cpu_cores > 0);
        assert!(info.mem_total > 0);
        assert!(!info.arch.is_empty());
    }

    #[test]
    fn node_status_percentages_are_bounded() {
        let mut c = Collector::new();
        let status = c.node_status();
        assert!((0.0..=100.0).contains(&status.mem_usage));
        assert!((0.0..=100.0).contains(&status.disk_usage));
        assert!(status.time > 0);
    }
}
