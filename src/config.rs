use std::net::SocketAddr;
use std::path::PathBuf;

/// Master-side configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address the worker gateway listens on.
    pub listen_addr: SocketAddr,
    /// Shared bearer secret workers must present in their hello frame.
    pub secret: String,
    /// Per-connection outbound queue depth. Sends beyond this fail fast
    /// with WorkerUnreachable instead of blocking the caller.
    pub send_queue_depth: usize,
    /// How long the gateway waits for a worker's tunnel dial-back.
    pub tunnel_wait_secs: u64,
    /// Intervals pushed to workers via `config` envelopes (seconds).
    pub heartbeat_interval_secs: u64,
    pub monitor_interval_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7300)),
            secret: String::new(),
            send_queue_depth: 128,
            tunnel_wait_secs: 10,
            heartbeat_interval_secs: 5,
            monitor_interval_secs: 3,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr, secret: impl Into<String>) -> Self {
        Self {
            listen_addr,
            secret: secret.into(),
            ..Default::default()
        }
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master gateway address to dial.
    pub master_addr: String,
    pub secret: String,
    /// Root directory holding node_id, pkg_cache/ and instance trees.
    pub work_dir: PathBuf,
    /// Delay before redialing after a failed connection attempt.
    pub dial_retry_secs: u64,
    /// Delay before redialing after an established connection drops.
    pub reconnect_delay_secs: u64,
    /// Initial heartbeat interval; the master may override it live.
    pub heartbeat_interval_secs: u64,
    /// Initial monitor interval; the master may override it live.
    pub monitor_interval_secs: u64,
    /// Outbound report queue depth; reports are dropped when full.
    pub send_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:7300".to_string(),
            secret: String::new(),
            work_dir: PathBuf::from("instances"),
            dial_retry_secs: 5,
            reconnect_delay_secs: 2,
            heartbeat_interval_secs: 5,
            monitor_interval_secs: 3,
            send_queue_depth: 64,
        }
    }
}

impl WorkerConfig {
    pub fn new(master_addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.port(), 7300);
        assert_eq!(cfg.send_queue_depth, 128);
        assert_eq!(cfg.tunnel_wait_secs, 10);
        assert_eq!(cfg.heartbeat_interval_secs, 5);
        assert_eq!(cfg.monitor_interval_secs, 3);
    }

    #[test]
    fn master_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr, "s3cret");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.secret, "s3cret");
        assert_eq!(cfg.send_queue_depth, 128);
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.master_addr, "127.0.0.1:7300");
        assert_eq!(cfg.dial_retry_secs, 5);
        assert_eq!(cfg.reconnect_delay_secs, 2);
        assert_eq!(cfg.work_dir, PathBuf::from("instances"));
    }

    #[test]
    fn worker_config_builder() {
        let cfg = WorkerConfig::new("master.internal:7300", "s").with_work_dir("/var/lib/opsfleet");
        assert_eq!(cfg.master_addr, "master.internal:7300");
        assert_eq!(cfg.work_dir, PathBuf::from("/var/lib/opsfleet"));
    }
}
