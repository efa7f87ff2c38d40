//! Payload schemas for every envelope kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node identity and metrics
// ---------------------------------------------------------------------------

/// Static identity a worker announces at register time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Persisted UUID, the registry key. Survives reinstalls of the agent
    /// binary but not deletion of the worker root.
    pub id: String,
    pub ip: String,
    pub hostname: String,
    pub mac_addr: String,
    pub os: String,
    pub arch: String,
    pub cpu_cores: usize,
    /// MiB
    pub mem_total: u64,
    /// bytes
    pub disk_total: u64,
}

/// Dynamic node metrics sampled per heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
    /// KB/s
    pub net_in_speed: f64,
    /// KB/s
    pub net_out_speed: f64,
    /// seconds
    pub uptime: u64,
    pub time: i64,
}

/// Payload of `register` and `heartbeat` envelopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub info: NodeInfo,
    pub status: NodeStatus,
}

// ---------------------------------------------------------------------------
// Commands (master -> worker)
// ---------------------------------------------------------------------------

/// Tagged command payload.
///
/// The discriminant field makes dispatch a single decode plus an exhaustive
/// match; a payload that matches none of the variants is a decode error the
/// worker logs and skips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommandPayload {
    StartTunnel(TunnelStartRequest),
    InstanceAction(InstanceActionRequest),
    Deploy(DeployRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Log,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStartRequest {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    Start,
    Stop,
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceActionRequest {
    pub instance_id: String,
    pub action: InstanceAction,
}

/// Deploy a versioned package as a fresh instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub instance_id: String,
    pub system_name: String,
    pub service_name: String,
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Readiness overrides; request values win over packaged defaults.
    #[serde(default)]
    pub readiness_type: String,
    #[serde(default)]
    pub readiness_target: String,
    #[serde(default)]
    pub readiness_timeout: u64,
}

/// Reply payload for correlated `command` envelopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<InstanceStatusReport>,
}

impl CommandResult {
    pub fn success(report: Option<InstanceStatusReport>) -> Self {
        Self {
            ok: true,
            error: None,
            report,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            report: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Status reporting (worker -> master)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatusReport {
    pub instance_id: String,
    pub status: String,
    pub pid: u32,
    /// Process start time, unix seconds; 0 when stopped.
    pub uptime: i64,
    pub cpu_usage: f64,
    /// MiB resident
    pub mem_usage: u64,
    /// KB/s
    pub io_read: u64,
    /// KB/s
    pub io_write: u64,
}

impl InstanceStatusReport {
    /// A bare transition report (no monitor metrics attached).
    pub fn transition(instance_id: impl Into<String>, status: &str, pid: u32, uptime: i64) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: status.to_string(),
            pid,
            uptime,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Config push (master -> worker)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// seconds; 0 means "leave unchanged"
    pub heartbeat_interval: u64,
    /// seconds; 0 means "leave unchanged"
    pub monitor_interval: u64,
}

// ---------------------------------------------------------------------------
// Maintenance calls (master -> worker, correlated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilesRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilesResponse {
    pub instance_id: String,
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupCacheRequest {
    /// Versions to keep per service; 0 deletes all, negative reports only.
    pub retain: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupCacheResponse {
    pub node_id: String,
    pub freed_bytes: u64,
    pub deleted_files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrphanScanRequest {
    pub valid_systems: Vec<String>,
    pub valid_instances: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    SystemDir,
    InstanceDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanItem {
    #[serde(rename = "type")]
    pub kind: OrphanKind,
    /// Relative to the worker's instance root, e.g. "PaymentSys/gateway_inst-123".
    pub path: String,
    pub abs_path: String,
    pub size: u64,
    pub is_running: bool,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrphanScanResponse {
    pub items: Vec<OrphanItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrphanDeleteRequest {
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrphanDeleteResponse {
    pub deleted_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Wake-on-LAN relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeOnLanRequest {
    pub mac_addr: String,
}
