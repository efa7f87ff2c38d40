use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("worker {0} unreachable")]
    WorkerUnreachable(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("package fetch failed: {0}")]
    PackageFetch(String),

    #[error("package extract failed: {0}")]
    Extract(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("no process matched '{0}' within the expected working directory")]
    ProcessMatchFailed(String),

    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("readiness probe timed out after {timeout_secs}s (pid {pid})")]
    ReadinessTimeout { pid: u32, timeout_secs: u64 },

    #[error("kill failed for pid {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// True for failures a caller may retry wholesale (deploy is
    /// destructive-idempotent, so any deploy-phase error qualifies).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::PackageFetch(_)
                | FleetError::Extract(_)
                | FleetError::Manifest(_)
                | FleetError::Timeout(_)
                | FleetError::WorkerUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
