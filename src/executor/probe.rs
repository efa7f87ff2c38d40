//! Readiness probing after a start.
//!
//! A started process is only reported `running` once its probe passes. On
//! timeout the process is left alive and the error carries the PID, so the
//! operator can inspect or stop it.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::executor::manifest::ServiceManifest;

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    None,
    Tcp(String),
    Http(String),
    /// Fixed grace period in seconds.
    Time(u64),
}

impl Probe {
    pub fn from_manifest(manifest: &ServiceManifest) -> Self {
        match manifest.readiness_type.as_str() {
            "tcp" => Probe::Tcp(manifest.readiness_target.clone()),
            "http" => Probe::Http(manifest.readiness_target.clone()),
            "time" => Probe::Time(manifest.readiness_target.parse().unwrap_or(5)),
            _ => Probe::None,
        }
    }
}

/// Poll the probe until it passes or the deadline expires. `pid` is only
/// threaded through for the timeout error.
pub async fn wait_ready(manifest: &ServiceManifest, pid: u32) -> Result<()> {
    let probe = Probe::from_manifest(manifest);
    let limit = match manifest.readiness_timeout {
        0 => DEFAULT_READY_TIMEOUT,
        secs => Duration::from_secs(secs),
    };

    match probe {
        Probe::None => return Ok(()),
        Probe::Time(secs) => {
            sleep(Duration::from_secs(secs)).await;
            return Ok(());
        }
        _ => {}
    }

    let client = reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .map_err(|e| FleetError::StartFailed(format!("probe client: {e}")))?;

    let deadline = Instant::now() + limit;
    loop {
        let ok = match &probe {
            Probe::Tcp(addr) => timeout(ATTEMPT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false),
            Probe::Http(url) => match client.get(url).send().await {
                Ok(resp) => {
                    let code = resp.status().as_u16();
                    (200..400).contains(&code)
                }
                Err(_) => false,
            },
            Probe::None | Probe::Time(_) => unreachable!(),
        };
        if ok {
            return Ok(());
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            debug!(pid, service = %manifest.name, "readiness probe deadline expired");
            return Err(FleetError::ReadinessTimeout {
                pid,
                timeout_secs: limit.as_secs(),
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn manifest(ptype: &str, target: &str, timeout_secs: u64) -> ServiceManifest {
        ServiceManifest {
            name: "probe-test".into(),
            readiness_type: ptype.into(),
            readiness_target: target.into(),
            readiness_timeout: timeout_secs,
            ..Default::default()
        }
    }

    #[test]
    fn probe_parsing() {
        assert_eq!(Probe::from_manifest(&manifest("", "", 0)), Probe::None);
        assert_eq!(
            Probe::from_manifest(&manifest("tcp", "127.0.0.1:80", 0)),
            Probe::Tcp("127.0.0.1:80".into())
        );
        assert_eq!(Probe::from_manifest(&manifest("time", "3", 0)), Probe::Time(3));
        assert_eq!(Probe::from_manifest(&manifest("time", "bogus", 0)), Probe::Time(5));
    }

    #[tokio::test]
    async fn none_probe_is_immediately_ready() {
        wait_ready(&manifest("", "", 0), 1).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_probe_passes_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        wait_ready(&manifest("tcp", &addr.to_string(), 5), 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tcp_probe_times_out_and_carries_pid() {
        // Reserved TEST-NET address, nothing listens there.
        let err = wait_ready(&manifest("tcp", "127.0.0.1:1", 1), 777)
            .await
            .unwrap_err();
        match err {
            FleetError::ReadinessTimeout { pid, timeout_secs } => {
                assert_eq!(pid, 777);
                assert_eq!(timeout_secs, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
