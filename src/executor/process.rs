//! Instance process lifecycle: start, stop, destroy.
//!
//! Start is idempotent: a cached PID that still validates against the live
//! process table means "already running", and the same PID is returned. A
//! stale PID (dead, or recycled by an unrelated process) is discarded and
//! the instance started fresh.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::executor::launcher::ProcessLauncher;
use crate::executor::manifest::{
    self, read_pid, remove_pid, write_pid, PidStrategy, ServiceManifest, APP_LOG_FILE,
};
use crate::executor::probe;
use crate::executor::validate::ProcessTable;

const MATCH_ATTEMPTS: u32 = 5;
const MATCH_INTERVAL: Duration = Duration::from_millis(500);
const STOP_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub pid: u32,
    /// Process start time, unix seconds.
    pub started_at: i64,
    /// False when the instance was already up and nothing was spawned.
    pub spawned: bool,
}

/// Binary name used for PID identity checks: the manifest's explicit
/// `process_name`, or the entrypoint's base name.
pub fn expected_bin(manifest: &ServiceManifest) -> String {
    if !manifest.process_name.is_empty() {
        return manifest.process_name.clone();
    }
    Path::new(&manifest.entrypoint)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn resolve_entrypoint(exec_dir: &Path, entrypoint: &str) -> PathBuf {
    let p = Path::new(entrypoint);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        exec_dir.join(p)
    }
}

fn console_log_file(instance_dir: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(instance_dir.join(APP_LOG_FILE))
        .map_err(Into::into)
}

pub async fn start(
    instance_dir: &Path,
    launcher: &dyn ProcessLauncher,
    table: &Mutex<ProcessTable>,
) -> Result<StartOutcome> {
    let manifest = ServiceManifest::read(instance_dir)?;
    let exec_dir = manifest.exec_dir(instance_dir);
    let bin = expected_bin(&manifest);

    // Idempotency check against a cached PID.
    if let Some(pid) = read_pid(instance_dir) {
        let mut t = table.lock().await;
        t.refresh_pid(pid);
        if t.validate(pid, &exec_dir, &bin) {
            let started_at = t.sample(pid).map(|s| s.start_time_secs as i64).unwrap_or(0);
            debug!(pid, service = %manifest.name, "instance already running");
            return Ok(StartOutcome {
                pid,
                started_at,
                spawned: false,
            });
        }
        warn!(pid, service = %manifest.name, "stale pid file, starting fresh");
        remove_pid(instance_dir);
    }

    if manifest.entrypoint.is_empty() {
        return Err(FleetError::StartFailed("manifest has no entrypoint".into()));
    }

    let log = console_log_file(instance_dir)?;
    let mut cmd = Command::new(resolve_entrypoint(&exec_dir, &manifest.entrypoint));
    cmd.args(&manifest.args)
        .current_dir(&exec_dir)
        .envs(&manifest.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    launcher.configure_detached(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::StartFailed(format!("{}: {e}", manifest.entrypoint)))?;
    let child_pid = child
        .id()
        .ok_or_else(|| FleetError::StartFailed("child exited before pid was read".into()))?;
    // Reap in the background so a detached child never lingers as a zombie.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let pid = match manifest.pid_strategy {
        PidStrategy::Spawn => child_pid,
        PidStrategy::Match => {
            // The entrypoint was only a launcher; find the real process it
            // left behind.
            let mut found = None;
            for _ in 0..MATCH_ATTEMPTS {
                sleep(MATCH_INTERVAL).await;
                let mut t = table.lock().await;
                t.refresh_all();
                if let Some(p) = t.find_match(&bin, &exec_dir) {
                    found = Some(p);
                    break;
                }
            }
            found.ok_or_else(|| FleetError::ProcessMatchFailed(bin.clone()))?
        }
    };

    write_pid(instance_dir, pid)?;
    info!(pid, service = %manifest.name, version = %manifest.version, "instance started");

    // Gate "running" on readiness. On timeout the process stays up and the
    // error carries its PID.
    probe::wait_ready(&manifest, pid).await?;

    let started_at = {
        let mut t = table.lock().await;
        t.refresh_pid(pid);
        t.sample(pid).map(|s| s.start_time_secs as i64).unwrap_or(0)
    };
    Ok(StartOutcome {
        pid,
        started_at,
        spawned: true,
    })
}

async fn run_stop_hook(manifest: &ServiceManifest, exec_dir: &Path) {
    if manifest.stop_entrypoint.is_empty() {
        return;
    }
    let mut cmd = Command::new(resolve_entrypoint(exec_dir, &manifest.stop_entrypoint));
    cmd.args(&manifest.stop_args)
        .current_dir(exec_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match cmd.spawn() {
        Ok(mut child) => {
            if tokio::time::timeout(STOP_HOOK_TIMEOUT, child.wait())
                .await
                .is_err()
            {
                warn!(service = %manifest.name, "stop hook timed out, killing it");
                let _ = child.kill().await;
            }
        }
        Err(e) => warn!(service = %manifest.name, error = %e, "stop hook failed to spawn"),
    }
}

/// Stop an instance. A missing or stale pid file means it is already
/// stopped, which is success.
pub async fn stop(
    instance_dir: &Path,
    launcher: &dyn ProcessLauncher,
    table: &Mutex<ProcessTable>,
) -> Result<()> {
    let Some(pid) = read_pid(instance_dir) else {
        debug!(dir = %instance_dir.display(), "no pid file, already stopped");
        return Ok(());
    };
    let manifest = ServiceManifest::read(instance_dir).unwrap_or_default();
    let exec_dir = manifest.exec_dir(instance_dir);

    let valid = {
        let mut t = table.lock().await;
        t.refresh_pid(pid);
        t.validate(pid, &exec_dir, &expected_bin(&manifest))
    };
    if valid {
        run_stop_hook(&manifest, &exec_dir).await;
        launcher.kill_tree(pid)?;
        info!(pid, service = %manifest.name, "instance stopped");
    } else {
        debug!(pid, "pid no longer ours, treating as stopped");
    }
    remove_pid(instance_dir);
    Ok(())
}

/// Stop the instance and remove its directory. Adopted instances only lose
/// their registration dir; their real work dir is left alone.
pub async fn destroy(
    instance_dir: &Path,
    launcher: &dyn ProcessLauncher,
    table: &Mutex<ProcessTable>,
) -> Result<()> {
    stop(instance_dir, launcher, table).await?;
    if instance_dir.exists() {
        tokio::fs::remove_dir_all(instance_dir).await?;
    }
    info!(dir = %instance_dir.display(), "instance destroyed");
    Ok(())
}
