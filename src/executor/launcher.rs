//! Platform-specific process launch and termination.
//!
//! The executor never calls OS signal APIs directly; it goes through the
//! [`ProcessLauncher`] capability so the lifecycle logic stays
//! platform-neutral and testable.

use tokio::process::Command;

use crate::error::{FleetError, Result};

pub trait ProcessLauncher: Send + Sync {
    /// Detach the child from our session so it survives a worker restart,
    /// and place it in its own process group / job so the whole tree can be
    /// killed later.
    fn configure_detached(&self, cmd: &mut Command);

    /// Force-kill the process tree rooted at `pid`. An already-gone process
    /// is success, not an error.
    fn kill_tree(&self, pid: u32) -> Result<()>;
}

/// The real OS implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

#[cfg(unix)]
impl ProcessLauncher for OsLauncher {
    fn configure_detached(&self, cmd: &mut Command) {
        // New process group: the child becomes its own group leader, so a
        // negative-PID kill reaches every descendant.
        cmd.process_group(0);
    }

    fn kill_tree(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                // Group already gone; try the single PID in case the process
                // re-parented out of its group.
                match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => Ok(()),
                    Err(e) => Err(FleetError::KillFailed {
                        pid,
                        reason: e.to_string(),
                    }),
                }
            }
            Err(e) => Err(FleetError::KillFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(windows)]
impl ProcessLauncher for OsLauncher {
    fn configure_detached(&self, cmd: &mut Command) {
        // CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS
        cmd.creation_flags(0x0000_0200 | 0x0000_0008);
    }

    fn kill_tree(&self, pid: u32) -> Result<()> {
        let out = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| FleetError::KillFailed {
                pid,
                reason: e.to_string(),
            })?;
        // Exit code 128 means "process not found"; treat as already stopped.
        match out.status.code() {
            Some(0) | Some(128) => Ok(()),
            code => Err(FleetError::KillFailed {
                pid,
                reason: format!(
                    "taskkill exited {:?}: {}",
                    code,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kill_tree_takes_down_child_group() {
        let launcher = OsLauncher;
        let mut cmd = Command::new("sleep");
        cmd.arg("300");
        launcher.configure_detached(&mut cmd);

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        launcher.kill_tree(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn kill_tree_tolerates_missing_process() {
        // Spawn-and-reap so we hold a PID that is definitely dead.
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(OsLauncher.kill_tree(pid).is_ok());
    }
}
