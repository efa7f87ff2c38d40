//! Live process-table queries, built on `sysinfo`.
//!
//! A PID read from disk is never trusted on its own: the OS recycles PIDs, so
//! every consumer goes through [`ProcessTable::validate`] first. Validation
//! checks, in order: the process exists, its cwd lies under the instance work
//! dir, and as fallbacks the executable name or the full command line mention
//! the expected binary.

use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One refreshed sample of a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcSample {
    pub cpu_percent: f32,
    pub mem_bytes: u64,
    pub start_time_secs: u64,
    /// Cumulative bytes since process start.
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,
}

pub struct ProcessTable {
    sys: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Refresh the whole table, dropping dead entries. CPU percentages are
    /// deltas against the previous refresh, so callers sampling usage must
    /// keep one `ProcessTable` alive across ticks.
    pub fn refresh_all(&mut self) {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
    }

    pub fn refresh_pid(&mut self, pid: u32) {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::everything(),
        );
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.sys.process(Pid::from_u32(pid)).is_some()
    }

    /// Does `pid` still belong to this instance? `expected_bin` is the base
    /// name of the entrypoint (or the manifest's `process_name` for adopted
    /// services). Assumes the table was refreshed by the caller.
    pub fn validate(&self, pid: u32, work_dir: &Path, expected_bin: &str) -> bool {
        let Some(proc_) = self.sys.process(Pid::from_u32(pid)) else {
            return false;
        };

        if let Some(cwd) = proc_.cwd() {
            if cwd.starts_with(work_dir) {
                return true;
            }
        }

        if !expected_bin.is_empty() {
            let name = proc_.name().to_string_lossy();
            if name.contains(expected_bin) {
                return true;
            }
            let cmdline = proc_
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            if cmdline.contains(expected_bin) {
                return true;
            }
        }

        false
    }

    /// Find a process whose command line contains `keyword` and whose cwd is
    /// under `work_dir`. Used by the `match` PID strategy after running an
    /// opaque launcher script. Prefers the lowest PID for determinism when a
    /// launcher forks several candidates.
    pub fn find_match(&self, keyword: &str, work_dir: &Path) -> Option<u32> {
        let mut best: Option<u32> = None;
        for (pid, proc_) in self.sys.processes() {
            let in_dir = proc_.cwd().is_some_and(|c| c.starts_with(work_dir));
            if !in_dir {
                continue;
            }
            let cmdline = proc_
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            if cmdline.contains(keyword) || proc_.name().to_string_lossy().contains(keyword) {
                let p = pid.as_u32();
                best = Some(best.map_or(p, |b| b.min(p)));
            }
        }
        best
    }

    pub fn sample(&self, pid: u32) -> Option<ProcSample> {
        let proc_ = self.sys.process(Pid::from_u32(pid))?;
        let disk = proc_.disk_usage();
        Some(ProcSample {
            cpu_percent: proc_.cpu_usage(),
            mem_bytes: proc_.memory(),
            start_time_secs: proc_.start_time(),
            disk_read_bytes: disk.total_read_bytes,
            disk_written_bytes: disk.total_written_bytes,
        })
    }

    /// Uptime in seconds, derived from the process start time.
    pub fn uptime_secs(&self, pid: u32) -> Option<u64> {
        let proc_ = self.sys.process(Pid::from_u32(pid))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(now.saturating_sub(proc_.start_time()))
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_and_validates_by_cwd() {
        let mut table = ProcessTable::new();
        table.refresh_all();

        let me = std::process::id();
        assert!(table.is_alive(me));

        let cwd = std::env::current_dir().unwrap();
        assert!(table.validate(me, &cwd, ""));
    }

    #[test]
    fn stale_pid_fails_validation() {
        let mut table = ProcessTable::new();
        table.refresh_all();

        // PID max on Linux defaults to 4194304; anything above is never live.
        assert!(!table.is_alive(u32::MAX - 1));
        assert!(!table.validate(u32::MAX - 1, Path::new("/nowhere"), "ghost"));
    }

    #[test]
    fn wrong_identity_fails_validation() {
        let mut table = ProcessTable::new();
        table.refresh_all();

        // Our own process, but a work dir it does not live under and a binary
        // name it does not match: PID reuse must be detected.
        let me = std::process::id();
        assert!(!table.validate(
            me,
            Path::new("/definitely/not/our/cwd"),
            "no-such-binary-zz"
        ));
    }
}
