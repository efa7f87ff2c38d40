//! `service.json` manifests and the on-disk instance layout.
//!
//! The worker root looks like:
//!
//! ```text
//! <root>/
//!   node_id                     persisted worker identity
//!   pkg_cache/                  shared artifact cache (name_version.zip)
//!   <SystemName>/<service>_<instance-id>/   standard instances
//!   external/<SystemName>/<name>_<instance-id>/  adopted instances
//! ```
//!
//! Each instance directory holds the manifest, a `pid` file and `app.log`.
//! The manifest is authoritative for how the process is started, stopped and
//! identified; the pid file is only a cache that must be revalidated.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const MANIFEST_FILE: &str = "service.json";
pub const PID_FILE: &str = "pid";
pub const APP_LOG_FILE: &str = "app.log";
pub const LOG_KEY_CONSOLE: &str = "Console Log";

/// Directory names under the instance root that never hold instances.
pub const RESERVED_DIRS: [&str; 3] = ["pkg_cache", "external", "lost+found"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidStrategy {
    /// The spawned child's own PID is authoritative.
    #[default]
    Spawn,
    /// The entrypoint is an opaque launcher; the real PID is discovered by
    /// scanning the process table afterwards.
    Match,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub version: String,
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub description: String,

    /// Adopted service fields.
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub external_work_dir: String,
    #[serde(default)]
    pub pid_strategy: PidStrategy,
    #[serde(default)]
    pub process_name: String,

    /// Optional graceful-shutdown hook, run before the tree kill.
    #[serde(default)]
    pub stop_entrypoint: String,
    #[serde(default)]
    pub stop_args: Vec<String>,

    /// Readiness probe: "none" | "tcp" | "http" | "time".
    #[serde(default)]
    pub readiness_type: String,
    #[serde(default)]
    pub readiness_target: String,
    /// Seconds; 0 means the 30s default.
    #[serde(default)]
    pub readiness_timeout: u64,

    /// Display name -> path (absolute, or relative to the work dir).
    #[serde(default)]
    pub log_paths: HashMap<String, String>,
}

impl ServiceManifest {
    pub fn read(instance_dir: &Path) -> Result<Self> {
        let path = instance_dir.join(MANIFEST_FILE);
        let data = fs::read(&path)
            .map_err(|e| FleetError::Manifest(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| FleetError::Manifest(format!("{}: {}", path.display(), e)))
    }

    pub fn write(&self, instance_dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(instance_dir.join(MANIFEST_FILE), data)?;
        Ok(())
    }

    /// Directory the process actually runs in.
    pub fn exec_dir(&self, instance_dir: &Path) -> PathBuf {
        if self.is_external && !self.external_work_dir.is_empty() {
            PathBuf::from(&self.external_work_dir)
        } else {
            instance_dir.to_path_buf()
        }
    }
}

/// A locally-known instance directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDirInfo {
    pub instance_id: String,
    pub dir: PathBuf,
}

/// Directory name convention is `<service>_<instance-id>`; the id is the part
/// after the last underscore, or the whole name when there is none.
pub fn instance_id_from_dir_name(name: &str) -> &str {
    match name.rfind('_') {
        Some(idx) if idx + 1 < name.len() => &name[idx + 1..],
        _ => name,
    }
}

/// Scan one root's two-level `<system>/<instance>` tree.
pub fn scan_instance_dirs(root: &Path) -> Vec<InstanceDirInfo> {
    let mut list = Vec::new();
    let Ok(systems) = fs::read_dir(root) else {
        return list;
    };
    for sys in systems.flatten() {
        if !sys.path().is_dir() {
            continue;
        }
        let sys_name = sys.file_name();
        let sys_name = sys_name.to_string_lossy();
        if RESERVED_DIRS.contains(&sys_name.as_ref()) {
            continue;
        }
        let Ok(instances) = fs::read_dir(sys.path()) else {
            continue;
        };
        for inst in instances.flatten() {
            if !inst.path().is_dir() {
                continue;
            }
            let name = inst.file_name();
            let name = name.to_string_lossy();
            list.push(InstanceDirInfo {
                instance_id: instance_id_from_dir_name(&name).to_string(),
                dir: inst.path(),
            });
        }
    }
    list
}

/// Read the cached PID, if any. Returns `None` for a missing file or
/// unparseable content; the caller must still validate a returned PID
/// against the live process table before trusting it.
pub fn read_pid(instance_dir: &Path) -> Option<u32> {
    let data = fs::read_to_string(instance_dir.join(PID_FILE)).ok()?;
    data.trim().parse::<u32>().ok().filter(|&p| p > 0)
}

pub fn write_pid(instance_dir: &Path, pid: u32) -> Result<()> {
    fs::write(instance_dir.join(PID_FILE), pid.to_string())?;
    Ok(())
}

pub fn remove_pid(instance_dir: &Path) {
    let _ = fs::remove_file(instance_dir.join(PID_FILE));
}

/// Enumerate log display names for an instance: the console log plus the
/// manifest's custom keys, sorted for stable ordering.
pub fn log_file_names(instance_dir: &Path) -> Vec<String> {
    let mut files = vec![LOG_KEY_CONSOLE.to_string()];
    if let Ok(manifest) = ServiceManifest::read(instance_dir) {
        let mut keys: Vec<String> = manifest.log_paths.keys().cloned().collect();
        keys.sort();
        files.extend(keys);
    }
    files
}

/// Resolve a log display name to a physical path. Relative custom paths are
/// resolved against the instance dir (or the adopted service's real work
/// dir). The file is allowed to not exist yet; tailing waits for it.
pub fn resolve_log_path(instance_dir: &Path, log_key: &str) -> Result<PathBuf> {
    if log_key.is_empty() || log_key == LOG_KEY_CONSOLE {
        return Ok(instance_dir.join(APP_LOG_FILE));
    }

    let manifest = ServiceManifest::read(instance_dir)?;
    let path = manifest
        .log_paths
        .get(log_key)
        .ok_or_else(|| FleetError::Manifest(format!("log key '{log_key}' not found")))?;

    let path = PathBuf::from(path);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(manifest.exec_dir(instance_dir).join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn instance_id_parsing() {
        assert_eq!(instance_id_from_dir_name("gateway_inst-123"), "inst-123");
        assert_eq!(instance_id_from_dir_name("my_app_inst-9"), "inst-9");
        assert_eq!(instance_id_from_dir_name("plain"), "plain");
        assert_eq!(instance_id_from_dir_name("trailing_"), "trailing_");
    }

    #[test]
    fn manifest_round_trip_and_defaults() {
        let tmp = TempDir::new().unwrap();
        let mf = ServiceManifest {
            name: "svc".into(),
            version: "1.2".into(),
            entrypoint: "bin/run.sh".into(),
            readiness_type: "tcp".into(),
            readiness_target: "127.0.0.1:8080".into(),
            ..Default::default()
        };
        mf.write(tmp.path()).unwrap();

        let back = ServiceManifest::read(tmp.path()).unwrap();
        assert_eq!(back.name, "svc");
        assert_eq!(back.pid_strategy, PidStrategy::Spawn);
        assert!(!back.is_external);
        assert_eq!(back.readiness_timeout, 0);
    }

    #[test]
    fn pid_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_pid(tmp.path()), None);

        write_pid(tmp.path(), 4242).unwrap();
        assert_eq!(read_pid(tmp.path()), Some(4242));

        std::fs::write(tmp.path().join(PID_FILE), "garbage").unwrap();
        assert_eq!(read_pid(tmp.path()), None);

        remove_pid(tmp.path());
        assert_eq!(read_pid(tmp.path()), None);
    }

    #[test]
    fn scan_skips_reserved_dirs_and_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("PaySys/gateway_i-1")).unwrap();
        std::fs::create_dir_all(tmp.path().join("pkg_cache")).unwrap();
        std::fs::create_dir_all(tmp.path().join("external")).unwrap();
        std::fs::write(tmp.path().join("stray.txt"), "x").unwrap();

        let found = scan_instance_dirs(tmp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, "i-1");
    }

    #[test]
    fn log_path_resolution() {
        let tmp = TempDir::new().unwrap();
        let mut mf = ServiceManifest::default();
        mf.log_paths
            .insert("Access Log".into(), "logs/access.log".into());
        mf.write(tmp.path()).unwrap();

        let console = resolve_log_path(tmp.path(), LOG_KEY_CONSOLE).unwrap();
        assert_eq!(console, tmp.path().join(APP_LOG_FILE));

        let custom = resolve_log_path(tmp.path(), "Access Log").unwrap();
        assert_eq!(custom, tmp.path().join("logs/access.log"));

        assert!(resolve_log_path(tmp.path(), "Nope").is_err());

        let names = log_file_names(tmp.path());
        assert_eq!(names, vec!["Console Log".to_string(), "Access Log".into()]);
    }
}
