//! Disk hygiene: package-cache retention and orphaned-directory cleanup.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::error::Result;
use crate::executor::manifest::{
    self, instance_id_from_dir_name, read_pid, ServiceManifest, RESERVED_DIRS,
};
use crate::executor::validate::ProcessTable;
use crate::protocol::messages::{OrphanItem, OrphanKind};

/// Outcome of one cache-cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    pub freed_bytes: u64,
    pub deleted_files: Vec<String>,
    pub errors: Vec<String>,
}

/// Keep the newest `retain` artifacts per service, by modification time.
/// Artifacts group by the file-name prefix up to the last underscore
/// (`gateway_1.4.2.zip` -> `gateway`). `retain == 0` deletes everything;
/// negative values only report what would be deleted.
pub fn cleanup_cache(cache_dir: &Path, retain: i32) -> Result<CleanupOutcome> {
    let mut outcome = CleanupOutcome::default();
    let mut groups: BTreeMap<String, Vec<(PathBuf, SystemTime, u64)>> = BTreeMap::new();

    let entries = match fs::read_dir(cache_dir) {
        Ok(e) => e,
        Err(_) => return Ok(outcome),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        let stem = name.strip_suffix(".zip").unwrap_or(&name);
        let key = match stem.rfind('_') {
            Some(idx) => stem[..idx].to_string(),
            None => stem.to_string(),
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                outcome.errors.push(format!("{name}: {e}"));
                continue;
            }
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        groups.entry(key).or_default().push((path, mtime, meta.len()));
    }

    let dry_run = retain < 0;
    let keep = retain.max(0) as usize;
    for (key, mut files) in groups {
        files.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _, size) in files.into_iter().skip(keep) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if dry_run {
                outcome.deleted_files.push(name);
                outcome.freed_bytes += size;
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(%key, file = %name, size, "deleted cached package");
                    outcome.deleted_files.push(name);
                    outcome.freed_bytes += size;
                }
                Err(e) => outcome.errors.push(format!("{name}: {e}")),
            }
        }
    }
    Ok(outcome)
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                total += dir_size(&p);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

fn instance_is_running(dir: &Path, table: &ProcessTable) -> (bool, u32) {
    let Some(pid) = read_pid(dir) else {
        return (false, 0);
    };
    let expected = ServiceManifest::read(dir)
        .map(|m| {
            if m.process_name.is_empty() {
                entry_base_name(&m.entrypoint)
            } else {
                m.process_name
            }
        })
        .unwrap_or_default();
    if table.validate(pid, dir, &expected) {
        (true, pid)
    } else {
        (false, 0)
    }
}

fn entry_base_name(entrypoint: &str) -> String {
    Path::new(entrypoint)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Walk the two-level `<system>/<instance>` tree and report directories the
/// master no longer knows about. System dirs absent from `valid_systems` are
/// reported whole; within known systems, instance dirs whose id is absent
/// from `valid_instances` are reported individually. Each item carries
/// whether a validated process is still running inside it.
pub fn scan_orphans(
    root: &Path,
    valid_systems: &[String],
    valid_instances: &[String],
) -> Vec<OrphanItem> {
    let systems: HashSet<&str> = valid_systems.iter().map(String::as_str).collect();
    let instances: HashSet<&str> = valid_instances.iter().map(String::as_str).collect();

    let mut table = ProcessTable::new();
    table.refresh_all();

    let mut items = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return items;
    };
    for sys in entries.flatten() {
        let sys_path = sys.path();
        if !sys_path.is_dir() {
            continue;
        }
        let sys_name = sys.file_name();
        let sys_name = sys_name.to_string_lossy().into_owned();
        if RESERVED_DIRS.contains(&sys_name.as_str()) {
            continue;
        }

        if !systems.contains(sys_name.as_str()) {
            // Whole system is unknown; a single live instance marks it running.
            let mut running = false;
            let mut pid = 0;
            if let Ok(insts) = fs::read_dir(&sys_path) {
                for inst in insts.flatten() {
                    if inst.path().is_dir() {
                        let (r, p) = instance_is_running(&inst.path(), &table);
                        if r {
                            running = true;
                            pid = p;
                            break;
                        }
                    }
                }
            }
            items.push(OrphanItem {
                kind: OrphanKind::SystemDir,
                path: sys_name.clone(),
                abs_path: sys_path.to_string_lossy().into_owned(),
                size: dir_size(&sys_path),
                is_running: running,
                pid,
            });
            continue;
        }

        let Ok(insts) = fs::read_dir(&sys_path) else {
            continue;
        };
        for inst in insts.flatten() {
            let inst_path = inst.path();
            if !inst_path.is_dir() {
                continue;
            }
            let dir_name = inst.file_name();
            let dir_name = dir_name.to_string_lossy().into_owned();
            if instances.contains(instance_id_from_dir_name(&dir_name)) {
                continue;
            }
            let (running, pid) = instance_is_running(&inst_path, &table);
            items.push(OrphanItem {
                kind: OrphanKind::InstanceDir,
                path: format!("{sys_name}/{dir_name}"),
                abs_path: inst_path.to_string_lossy().into_owned(),
                size: dir_size(&inst_path),
                is_running: running,
                pid,
            });
        }
    }
    items
}

/// Delete previously reported orphans, given their root-relative paths.
/// Paths are re-anchored under `root` and re-checked for a live process, so
/// a stale request can neither escape the tree nor kill the disk out from
/// under a running instance.
pub fn delete_orphans(root: &Path, rel_paths: &[String]) -> usize {
    let mut table = ProcessTable::new();
    table.refresh_all();

    let mut deleted = 0;
    for rel in rel_paths {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            warn!(path = %rel, "refusing orphan delete outside instance root");
            continue;
        }
        let target = root.join(rel_path);
        if !target.is_dir() {
            continue;
        }

        let top = RESERVED_DIRS.contains(
            &target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_str(),
        );
        if top {
            warn!(path = %rel, "refusing orphan delete of reserved directory");
            continue;
        }

        let live = if manifest::read_pid(&target).is_some() {
            instance_is_running(&target, &table).0
        } else {
            // System-level path: check one level down.
            fs::read_dir(&target)
                .map(|rd| {
                    rd.flatten()
                        .filter(|e| e.path().is_dir())
                        .any(|e| instance_is_running(&e.path(), &table).0)
                })
                .unwrap_or(false)
        };
        if live {
            warn!(path = %rel, "skipping orphan delete, process still running");
            continue;
        }

        match fs::remove_dir_all(&target) {
            Ok(()) => {
                info!(path = %rel, "deleted orphan directory");
                deleted += 1;
            }
            Err(e) => warn!(path = %rel, error = %e, "orphan delete failed"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, mtime_offset_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; 10]).unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + mtime_offset_secs);
        let f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.set_modified(t).unwrap();
    }

    #[test]
    fn retention_keeps_newest_per_service() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "gateway_1.0.zip", 10);
        touch(tmp.path(), "gateway_1.1.zip", 20);
        touch(tmp.path(), "gateway_1.2.zip", 30);
        touch(tmp.path(), "gateway_1.3.zip", 40);
        touch(tmp.path(), "billing_0.9.zip", 50);

        let out = cleanup_cache(tmp.path(), 2).unwrap();
        let mut deleted = out.deleted_files.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["gateway_1.0.zip", "gateway_1.1.zip"]);
        assert_eq!(out.freed_bytes, 20);
        assert!(tmp.path().join("gateway_1.3.zip").exists());
        assert!(tmp.path().join("billing_0.9.zip").exists());
    }

    #[test]
    fn negative_retain_reports_without_deleting() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "svc_1.zip", 1);
        touch(tmp.path(), "svc_2.zip", 2);

        let out = cleanup_cache(tmp.path(), -1).unwrap();
        assert_eq!(out.deleted_files.len(), 2);
        assert!(tmp.path().join("svc_1.zip").exists());
        assert!(tmp.path().join("svc_2.zip").exists());
    }

    #[test]
    fn zero_retain_deletes_all() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "svc_1.zip", 1);
        touch(tmp.path(), "other_3.zip", 2);

        let out = cleanup_cache(tmp.path(), 0).unwrap();
        assert_eq!(out.deleted_files.len(), 2);
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[test]
    fn scan_reports_unknown_systems_and_instances() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("KnownSys/svc_live-1")).unwrap();
        fs::create_dir_all(tmp.path().join("KnownSys/svc_gone-2")).unwrap();
        fs::create_dir_all(tmp.path().join("DeadSys/old_x-9")).unwrap();
        fs::create_dir_all(tmp.path().join("pkg_cache")).unwrap();

        let items = scan_orphans(
            tmp.path(),
            &["KnownSys".into()],
            &["live-1".into()],
        );
        assert_eq!(items.len(), 2);
        let sys = items.iter().find(|i| i.kind == OrphanKind::SystemDir).unwrap();
        assert_eq!(sys.path, "DeadSys");
        let inst = items
            .iter()
            .find(|i| i.kind == OrphanKind::InstanceDir)
            .unwrap();
        assert_eq!(inst.path, "KnownSys/svc_gone-2");
        assert!(!inst.is_running);
    }

    #[test]
    fn delete_refuses_traversal_and_reserved() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("pkg_cache")).unwrap();
        fs::create_dir_all(tmp.path().join("Sys/svc_a-1")).unwrap();

        let n = delete_orphans(
            tmp.path(),
            &["../outside".into(), "pkg_cache".into(), "Sys/svc_a-1".into()],
        );
        assert_eq!(n, 1);
        assert!(tmp.path().join("pkg_cache").exists());
        assert!(!tmp.path().join("Sys/svc_a-1").exists());
    }

    #[test]
    fn delete_skips_directories_with_live_process() {
        let tmp = TempDir::new().unwrap();
        let inst = tmp.path().join("Sys/svc_busy-1");
        fs::create_dir_all(&inst).unwrap();
        // Our own PID with a manifest naming our executable: validates live.
        manifest::write_pid(&inst, std::process::id()).unwrap();
        let exe = std::env::current_exe().unwrap();
        let mf = ServiceManifest {
            name: "busy".into(),
            process_name: exe.file_name().unwrap().to_string_lossy().into_owned(),
            ..Default::default()
        };
        mf.write(&inst).unwrap();

        let n = delete_orphans(tmp.path(), &["Sys/svc_busy-1".into()]);
        assert_eq!(n, 0);
        assert!(inst.exists());
    }
}
