//! Process-lifecycle executor: deploys packages, starts and stops instance
//! processes, monitors them and keeps the local disk tidy.
//!
//! All mutation of one instance is serialized by a per-instance async lock,
//! so a duplicate `start` command observes either the finished first start
//! (and no-ops) or waits for it.

mod cleaner;
mod deploy;
mod launcher;
pub mod manifest;
mod monitor;
mod probe;
mod process;
pub(crate) mod validate;

pub use cleaner::CleanupOutcome;
pub use launcher::{OsLauncher, ProcessLauncher};
pub use manifest::{InstanceDirInfo, ServiceManifest};
pub use monitor::run_monitor;
pub use process::StartOutcome;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::error::{FleetError, Result};
use crate::protocol::messages::{DeployRequest, InstanceStatusReport};
use deploy::PackageCache;
use validate::ProcessTable;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_DEPLOYING: &str = "deploying";
pub const STATUS_FAILED: &str = "failed";

const EXTERNAL_DIR: &str = "external";

/// Where instance status transitions and monitor samples go. The transport
/// side implements this; the executor never knows about envelopes.
pub trait StatusSink: Send + Sync {
    fn report(&self, report: InstanceStatusReport);
}

/// No-op sink for tools and tests.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn report(&self, _report: InstanceStatusReport) {}
}

pub struct Executor {
    root: PathBuf,
    cache: PackageCache,
    launcher: Box<dyn ProcessLauncher>,
    sink: Arc<dyn StatusSink>,
    table: Mutex<ProcessTable>,
    instance_locks: DashMap<String, Arc<Mutex<()>>>,
    monitor_interval: watch::Sender<Duration>,
}

impl Executor {
    pub fn new(root: impl Into<PathBuf>, sink: Arc<dyn StatusSink>) -> Result<Self> {
        Self::with_launcher(root, sink, Box::new(OsLauncher))
    }

    pub fn with_launcher(
        root: impl Into<PathBuf>,
        sink: Arc<dyn StatusSink>,
        launcher: Box<dyn ProcessLauncher>,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let cache = PackageCache::new(root.join("pkg_cache"))?;
        let (monitor_interval, _) = watch::channel(Duration::from_secs(3));
        Ok(Self {
            root,
            cache,
            launcher,
            sink,
            table: Mutex::new(ProcessTable::new()),
            instance_locks: DashMap::new(),
            monitor_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    /// Hot-reconfigure the monitor cadence; the running loop picks it up on
    /// its next wakeup.
    pub fn set_monitor_interval(&self, interval: Duration) {
        if interval > Duration::ZERO {
            let _ = self.monitor_interval.send_replace(interval);
        }
    }

    pub(crate) fn monitor_interval(&self) -> watch::Receiver<Duration> {
        self.monitor_interval.subscribe()
    }

    fn lock_for(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.instance_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Every locally known instance: the standard tree plus adopted services
    /// registered under `external/`.
    pub fn known_instances(&self) -> Vec<InstanceDirInfo> {
        let mut list = manifest::scan_instance_dirs(&self.root);
        list.extend(manifest::scan_instance_dirs(&self.root.join(EXTERNAL_DIR)));
        list
    }

    pub fn find_instance_dir(&self, instance_id: &str) -> Result<PathBuf> {
        self.known_instances()
            .into_iter()
            .find(|i| i.instance_id == instance_id)
            .map(|i| i.dir)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))
    }

    // -- deploy ------------------------------------------------------------

    /// Fetch the package (once per version, however many instances ask),
    /// wipe-and-extract into the instance directory and write the merged
    /// manifest. A running previous version is stopped first.
    pub async fn deploy(&self, req: &DeployRequest) -> Result<()> {
        let lock = self.lock_for(&req.instance_id);
        let _guard = lock.lock().await;

        let archive = self
            .cache
            .fetch(&req.service_name, &req.version, &req.download_url)
            .await?;

        let inst_dir = self
            .root
            .join(&req.system_name)
            .join(format!("{}_{}", req.service_name, req.instance_id));
        if inst_dir.exists() {
            process::stop(&inst_dir, self.launcher.as_ref(), &self.table).await?;
        }

        deploy::extract_zip(archive, inst_dir.clone()).await?;
        let mf = deploy::merged_manifest(&inst_dir, req);
        mf.write(&inst_dir)?;

        info!(
            instance = %req.instance_id,
            service = %req.service_name,
            version = %req.version,
            "deployed"
        );
        self.sink.report(InstanceStatusReport::transition(
            &req.instance_id,
            STATUS_STOPPED,
            0,
            0,
        ));
        Ok(())
    }

    // -- lifecycle ---------------------------------------------------------

    pub async fn start(&self, instance_id: &str) -> Result<InstanceStatusReport> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let dir = self.find_instance_dir(instance_id)?;
        let out = process::start(&dir, self.launcher.as_ref(), &self.table).await?;
        let report =
            InstanceStatusReport::transition(instance_id, STATUS_RUNNING, out.pid, out.started_at);
        self.sink.report(report.clone());
        Ok(report)
    }

    pub async fn stop(&self, instance_id: &str) -> Result<InstanceStatusReport> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let dir = self.find_instance_dir(instance_id)?;
        process::stop(&dir, self.launcher.as_ref(), &self.table).await?;
        let report = InstanceStatusReport::transition(instance_id, STATUS_STOPPED, 0, 0);
        self.sink.report(report.clone());
        Ok(report)
    }

    pub async fn destroy(&self, instance_id: &str) -> Result<InstanceStatusReport> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let dir = self.find_instance_dir(instance_id)?;
        process::destroy(&dir, self.launcher.as_ref(), &self.table).await?;
        self.instance_locks.remove(instance_id);
        let report = InstanceStatusReport::transition(instance_id, STATUS_STOPPED, 0, 0);
        self.sink.report(report.clone());
        Ok(report)
    }

    /// Current status of one instance, PID revalidated.
    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatusReport> {
        let dir = self.find_instance_dir(instance_id)?;
        let mf = ServiceManifest::read(&dir).unwrap_or_default();
        let exec_dir = mf.exec_dir(&dir);

        let mut t = self.table.lock().await;
        if let Some(pid) = manifest::read_pid(&dir) {
            t.refresh_pid(pid);
            if t.validate(pid, &exec_dir, &process::expected_bin(&mf)) {
                let started = t.sample(pid).map(|s| s.start_time_secs as i64).unwrap_or(0);
                return Ok(InstanceStatusReport::transition(
                    instance_id,
                    STATUS_RUNNING,
                    pid,
                    started,
                ));
            }
        }
        Ok(InstanceStatusReport::transition(
            instance_id,
            STATUS_STOPPED,
            0,
            0,
        ))
    }

    // -- hygiene -----------------------------------------------------------

    pub fn cleanup_cache(&self, retain: i32) -> Result<CleanupOutcome> {
        cleaner::cleanup_cache(self.cache.dir(), retain)
    }

    pub fn scan_orphans(
        &self,
        valid_systems: &[String],
        valid_instances: &[String],
    ) -> Vec<crate::protocol::messages::OrphanItem> {
        cleaner::scan_orphans(&self.root, valid_systems, valid_instances)
    }

    pub fn delete_orphans(&self, rel_paths: &[String]) -> usize {
        cleaner::delete_orphans(&self.root, rel_paths)
    }

    // -- logs --------------------------------------------------------------

    pub fn log_files(&self, instance_id: &str) -> Result<Vec<String>> {
        let dir = self.find_instance_dir(instance_id)?;
        Ok(manifest::log_file_names(&dir))
    }

    pub fn log_path(&self, instance_id: &str, log_key: &str) -> Result<PathBuf> {
        let dir = self.find_instance_dir(instance_id)?;
        manifest::resolve_log_path(&dir, log_key)
    }

    pub(crate) fn table(&self) -> &Mutex<ProcessTable> {
        &self.table
    }
}
