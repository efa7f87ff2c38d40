//! Package fetch, cache and extraction.
//!
//! Artifacts land in `pkg_cache/<service>_<version>.zip`. The download is
//! single-flight per cache key: concurrent deploys of the same version share
//! one fetch, and the artifact appears in the cache atomically (tempfile in
//! the same directory, then rename), so a crashed download never leaves a
//! half-written zip behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{FleetError, Result};
use crate::executor::manifest::ServiceManifest;
use crate::protocol::messages::DeployRequest;

const FETCH_TIMEOUT_SECS: u64 = 300;

pub fn cache_file_name(service: &str, version: &str) -> String {
    format!("{service}_{version}.zip")
}

pub struct PackageCache {
    dir: PathBuf,
    http: reqwest::Client,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PackageCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| FleetError::PackageFetch(e.to_string()))?;
        Ok(Self {
            dir,
            http,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the cached artifact path, downloading it first if absent.
    pub async fn fetch(&self, service: &str, version: &str, url: &str) -> Result<PathBuf> {
        let file_name = cache_file_name(service, version);
        let target = self.dir.join(&file_name);

        let lock = self
            .locks
            .entry(file_name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if target.exists() {
            debug!(%file_name, "package already cached");
            return Ok(target);
        }

        info!(%file_name, %url, "downloading package");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FleetError::PackageFetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(FleetError::PackageFetch(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }

        // Stream into a sibling tempfile, then rename into place.
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let tmp_path = tmp.path().to_path_buf();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut resp = resp;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| FleetError::PackageFetch(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tmp.persist(&target)
            .map_err(|e| FleetError::PackageFetch(format!("persist {file_name}: {e}")))?;
        Ok(target)
    }
}

/// Extract `archive` into `dest`, wiping whatever was there first. Redeploy
/// of the same instance is therefore idempotent but destructive. Entries are
/// resolved with `enclosed_name` to reject path traversal.
pub async fn extract_zip(archive: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &dest))
        .await
        .map_err(|e| FleetError::Extract(format!("extract task: {e}")))?
}

fn extract_zip_blocking(archive: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| FleetError::Extract(format!("{}: {e}", archive.display())))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| FleetError::Extract(e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(FleetError::Extract(format!(
                "unsafe path in archive: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Merge the packaged manifest with the deploy request. Request fields win
/// when set; the packaged `service.json` (if present) provides the rest.
pub fn merged_manifest(instance_dir: &Path, req: &DeployRequest) -> ServiceManifest {
    let mut mf = ServiceManifest::read(instance_dir).unwrap_or_default();

    mf.name = req.service_name.clone();
    mf.version = req.version.clone();
    if !req.entrypoint.is_empty() {
        mf.entrypoint = req.entrypoint.clone();
    }
    if !req.args.is_empty() {
        mf.args = req.args.clone();
    }
    for (k, v) in &req.env {
        mf.env.insert(k.clone(), v.clone());
    }
    if !req.readiness_type.is_empty() {
        mf.readiness_type = req.readiness_type.clone();
        mf.readiness_target = req.readiness_target.clone();
        mf.readiness_timeout = req.readiness_timeout;
    }
    mf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn make_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                w.start_file(*name, opts).unwrap();
                w.write_all(body.as_bytes()).unwrap();
            }
            w.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn extract_is_destructive_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.zip");
        std::fs::write(
            &archive,
            make_zip(&[("bin/run.sh", "#!/bin/sh\n"), ("conf/app.toml", "x=1\n")]),
        )
        .unwrap();

        let dest = tmp.path().join("inst");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        extract_zip(archive.clone(), dest.clone()).await.unwrap();
        assert!(dest.join("bin/run.sh").exists());
        assert!(dest.join("conf/app.toml").exists());
        assert!(!dest.join("stale.txt").exists());

        // Second run over the same dest succeeds.
        extract_zip(archive, dest.clone()).await.unwrap();
        assert!(dest.join("bin/run.sh").exists());
    }

    #[tokio::test]
    async fn extract_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("evil.zip");
        std::fs::write(&archive, make_zip(&[("../escape.txt", "boom")])).unwrap();

        let err = extract_zip(archive, tmp.path().join("inst"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Extract(_)));
    }

    #[test]
    fn request_overrides_packaged_manifest() {
        let tmp = TempDir::new().unwrap();
        let packaged = ServiceManifest {
            name: "old".into(),
            entrypoint: "bin/old.sh".into(),
            readiness_type: "tcp".into(),
            readiness_target: "127.0.0.1:1".into(),
            ..Default::default()
        };
        packaged.write(tmp.path()).unwrap();

        let req = DeployRequest {
            instance_id: "i-1".into(),
            system_name: "Sys".into(),
            service_name: "gateway".into(),
            version: "2.0".into(),
            download_url: "http://unused".into(),
            readiness_type: "http".into(),
            readiness_target: "http://127.0.0.1:9/healthz".into(),
            readiness_timeout: 10,
            ..Default::default()
        };

        let mf = merged_manifest(tmp.path(), &req);
        assert_eq!(mf.name, "gateway");
        assert_eq!(mf.version, "2.0");
        // Entry point not set in the request keeps the packaged value.
        assert_eq!(mf.entrypoint, "bin/old.sh");
        assert_eq!(mf.readiness_type, "http");
        assert_eq!(mf.readiness_timeout, 10);
    }

    #[test]
    fn cache_names_follow_service_version_convention() {
        assert_eq!(cache_file_name("gateway", "1.4.2"), "gateway_1.4.2.zip");
    }
}
