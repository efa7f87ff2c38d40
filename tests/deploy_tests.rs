//! Deploy pipeline tests: package fetch, cache sharing and lifecycle.

use std::io::Write as _;
use std::sync::Arc;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use opsfleet::executor::{Executor, NullStatusSink};
use opsfleet::protocol::messages::DeployRequest;

fn package_zip(entrypoint_body: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut w = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        w.start_file("run.sh", opts).unwrap();
        w.write_all(entrypoint_body.as_bytes()).unwrap();
    }
    buf
}

fn executor(tmp: &TempDir) -> Arc<Executor> {
    Arc::new(Executor::new(tmp.path().join("instances"), Arc::new(NullStatusSink)).unwrap())
}

fn request(instance_id: &str, version: &str, url: &str) -> DeployRequest {
    DeployRequest {
        instance_id: instance_id.to_string(),
        system_name: "PaySys".into(),
        service_name: "gateway".into(),
        version: version.to_string(),
        download_url: url.to_string(),
        entrypoint: "run.sh".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_deploys_of_one_version_download_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/gateway_1.0.zip"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(package_zip("#!/bin/sh\ntrue\n")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let ex = executor(&tmp);
    let url = format!("{}/pkg/gateway_1.0.zip", server.uri());

    let mut handles = Vec::new();
    for i in 0..4 {
        let ex = ex.clone();
        let req = request(&format!("inst-{i}"), "1.0", &url);
        handles.push(tokio::spawn(async move { ex.deploy(&req).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    for i in 0..4 {
        let dir = ex.root().join(format!("PaySys/gateway_inst-{i}"));
        assert!(dir.join("run.sh").exists(), "instance {i} not extracted");
        assert!(dir.join("service.json").exists());
    }
    assert!(ex.root().join("pkg_cache/gateway_1.0.zip").exists());
    // expect(1) on the mock verifies the single fetch at drop.
}

#[tokio::test]
async fn redeploy_reuses_cache_and_replaces_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/gateway_2.0.zip"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(package_zip("#!/bin/sh\ntrue\n")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let ex = executor(&tmp);
    let url = format!("{}/pkg/gateway_2.0.zip", server.uri());
    let req = request("inst-r", "2.0", &url);

    ex.deploy(&req).await.unwrap();
    let dir = ex.root().join("PaySys/gateway_inst-r");
    std::fs::write(dir.join("leftover.tmp"), "junk").unwrap();

    ex.deploy(&req).await.unwrap();
    assert!(!dir.join("leftover.tmp").exists());
    assert!(dir.join("run.sh").exists());
}

#[tokio::test]
async fn failed_download_leaves_no_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/gateway_9.9.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let ex = executor(&tmp);
    let url = format!("{}/pkg/gateway_9.9.zip", server.uri());

    let err = ex.deploy(&request("inst-x", "9.9", &url)).await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert!(!ex.root().join("pkg_cache/gateway_9.9.zip").exists());
    assert!(!ex.root().join("PaySys/gateway_inst-x").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn deployed_instance_starts_and_stops() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/gateway_3.0.zip"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(package_zip("#!/bin/sh\nexec sleep 60\n")),
        )
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let ex = executor(&tmp);
    let url = format!("{}/pkg/gateway_3.0.zip", server.uri());
    ex.deploy(&request("inst-s", "3.0", &url)).await.unwrap();

    let started = ex.start("inst-s").await.unwrap();
    assert_eq!(started.status, "running");
    assert!(started.pid > 0);

    // Duplicate start observes the same process.
    let again = ex.start("inst-s").await.unwrap();
    assert_eq!(again.pid, started.pid);

    let status = ex.status("inst-s").await.unwrap();
    assert_eq!(status.status, "running");
    assert_eq!(status.pid, started.pid);

    let stopped = ex.stop("inst-s").await.unwrap();
    assert_eq!(stopped.status, "stopped");
    let status = ex.status("inst-s").await.unwrap();
    assert_eq!(status.status, "stopped");
    assert_eq!(status.pid, 0);
}
