//! Channel client tests against a scripted master listener.

use std::time::Duration;

use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use opsfleet::protocol::frame::{read_frame, write_frame, Hello};
use opsfleet::protocol::messages::{
    CommandPayload, CommandResult, ConfigUpdate, InstanceAction, InstanceActionRequest,
    RegisterRequest,
};
use opsfleet::protocol::{Envelope, EnvelopeKind};
use opsfleet::worker::ChannelClient;
use opsfleet::WorkerConfig;

const SECRET: &str = "hunter2";

struct MasterSide {
    stream: TcpStream,
}

impl MasterSide {
    /// Accept one worker connection and consume hello + register.
    async fn accept(listener: &TcpListener) -> (Self, RegisterRequest) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let hello_bytes = read_frame(&mut stream).await.unwrap();
        let hello: Hello = serde_json::from_slice(&hello_bytes).unwrap();
        assert_eq!(hello.secret(), SECRET);
        assert!(matches!(hello, Hello::Control { .. }));

        let frame = read_frame(&mut stream).await.unwrap();
        let env = Envelope::decode(&frame).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Register);
        let register: RegisterRequest = env.payload_as().unwrap();
        (Self { stream }, register)
    }

    async fn send(&mut self, env: Envelope) {
        write_frame(&mut self.stream, &env.encode().unwrap())
            .await
            .unwrap();
    }

    /// Read envelopes until one of the wanted kind arrives (heartbeats and
    /// status reports interleave freely).
    async fn recv_kind(&mut self, kind: EnvelopeKind) -> Envelope {
        loop {
            let frame = read_frame(&mut self.stream).await.unwrap();
            let env = Envelope::decode(&frame).unwrap();
            if env.kind == kind {
                return env;
            }
        }
    }
}

fn client(tmp: &TempDir, addr: std::net::SocketAddr) -> std::sync::Arc<ChannelClient> {
    let mut config = WorkerConfig::new(addr.to_string(), SECRET).with_work_dir(tmp.path());
    config.heartbeat_interval_secs = 1;
    config.dial_retry_secs = 1;
    config.reconnect_delay_secs = 1;
    ChannelClient::new(config).unwrap()
}

#[tokio::test]
async fn client_registers_and_heartbeats() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tmp = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    let c = client(&tmp, addr);
    let node_id = c.node_id().to_string();
    tokio::spawn(c.run(shutdown.clone()));

    let (mut master, register) = MasterSide::accept(&listener).await;
    assert_eq!(register.info.id, node_id);
    assert!(register.info.cpu_cores > 0);

    let hb = tokio::time::timeout(
        Duration::from_secs(5),
        master.recv_kind(EnvelopeKind::Heartbeat),
    )
    .await
    .expect("no heartbeat within 5s");
    assert!(hb.id.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn client_reconnects_and_reregisters_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tmp = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    let c = client(&tmp, addr);
    let node_id = c.node_id().to_string();
    tokio::spawn(c.run(shutdown.clone()));

    let (master, first) = MasterSide::accept(&listener).await;
    drop(master);

    // Same identity comes back on the fresh connection.
    let (_master, second) = tokio::time::timeout(
        Duration::from_secs(10),
        MasterSide::accept(&listener),
    )
    .await
    .expect("no reconnect within 10s");
    assert_eq!(first.info.id, node_id);
    assert_eq!(second.info.id, node_id);

    shutdown.cancel();
}

#[tokio::test]
async fn command_for_unknown_instance_returns_failure_result() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tmp = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(client(&tmp, addr).run(shutdown.clone()));
    let (mut master, _) = MasterSide::accept(&listener).await;

    let cmd = CommandPayload::InstanceAction(InstanceActionRequest {
        instance_id: "does-not-exist".into(),
        action: InstanceAction::Start,
    });
    master
        .send(Envelope::new(EnvelopeKind::Command, "req-1", &cmd).unwrap())
        .await;

    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        master.recv_kind(EnvelopeKind::Response),
    )
    .await
    .expect("no response within 5s");
    assert_eq!(resp.id, "req-1");
    let result: CommandResult = resp.payload_as().unwrap();
    assert!(!result.ok);
    assert!(result.error.unwrap().contains("does-not-exist"));

    shutdown.cancel();
}

#[tokio::test]
async fn config_push_shortens_heartbeat_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tmp = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    let c = {
        let mut config = WorkerConfig::new(addr.to_string(), SECRET).with_work_dir(tmp.path());
        // Slow enough that only a config push can explain fast heartbeats.
        config.heartbeat_interval_secs = 3600;
        ChannelClient::new(config).unwrap()
    };
    tokio::spawn(c.run(shutdown.clone()));
    let (mut master, _) = MasterSide::accept(&listener).await;

    master
        .send(
            Envelope::oneway(
                EnvelopeKind::Config,
                &ConfigUpdate {
                    heartbeat_interval: 1,
                    monitor_interval: 0,
                },
            )
            .unwrap(),
        )
        .await;

    tokio::time::timeout(
        Duration::from_secs(10),
        master.recv_kind(EnvelopeKind::Heartbeat),
    )
    .await
    .expect("config push did not take effect");

    shutdown.cancel();
}

#[tokio::test]
async fn malformed_envelope_does_not_kill_the_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tmp = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(client(&tmp, addr).run(shutdown.clone()));
    let (mut master, _) = MasterSide::accept(&listener).await;

    write_frame(&mut master.stream, b"{\"not\":\"an envelope\"}")
        .await
        .unwrap();

    // The client skips the bad frame and still answers real requests.
    let cmd = CommandPayload::InstanceAction(InstanceActionRequest {
        instance_id: "ghost".into(),
        action: InstanceAction::Stop,
    });
    master
        .send(Envelope::new(EnvelopeKind::Command, "req-2", &cmd).unwrap())
        .await;
    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        master.recv_kind(EnvelopeKind::Response),
    )
    .await
    .expect("channel died after malformed frame");
    assert_eq!(resp.id, "req-2");

    shutdown.cancel();
}
