//! Master-side worker gateway.
//!
//! One TCP listener accepts both control connections (persistent envelope
//! channels from workers) and tunnel dial-backs. The first frame is a hello
//! that authenticates the connection and says which it is. Connections bind
//! to a node id lazily, on the first `register` envelope; a re-register for
//! the same id wins and the older connection is cancelled.

mod connection;
pub mod tunnel;

pub use connection::Connection;
pub use tunnel::{bridge, TunnelBroker};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MasterConfig;
use crate::error::{FleetError, Result};
use crate::protocol::frame::{read_frame, Hello};
use crate::protocol::messages::{
    CommandPayload, CommandResult, ConfigUpdate, InstanceStatusReport, NodeInfo, NodeStatus,
    TunnelStartRequest, WakeOnLanRequest,
};
use crate::protocol::{Envelope, EnvelopeKind};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Fleet-state consumer for node lifecycle events. Injected at construction;
/// the gateway itself keeps no fleet state beyond live connections.
pub trait NodeSink: Send + Sync {
    fn node_registered(&self, info: NodeInfo, status: NodeStatus);
    fn node_heartbeat(&self, node_id: &str, status: NodeStatus);
    fn node_offline(&self, node_id: &str);
}

/// Consumer for instance status reports relayed by workers.
pub trait InstanceSink: Send + Sync {
    fn instance_report(&self, node_id: &str, report: InstanceStatusReport);
}

pub struct ConnectionGateway {
    config: MasterConfig,
    registry: DashMap<String, Arc<Connection>>,
    pending_calls: DashMap<String, oneshot::Sender<Box<RawValue>>>,
    broker: TunnelBroker,
    node_sink: Arc<dyn NodeSink>,
    instance_sink: Arc<dyn InstanceSink>,
}

impl ConnectionGateway {
    pub fn new(
        config: MasterConfig,
        node_sink: Arc<dyn NodeSink>,
        instance_sink: Arc<dyn InstanceSink>,
    ) -> Arc<Self> {
        let broker = TunnelBroker::new(Duration::from_secs(config.tunnel_wait_secs));
        Arc::new(Self {
            config,
            registry: DashMap::new(),
            pending_calls: DashMap::new(),
            broker,
            node_sink,
            instance_sink,
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Bind the configured address and serve; returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_on(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_on(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("gateway stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_inbound(stream, shutdown).await {
                            debug!(%peer, error = %e, "inbound connection ended");
                        }
                    });
                }
            }
        }
    }

    /// Read the hello, authenticate, and route the connection.
    async fn handle_inbound(
        self: Arc<Self>,
        mut stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| FleetError::Timeout(HELLO_TIMEOUT))??;
        let hello: Hello = serde_json::from_slice(&frame)
            .map_err(|e| FleetError::MalformedEnvelope(format!("hello: {e}")))?;

        if hello.secret() != self.config.secret {
            warn!("rejecting connection with bad secret");
            return Err(FleetError::Transport("authentication failed".into()));
        }

        match hello {
            Hello::Control { .. } => self.serve_control(stream, shutdown).await,
            Hello::Tunnel { session_id, .. } => {
                self.broker.claim(&session_id, stream)?;
                Ok(())
            }
        }
    }

    // -- outbound ----------------------------------------------------------

    fn connection(&self, node_id: &str) -> Result<Arc<Connection>> {
        self.registry
            .get(node_id)
            .map(|c| c.clone())
            .ok_or_else(|| FleetError::WorkerUnreachable(node_id.to_string()))
    }

    /// Fire-and-forget send. Fails fast when the worker is offline or its
    /// queue is full; the caller decides whether to surface or retry.
    pub fn send(&self, node_id: &str, env: Envelope) -> Result<()> {
        self.connection(node_id)?.try_send(node_id, env)
    }

    pub fn send_command(&self, node_id: &str, payload: &CommandPayload) -> Result<()> {
        self.send(node_id, Envelope::oneway(EnvelopeKind::Command, payload)?)
    }

    /// Correlated request/response over the worker channel. The reply is the
    /// raw payload; the caller knows the schema.
    pub async fn sync_call<T: Serialize>(
        &self,
        node_id: &str,
        kind: EnvelopeKind,
        payload: &T,
        timeout: Duration,
    ) -> Result<Box<RawValue>> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_calls.insert(id.clone(), tx);

        let env = Envelope::new(kind, id.clone(), payload)?;
        if let Err(e) = self.send(node_id, env) {
            self.pending_calls.remove(&id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending_calls.remove(&id);
        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(FleetError::ConnectionClosed),
            Err(_) => Err(FleetError::Timeout(timeout)),
        }
    }

    /// `command` envelope with a correlated [`CommandResult`] reply.
    pub async fn command_call(
        &self,
        node_id: &str,
        payload: &CommandPayload,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let raw = self
            .sync_call(node_id, EnvelopeKind::Command, payload, timeout)
            .await?;
        serde_json::from_str(raw.get())
            .map_err(|e| FleetError::MalformedEnvelope(format!("command result: {e}")))
    }

    pub(crate) fn complete_call(&self, request_id: &str, payload: Box<RawValue>) {
        match self.pending_calls.remove(request_id) {
            Some((_, tx)) => {
                let _ = tx.send(payload);
            }
            None => debug!(id = %request_id, "response for unknown or expired call"),
        }
    }

    /// Push interval settings to every connected worker.
    pub fn broadcast_config(&self, update: ConfigUpdate) {
        for entry in self.registry.iter() {
            if let Ok(env) = Envelope::oneway(EnvelopeKind::Config, &update) {
                if let Err(e) = entry.value().try_send(entry.key(), env) {
                    warn!(node_id = %entry.key(), error = %e, "config push failed");
                }
            }
        }
    }

    pub(crate) fn initial_config(&self) -> ConfigUpdate {
        ConfigUpdate {
            heartbeat_interval: self.config.heartbeat_interval_secs,
            monitor_interval: self.config.monitor_interval_secs,
        }
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.registry.contains_key(node_id)
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    /// Relay a wake-on-LAN request through an online worker on the target's
    /// segment.
    pub fn send_wake(&self, via_node_id: &str, mac_addr: &str) -> Result<()> {
        let req = WakeOnLanRequest {
            mac_addr: mac_addr.to_string(),
        };
        self.send(
            via_node_id,
            Envelope::oneway(EnvelopeKind::WakeOnLan, &req)?,
        )
    }

    /// Ask the worker to dial back a tunnel and wait for it to arrive. The
    /// returned stream is the raw worker side, ready to be bridged to the
    /// operator.
    pub async fn open_tunnel(
        &self,
        node_id: &str,
        mut request: TunnelStartRequest,
    ) -> Result<TcpStream> {
        if request.session_id.is_empty() {
            request.session_id = Uuid::new_v4().to_string();
        }
        let session_id = request.session_id.clone();
        self.send_command(node_id, &CommandPayload::StartTunnel(request))?;
        self.broker.await_worker(&session_id).await
    }

    // connection.rs internals
    pub(crate) fn registry(&self) -> &DashMap<String, Arc<Connection>> {
        &self.registry
    }

    pub(crate) fn node_sink(&self) -> &Arc<dyn NodeSink> {
        &self.node_sink
    }

    pub(crate) fn instance_sink(&self) -> &Arc<dyn InstanceSink> {
        &self.instance_sink
    }
}
