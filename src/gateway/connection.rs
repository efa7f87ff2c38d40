//! One control connection: outbound queue, writer task and the inbound
//! dispatch loop.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::gateway::ConnectionGateway;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::messages::{InstanceStatusReport, NodeStatus, RegisterRequest};
use crate::protocol::{Envelope, EnvelopeKind};

/// Send handle for one live worker connection. Owned by the registry; a
/// replaced or dropped connection is cancelled through its token.
pub struct Connection {
    tx: mpsc::Sender<Envelope>,
    token: CancellationToken,
}

impl Connection {
    /// Non-blocking enqueue. A full queue means the worker is not keeping
    /// up; rather than buffer unboundedly the envelope is refused and the
    /// worker is reported unreachable.
    pub fn try_send(&self, node_id: &str, env: Envelope) -> Result<()> {
        self.tx.try_send(env).map_err(|e| {
            debug!(%node_id, error = %e, "outbound enqueue failed");
            FleetError::WorkerUnreachable(node_id.to_string())
        })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl ConnectionGateway {
    /// Serve one authenticated control connection until it drops.
    pub(crate) async fn serve_control(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let peer = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let token = shutdown.child_token();
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.config().send_queue_depth);
        let conn = Arc::new(Connection {
            tx,
            token: token.clone(),
        });

        let writer_token = token.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => return,
                    env = rx.recv() => {
                        let Some(env) = env else { return };
                        let bytes = match env.encode() {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(error = %e, "failed to encode outbound envelope");
                                continue;
                            }
                        };
                        if write_frame(&mut writer, &bytes).await.is_err() {
                            writer_token.cancel();
                            return;
                        }
                    }
                }
            }
        });

        // Node id binds on the first register envelope.
        let mut bound: Option<String> = None;
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    debug!(%peer, error = %e, "control read ended");
                    break;
                }
            };
            let env = match Envelope::decode(&frame) {
                Ok(env) => env,
                Err(e) => {
                    warn!(%peer, error = %e, "skipping malformed envelope");
                    continue;
                }
            };
            self.handle_envelope(&conn, &mut bound, env, peer);
        }

        token.cancel();
        let _ = writer_task.await;

        if let Some(node_id) = bound {
            // Only unregister if the registry still points at us; a newer
            // connection for the same node must not be knocked out.
            let ours = self
                .registry()
                .get(&node_id)
                .is_some_and(|c| Arc::ptr_eq(c.value(), &conn));
            if ours {
                self.registry().remove(&node_id);
                info!(%node_id, "worker disconnected");
                self.node_sink().node_offline(&node_id);
            }
        }
        Ok(())
    }

    fn handle_envelope(
        &self,
        conn: &Arc<Connection>,
        bound: &mut Option<String>,
        env: Envelope,
        peer: std::net::SocketAddr,
    ) {
        match env.kind {
            EnvelopeKind::Register => {
                let req: RegisterRequest = match env.payload_as() {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(%peer, error = %e, "bad register payload");
                        return;
                    }
                };
                if req.info.id.is_empty() {
                    warn!(%peer, "register without node id");
                    return;
                }

                let node_id = req.info.id.clone();
                if let Some(old) = self.registry().insert(node_id.clone(), conn.clone()) {
                    if !Arc::ptr_eq(&old, conn) {
                        info!(%node_id, "replacing stale connection");
                        old.cancel();
                    }
                }
                *bound = Some(node_id.clone());
                info!(%node_id, %peer, hostname = %req.info.hostname, "worker registered");
                self.node_sink().node_registered(req.info, req.status);

                // Hand the worker its interval settings right away.
                match Envelope::oneway(EnvelopeKind::Config, &self.initial_config()) {
                    Ok(cfg) => {
                        if let Err(e) = conn.try_send(&node_id, cfg) {
                            warn!(%node_id, error = %e, "initial config push failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode config"),
                }
            }
            EnvelopeKind::Heartbeat => {
                let Some(node_id) = bound.as_deref() else {
                    warn!(%peer, "heartbeat before register");
                    return;
                };
                match env.payload_as::<NodeStatus>() {
                    Ok(status) => self.node_sink().node_heartbeat(node_id, status),
                    Err(e) => warn!(%node_id, error = %e, "bad heartbeat payload"),
                }
            }
            EnvelopeKind::StatusReport => {
                let Some(node_id) = bound.as_deref() else {
                    warn!(%peer, "status report before register");
                    return;
                };
                match env.payload_as::<InstanceStatusReport>() {
                    Ok(report) => self.instance_sink().instance_report(node_id, report),
                    Err(e) => warn!(%node_id, error = %e, "bad status report payload"),
                }
            }
            EnvelopeKind::Response => {
                if env.id.is_empty() {
                    warn!(%peer, "response without correlation id");
                    return;
                }
                self.complete_call(&env.id, env.payload);
            }
            other => warn!(%peer, kind = %other, "unexpected envelope from worker"),
        }
    }
}
