//! Persistent control channel to the master.
//!
//! The client dials, sends the control hello and a `register` envelope, then
//! runs one reader and one writer task until the connection drops. Every
//! drop is followed by a fresh dial after a short delay; the loop only ends
//! on shutdown. All outbound traffic (heartbeats, status reports, command
//! replies) funnels through one bounded queue owned by the current
//! connection generation.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::executor::{run_monitor, Executor, StatusSink};
use crate::protocol::frame::{read_frame, write_frame, Hello};
use crate::protocol::messages::{
    CleanupCacheRequest, CleanupCacheResponse, CommandPayload, CommandResult, ConfigUpdate,
    InstanceStatusReport, LogFilesRequest, LogFilesResponse, OrphanDeleteRequest,
    OrphanDeleteResponse, OrphanScanRequest, OrphanScanResponse, RegisterRequest, TunnelKind,
    WakeOnLanRequest,
};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::worker::collector::Collector;
use crate::worker::{identity, tunnel, wol};

/// Handle to the current connection's outbound queue. Between connections it
/// is unbound and everything enqueued is dropped, so producers (monitor,
/// heartbeat) never block on a dead link.
pub struct OutboundQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            tx: std::sync::Mutex::new(None),
        }
    }

    fn bind(&self, tx: mpsc::Sender<Envelope>) {
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    fn unbind(&self) {
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Non-blocking enqueue; a full queue or an unbound link drops the
    /// envelope.
    pub fn enqueue(&self, env: Envelope) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if let Err(e) = tx.try_send(env) {
                debug!(error = %e, "outbound queue full, dropping envelope");
            }
        }
    }
}

impl StatusSink for OutboundQueue {
    fn report(&self, report: InstanceStatusReport) {
        match Envelope::oneway(EnvelopeKind::StatusReport, &report) {
            Ok(env) => self.enqueue(env),
            Err(e) => error!(error = %e, "failed to encode status report"),
        }
    }
}

pub struct ChannelClient {
    config: WorkerConfig,
    node_id: String,
    executor: Arc<Executor>,
    collector: Mutex<Collector>,
    outbound: Arc<OutboundQueue>,
    heartbeat_interval: watch::Sender<Duration>,
}

impl ChannelClient {
    pub fn new(config: WorkerConfig) -> Result<Arc<Self>> {
        let node_id = identity::load_or_create(&config.work_dir)?;
        let outbound = Arc::new(OutboundQueue::new());
        let sink: Arc<dyn StatusSink> = outbound.clone();
        let executor = Arc::new(Executor::new(config.work_dir.clone(), sink)?);
        executor.set_monitor_interval(Duration::from_secs(config.monitor_interval_secs));
        let (heartbeat_interval, _) =
            watch::channel(Duration::from_secs(config.heartbeat_interval_secs));

        Ok(Arc::new(Self {
            config,
            node_id,
            executor,
            collector: Mutex::new(Collector::new()),
            outbound,
            heartbeat_interval,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Dial-and-serve forever. Returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(run_monitor(self.executor.clone(), shutdown.clone()));

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match TcpStream::connect(&self.config.master_addr).await {
                Ok(stream) => {
                    info!(master = %self.config.master_addr, node_id = %self.node_id, "connected");
                    self.session(stream, &shutdown).await;
                    if shutdown.is_cancelled() {
                        return;
                    }
                    warn!("connection to master lost, reconnecting");
                    if sleep_or_shutdown(self.config.reconnect_delay_secs, &shutdown).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(master = %self.config.master_addr, error = %e, "dial failed");
                    if sleep_or_shutdown(self.config.dial_retry_secs, &shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    /// One connection generation: hello, register, then pump frames until
    /// either side fails or shutdown fires.
    async fn session(self: &Arc<Self>, stream: TcpStream, shutdown: &CancellationToken) {
        let (mut reader, mut writer) = stream.into_split();

        let hello = Hello::Control {
            secret: self.config.secret.clone(),
        };
        let hello_bytes = match serde_json::to_vec(&hello) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode hello");
                return;
            }
        };
        if let Err(e) = write_frame(&mut writer, &hello_bytes).await {
            warn!(error = %e, "hello failed");
            return;
        }

        let generation = shutdown.child_token();
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.config.send_queue_depth);
        self.outbound.bind(tx);

        if let Err(e) = self.send_register().await {
            error!(error = %e, "failed to enqueue registration");
        }

        // Writer task: drains the queue onto the socket.
        let writer_gen = generation.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_gen.cancelled() => return,
                    env = rx.recv() => {
                        let Some(env) = env else { return };
                        let bytes = match env.encode() {
                            Ok(b) => b,
                            Err(e) => {
                                error!(error = %e, "failed to encode envelope");
                                continue;
                            }
                        };
                        if let Err(e) = write_frame(&mut writer, &bytes).await {
                            debug!(error = %e, "write failed");
                            writer_gen.cancel();
                            return;
                        }
                    }
                }
            }
        });

        // Heartbeat task: ticks at the current interval, which the master
        // can change live via a config push.
        let hb = self.clone();
        let hb_gen = generation.clone();
        let mut hb_interval = self.heartbeat_interval.subscribe();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                let interval = *hb_interval.borrow_and_update();
                tokio::select! {
                    _ = hb_gen.cancelled() => return,
                    _ = hb_interval.changed() => continue,
                    _ = tokio::time::sleep(interval) => {}
                }
                let status = hb.collector.lock().await.node_status();
                match Envelope::oneway(EnvelopeKind::Heartbeat, &status) {
                    Ok(env) => hb.outbound.enqueue(env),
                    Err(e) => error!(error = %e, "failed to encode heartbeat"),
                }
            }
        });

        // Reader loop: dispatch every inbound envelope. Command handlers can
        // block for tens of seconds (readiness probes), so each runs in its
        // own task and replies through the queue.
        loop {
            tokio::select! {
                _ = generation.cancelled() => break,
                frame = read_frame(&mut reader) => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(error = %e, "read failed");
                            break;
                        }
                    };
                    match Envelope::decode(&frame) {
                        Ok(env) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.dispatch(env).await });
                        }
                        Err(e) => warn!(error = %e, "skipping malformed envelope"),
                    }
                }
            }
        }

        generation.cancel();
        self.outbound.unbind();
        let _ = writer_task.await;
        let _ = heartbeat_task.await;
    }

    async fn send_register(&self) -> Result<()> {
        let mut collector = self.collector.lock().await;
        let req = RegisterRequest {
            info: collector.node_info(&self.node_id),
            status: collector.node_status(),
        };
        drop(collector);
        self.outbound
            .enqueue(Envelope::oneway(EnvelopeKind::Register, &req)?);
        Ok(())
    }

    fn reply<T: serde::Serialize>(&self, request_id: &str, payload: &T) {
        if request_id.is_empty() {
            return;
        }
        match Envelope::response(request_id, payload) {
            Ok(env) => self.outbound.enqueue(env),
            Err(e) => error!(error = %e, "failed to encode response"),
        }
    }

    async fn dispatch(self: Arc<Self>, env: Envelope) {
        match env.kind {
            EnvelopeKind::Command => self.handle_command(env).await,
            EnvelopeKind::Config => match env.payload_as::<ConfigUpdate>() {
                Ok(update) => self.apply_config(update),
                Err(e) => warn!(error = %e, "bad config payload"),
            },
            EnvelopeKind::LogFiles => {
                let resp = match env.payload_as::<LogFilesRequest>() {
                    Ok(req) => match self.executor.log_files(&req.instance_id) {
                        Ok(files) => LogFilesResponse {
                            instance_id: req.instance_id,
                            files,
                            error: None,
                        },
                        Err(e) => LogFilesResponse {
                            instance_id: req.instance_id,
                            files: Vec::new(),
                            error: Some(e.to_string()),
                        },
                    },
                    Err(e) => LogFilesResponse {
                        instance_id: String::new(),
                        files: Vec::new(),
                        error: Some(e.to_string()),
                    },
                };
                self.reply(&env.id, &resp);
            }
            EnvelopeKind::CleanupCache => {
                let resp = match env.payload_as::<CleanupCacheRequest>() {
                    Ok(req) => {
                        let ex = self.executor.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            ex.cleanup_cache(req.retain)
                        })
                        .await;
                        match outcome {
                            Ok(Ok(out)) => CleanupCacheResponse {
                                node_id: self.node_id.clone(),
                                freed_bytes: out.freed_bytes,
                                deleted_files: out.deleted_files,
                                errors: out.errors,
                            },
                            Ok(Err(e)) => CleanupCacheResponse {
                                node_id: self.node_id.clone(),
                                errors: vec![e.to_string()],
                                ..Default::default()
                            },
                            Err(e) => CleanupCacheResponse {
                                node_id: self.node_id.clone(),
                                errors: vec![e.to_string()],
                                ..Default::default()
                            },
                        }
                    }
                    Err(e) => CleanupCacheResponse {
                        node_id: self.node_id.clone(),
                        errors: vec![e.to_string()],
                        ..Default::default()
                    },
                };
                self.reply(&env.id, &resp);
            }
            EnvelopeKind::ScanOrphans => {
                let resp = match env.payload_as::<OrphanScanRequest>() {
                    Ok(req) => {
                        let ex = self.executor.clone();
                        let items = tokio::task::spawn_blocking(move || {
                            ex.scan_orphans(&req.valid_systems, &req.valid_instances)
                        })
                        .await;
                        match items {
                            Ok(items) => OrphanScanResponse { items, error: None },
                            Err(e) => OrphanScanResponse {
                                items: Vec::new(),
                                error: Some(e.to_string()),
                            },
                        }
                    }
                    Err(e) => OrphanScanResponse {
                        items: Vec::new(),
                        error: Some(e.to_string()),
                    },
                };
                self.reply(&env.id, &resp);
            }
            EnvelopeKind::DeleteOrphans => {
                let resp = match env.payload_as::<OrphanDeleteRequest>() {
                    Ok(req) => {
                        let ex = self.executor.clone();
                        let n = tokio::task::spawn_blocking(move || {
                            ex.delete_orphans(&req.items)
                        })
                        .await;
                        match n {
                            Ok(deleted_count) => OrphanDeleteResponse {
                                deleted_count,
                                error: None,
                            },
                            Err(e) => OrphanDeleteResponse {
                                deleted_count: 0,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                    Err(e) => OrphanDeleteResponse {
                        deleted_count: 0,
                        error: Some(e.to_string()),
                    },
                };
                self.reply(&env.id, &resp);
            }
            EnvelopeKind::WakeOnLan => match env.payload_as::<WakeOnLanRequest>() {
                Ok(req) => {
                    if let Err(e) = wol::send_wake(&req.mac_addr).await {
                        warn!(mac = %req.mac_addr, error = %e, "wake-on-lan relay failed");
                    }
                }
                Err(e) => warn!(error = %e, "bad wake-on-lan payload"),
            },
            // Worker-originated kinds are never expected inbound.
            other => warn!(kind = %other, "unexpected envelope from master"),
        }
    }

    async fn handle_command(&self, env: Envelope) {
        let payload = match env.payload_as::<CommandPayload>() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "skipping unknown command");
                self.reply(&env.id, &CommandResult::failure(e.to_string()));
                return;
            }
        };

        let result = match payload {
            CommandPayload::InstanceAction(req) => {
                use crate::protocol::messages::InstanceAction;
                let outcome = match req.action {
                    InstanceAction::Start => self.executor.start(&req.instance_id).await,
                    InstanceAction::Stop => self.executor.stop(&req.instance_id).await,
                    InstanceAction::Destroy => self.executor.destroy(&req.instance_id).await,
                };
                match outcome {
                    Ok(report) => CommandResult::success(Some(report)),
                    Err(e) => {
                        error!(instance = %req.instance_id, action = ?req.action, error = %e, "instance action failed");
                        CommandResult::failure(e.to_string())
                    }
                }
            }
            CommandPayload::Deploy(req) => {
                // Deploys take a while; report a transitional status right
                // away so the master knows the request was not dropped.
                self.outbound
                    .report(InstanceStatusReport::transition(
                        &req.instance_id,
                        crate::executor::STATUS_DEPLOYING,
                        0,
                        0,
                    ));
                match self.executor.deploy(&req).await {
                    Ok(()) => CommandResult::success(None),
                    Err(e) => {
                        error!(instance = %req.instance_id, error = %e, "deploy failed");
                        self.outbound.report(InstanceStatusReport::transition(
                            &req.instance_id,
                            crate::executor::STATUS_FAILED,
                            0,
                            0,
                        ));
                        CommandResult::failure(e.to_string())
                    }
                }
            }
            CommandPayload::StartTunnel(req) => {
                let log_path = match req.kind {
                    TunnelKind::Log => {
                        let instance = req.instance_id.clone().unwrap_or_default();
                        let key = req.log_key.clone().unwrap_or_default();
                        match self.executor.log_path(&instance, &key) {
                            Ok(p) => Some(p),
                            Err(e) => {
                                warn!(instance = %instance, error = %e, "log tunnel refused");
                                self.reply(&env.id, &CommandResult::failure(e.to_string()));
                                return;
                            }
                        }
                    }
                    TunnelKind::Terminal => None,
                };
                tokio::spawn(tunnel::run(tunnel::TunnelTask {
                    master_addr: self.config.master_addr.clone(),
                    secret: self.config.secret.clone(),
                    request: req,
                    log_path,
                }));
                CommandResult::success(None)
            }
        };
        self.reply(&env.id, &result);
    }

    fn apply_config(&self, update: ConfigUpdate) {
        info!(
            heartbeat = update.heartbeat_interval,
            monitor = update.monitor_interval,
            "applying config push"
        );
        if update.heartbeat_interval > 0 {
            let _ = self
                .heartbeat_interval
                .send(Duration::from_secs(update.heartbeat_interval));
        }
        if update.monitor_interval > 0 {
            self.executor
                .set_monitor_interval(Duration::from_secs(update.monitor_interval));
        }
    }
}

/// Returns true when shutdown fired during the sleep.
async fn sleep_or_shutdown(secs: u64, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(Duration::from_secs(secs)) => false,
    }
}
