use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dashmap::DashMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opsfleet::gateway::{ConnectionGateway, InstanceSink, NodeSink};
use opsfleet::protocol::messages::{InstanceStatusReport, NodeInfo, NodeStatus};
use opsfleet::scheduler::{select_best_node, NodeAvailability, NodeMetrics, NodeMetricsProvider};
use opsfleet::shutdown::install_shutdown_handler;
use opsfleet::worker::ChannelClient;
use opsfleet::{MasterConfig, WorkerConfig};

#[derive(Parser)]
#[command(name = "opsfleet", version, about = "Master/worker fleet orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master: worker gateway plus fleet state.
    Master {
        /// Gateway listen address.
        #[arg(long, default_value = "0.0.0.0:7300")]
        listen: SocketAddr,
        /// Shared secret workers must present.
        #[arg(long, env = "OPSFLEET_SECRET")]
        secret: String,
        /// Heartbeat interval pushed to workers, seconds.
        #[arg(long, default_value_t = 5)]
        heartbeat_interval: u64,
        /// Monitor interval pushed to workers, seconds.
        #[arg(long, default_value_t = 3)]
        monitor_interval: u64,
        /// Per-worker outbound queue depth.
        #[arg(long, default_value_t = 128)]
        queue_depth: usize,
    },
    /// Run a worker agent.
    Worker {
        /// Master gateway address, host:port.
        #[arg(long)]
        master: String,
        /// Shared secret.
        #[arg(long, env = "OPSFLEET_SECRET")]
        secret: String,
        /// Root directory for instances and the package cache.
        #[arg(long, default_value = "instances")]
        work_dir: PathBuf,
    },
}

/// In-memory fleet state fed by the gateway and read by placement.
#[derive(Default)]
struct FleetState {
    nodes: DashMap<String, NodeEntry>,
}

struct NodeEntry {
    info: NodeInfo,
    status: NodeStatus,
    online: bool,
}

impl NodeSink for FleetState {
    fn node_registered(&self, info: NodeInfo, status: NodeStatus) {
        self.nodes.insert(
            info.id.clone(),
            NodeEntry {
                info,
                status,
                online: true,
            },
        );
    }

    fn node_heartbeat(&self, node_id: &str, status: NodeStatus) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.status = status;
            entry.online = true;
        }
    }

    fn node_offline(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.online = false;
        }
    }
}

impl InstanceSink for FleetState {
    fn instance_report(&self, node_id: &str, report: InstanceStatusReport) {
        info!(
            %node_id,
            instance = %report.instance_id,
            status = %report.status,
            pid = report.pid,
            "instance report"
        );
    }
}

impl NodeMetricsProvider for FleetState {
    fn all_nodes_metrics(&self) -> Vec<NodeMetrics> {
        self.nodes
            .iter()
            .map(|e| NodeMetrics {
                node_id: e.key().clone(),
                ip: e.info.ip.clone(),
                status: if e.online {
                    NodeAvailability::Online
                } else {
                    NodeAvailability::Offline
                },
                cpu_usage: e.status.cpu_usage,
                mem_usage: e.status.mem_usage,
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> opsfleet::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let shutdown = install_shutdown_handler();

    match cli.command {
        Command::Master {
            listen,
            secret,
            heartbeat_interval,
            monitor_interval,
            queue_depth,
        } => {
            let config = MasterConfig {
                listen_addr: listen,
                secret,
                send_queue_depth: queue_depth,
                heartbeat_interval_secs: heartbeat_interval,
                monitor_interval_secs: monitor_interval,
                ..Default::default()
            };

            let state = Arc::new(FleetState::default());
            let gateway = ConnectionGateway::new(config, state.clone(), state.clone());

            // Periodic fleet summary with the current placement candidate.
            let summary_state = state.clone();
            let summary_token = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = summary_token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    }
                    let metrics = summary_state.all_nodes_metrics();
                    let online = metrics
                        .iter()
                        .filter(|m| m.status == NodeAvailability::Online)
                        .count();
                    match select_best_node(&metrics) {
                        Some(best) => info!(
                            nodes = metrics.len(),
                            online,
                            placement_candidate = %best.node_id,
                            "fleet summary"
                        ),
                        None => info!(nodes = metrics.len(), online, "fleet summary, no online nodes"),
                    }
                }
            });

            gateway.run(shutdown).await
        }
        Command::Worker {
            master,
            secret,
            work_dir,
        } => {
            let config = WorkerConfig::new(master, secret).with_work_dir(work_dir);
            let client = ChannelClient::new(config)?;
            info!(node_id = %client.node_id(), "worker starting");
            client.run(shutdown).await;
            Ok(())
        }
    }
}
