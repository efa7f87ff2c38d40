//! Placement scoring for deployment orchestration.
//!
//! The scheduler is a pure function over a snapshot of node metrics supplied
//! by an external node manager. It holds no state and takes no locks; the
//! caller fetches the snapshot and asks for the best candidate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAvailability {
    Online,
    Offline,
    Planned,
}

/// One node's entry in the metrics snapshot consumed by placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: String,
    pub ip: String,
    pub status: NodeAvailability,
    pub cpu_usage: f64,
    pub mem_usage: f64,
}

/// Provider contract for the live metrics snapshot (implemented by the node
/// manager outside this core).
pub trait NodeMetricsProvider: Send + Sync {
    fn all_nodes_metrics(&self) -> Vec<NodeMetrics>;
}

/// Weighted idle-capacity score; higher is better.
fn idle_score(node: &NodeMetrics) -> f64 {
    0.6 * (100.0 - node.cpu_usage) + 0.4 * (100.0 - node.mem_usage)
}

/// Pick the least-loaded online node.
///
/// Returns `None` when no node is online (distinct from any error path).
/// Equal scores are broken deterministically by the lowest node id, so the
/// same snapshot always yields the same placement.
pub fn select_best_node(nodes: &[NodeMetrics]) -> Option<&NodeMetrics> {
    let mut best: Option<(&NodeMetrics, f64)> = None;

    for node in nodes {
        if node.status != NodeAvailability::Online {
            continue;
        }
        let score = idle_score(node);
        best = match best {
            None => Some((node, score)),
            Some((cur, cur_score)) => {
                if score > cur_score || (score == cur_score && node.node_id < cur.node_id) {
                    Some((node, score))
                } else {
                    Some((cur, cur_score))
                }
            }
        };
    }

    if let Some((node, score)) = best {
        tracing::debug!(node_id = %node.node_id, score, "Placement candidate selected");
        Some(node)
    } else {
        tracing::warn!("No online nodes available for placement");
        None
    }
}
