//! Commands that talk to agents.
//!
//! Each command loads the topology file, drives one reconciliation
//! procedure, and saves whatever the agents answered. The file is saved
//! even when some agents failed, so identities that did come back are kept.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{Output, json};
use crate::config::ResolvedConfig;
use crate::models::{Edge, TopologyStore};
use crate::notifications::{NotificationFeed, StatusEvent};
use crate::reconcile::{
    BatchReport, NodeOutcome, Orchestrator, PropagationReport, StepOutcome, SyncReport,
};
use crate::storage;
use crate::transport::ConnectionPool;
use crate::transport::protocol::AgentNodeInfo;
use crate::{Error, Result};

fn orchestrator(config: &ResolvedConfig) -> Orchestrator {
    Orchestrator::new(config.transport_config(), NotificationFeed::new())
}

fn load(config: &ResolvedConfig) -> Result<TopologyStore> {
    storage::load_or_default(config.topology_path())
}

fn save(config: &ResolvedConfig, store: &TopologyStore) -> Result<()> {
    storage::save(store, config.topology_path())
}

// ==================== Batch Commands ====================

impl Output for BatchReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{}: {} succeeded, {} failed, {} skipped",
            self.operation,
            self.succeeded(),
            self.failed(),
            self.skipped()
        )];
        for node in &self.nodes {
            let line = match &node.outcome {
                NodeOutcome::Succeeded {
                    agent_id,
                    hardware_id,
                } => {
                    let hardware = hardware_id
                        .as_deref()
                        .map(|h| format!(" ({})", h))
                        .unwrap_or_default();
                    format!(
                        "  ✓ {} \"{}\" {} -> agent {}{}",
                        node.local_id, node.label, node.address, agent_id, hardware
                    )
                }
                NodeOutcome::Skipped { reason } => {
                    format!("  - {} skipped: {}", node.local_id, reason)
                }
                NodeOutcome::Failed { kind, error } => format!(
                    "  ✗ {} {} failed ({:?}): {}",
                    node.local_id, node.address, kind, error
                ),
            };
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// `initialize` every agent with a label and an address.
pub async fn init(config: &ResolvedConfig) -> Result<BatchReport> {
    let mut store = load(config)?;
    let report = orchestrator(config).initialize_all(&mut store).await;
    save(config, &store)?;
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "initialize finished"
    );
    Ok(report)
}

/// Refresh agent ids with `get_node_info`.
pub async fn fetch(config: &ResolvedConfig) -> Result<BatchReport> {
    let mut store = load(config)?;
    let report = orchestrator(config).fetch_identities(&mut store).await;
    save(config, &store)?;
    Ok(report)
}

// ==================== Propagation Commands ====================

impl Output for PropagationReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{}: {} sent, {} failed, {} local update(s)",
            self.operation,
            self.sent(),
            self.failed(),
            self.store_changes()
        )];
        for step in &self.steps {
            let line = match &step.outcome {
                StepOutcome::Sent { message } => {
                    let note = message
                        .as_deref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default();
                    format!("  ✓ {} [{}]{}", step.target, step.children.join(", "), note)
                }
                StepOutcome::Skipped { reason } => {
                    format!("  - {} skipped: {}", step.target, reason)
                }
                StepOutcome::Failed { kind, error } => {
                    format!("  ✗ {} failed ({:?}): {}", step.target, kind, error)
                }
            };
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Tell each child agent who its parent is.
pub async fn propagate_parents(config: &ResolvedConfig) -> Result<PropagationReport> {
    let mut store = load(config)?;
    let report = orchestrator(config).propagate_parents(&mut store).await;
    save(config, &store)?;
    Ok(report)
}

/// Send each parent agent its complete list of children.
pub async fn propagate_children(config: &ResolvedConfig) -> Result<PropagationReport> {
    let mut store = load(config)?;
    let report = orchestrator(config).propagate_children(&mut store).await;
    save(config, &store)?;
    Ok(report)
}

impl Output for SyncReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let verdict = if self.success {
            "Sync complete."
        } else {
            "Sync finished with failures."
        };
        [
            self.initialize.to_human(),
            self.parents.to_human(),
            self.children.to_human(),
            verdict.to_string(),
        ]
        .join("\n")
    }
}

/// Initialize, then propagate parents and children, over one set of
/// connections.
pub async fn sync(config: &ResolvedConfig) -> Result<SyncReport> {
    let mut store = load(config)?;
    let report = orchestrator(config).sync(&mut store).await;
    save(config, &store)?;
    Ok(report)
}

// ==================== Detach Commands ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetachSide {
    Parent,
    Child,
}

#[derive(Serialize)]
pub struct Detached {
    pub node: String,
    pub side: DetachSide,
    /// Acknowledgement text from the agent, if it sent one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Local edge dropped along with the agent link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_removed: Option<Edge>,
}

impl Output for Detached {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut text = match self.side {
            DetachSide::Parent => format!("Detached {} from its parent", self.node),
            DetachSide::Child => format!("Removed {} from its parent's children", self.node),
        };
        if let Some(message) = &self.message {
            text.push_str(&format!(": {}", message));
        }
        if let Some(edge) = &self.edge_removed {
            text.push_str(&format!("\n  unlinked {} -> {}", edge.source, edge.target));
        }
        text
    }
}

fn drop_parent_edge(store: &mut TopologyStore, node: &str) -> Result<Option<Edge>> {
    match store.parent_edge(node).map(|e| e.source.clone()) {
        Some(parent) => Ok(Some(store.disconnect(&parent, node)?)),
        None => Ok(None),
    }
}

/// Tell `node`'s agent to drop its parent, and unlink it locally.
pub async fn detach_parent(config: &ResolvedConfig, node: &str) -> Result<Detached> {
    let mut store = load(config)?;
    let message = orchestrator(config).remove_parent(&mut store, node).await?;
    let edge_removed = drop_parent_edge(&mut store, node)?;
    save(config, &store)?;
    Ok(Detached {
        node: node.to_string(),
        side: DetachSide::Parent,
        message,
        edge_removed,
    })
}

/// Tell the parent of `node` to drop it, and unlink it locally.
pub async fn detach_child(config: &ResolvedConfig, node: &str) -> Result<Detached> {
    let mut store = load(config)?;
    let message = orchestrator(config).remove_child(&mut store, node).await?;
    let edge_removed = drop_parent_edge(&mut store, node)?;
    save(config, &store)?;
    Ok(Detached {
        node: node.to_string(),
        side: DetachSide::Child,
        message,
        edge_removed,
    })
}

// ==================== Query Commands ====================

fn describe_info(info: &AgentNodeInfo) -> String {
    let name = info
        .name
        .as_deref()
        .map(|n| format!(" \"{}\"", n))
        .unwrap_or_default();
    let mac = info
        .device_mac
        .as_deref()
        .map(|m| format!(" ({})", m))
        .unwrap_or_default();
    format!("agent {}{}{}", info.id, name, mac)
}

#[derive(Serialize)]
pub struct ParentAnswer {
    pub node: String,
    pub parent: Option<AgentNodeInfo>,
}

impl Output for ParentAnswer {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{} parent: {}", self.node, describe_info(parent)),
            None => format!("{} has no parent", self.node),
        }
    }
}

#[derive(Serialize)]
pub struct ChildrenAnswer {
    pub node: String,
    pub count: usize,
    pub children: Vec<AgentNodeInfo>,
}

impl Output for ChildrenAnswer {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.children.is_empty() {
            return format!("{} has no children", self.node);
        }
        let mut lines = vec![format!("{} children ({}):", self.node, self.count)];
        lines.extend(self.children.iter().map(|c| format!("  {}", describe_info(c))));
        lines.join("\n")
    }
}

/// Ask `node`'s agent for its parent. The topology is not modified.
pub async fn query_parent(config: &ResolvedConfig, node: &str) -> Result<ParentAnswer> {
    let store = load(config)?;
    let parent = orchestrator(config).query_parent(&store, node).await?;
    Ok(ParentAnswer {
        node: node.to_string(),
        parent,
    })
}

/// Ask `node`'s agent for its children. The topology is not modified.
pub async fn query_children(config: &ResolvedConfig, node: &str) -> Result<ChildrenAnswer> {
    let store = load(config)?;
    let children = orchestrator(config).query_children(&store, node).await?;
    Ok(ChildrenAnswer {
        node: node.to_string(),
        count: children.len(),
        children,
    })
}

// ==================== Watch Command ====================

impl Output for StatusEvent {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "[{}] {} {} {} (code {})",
            self.received_at.format("%H:%M:%S"),
            self.message.status.icon(),
            self.address,
            self.message.message,
            self.message.code
        )
    }
}

/// Connect to every addressed agent and hand each status update to
/// `on_event`.
///
/// Stops after `count` updates, after `timeout`, or on Ctrl-C. Returns the
/// number of updates seen.
pub async fn watch(
    config: &ResolvedConfig,
    count: Option<usize>,
    timeout: Option<Duration>,
    mut on_event: impl FnMut(&StatusEvent),
) -> Result<usize> {
    let store = load(config)?;
    let feed = NotificationFeed::new();
    let mut events = feed.subscribe();
    let mut pool = ConnectionPool::new(config.transport_config(), feed);
    for node in store.nodes().iter().filter(|n| n.address.is_valid()) {
        pool.get_or_connect(&node.address, node.tier);
    }
    if pool.is_empty() {
        return Err(Error::InvalidInput(
            "no node in the topology has a usable address".to_string(),
        ));
    }
    info!(agents = pool.len(), "watching status updates");

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut received = 0;
    while count.is_none_or(|limit| received < limit) {
        let next = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, events.recv()).await.ok(),
                None => Some(events.recv().await),
            }
        };
        let event = tokio::select! {
            event = next => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        match event {
            Some(Ok(event)) => {
                on_event(&event);
                received += 1;
            }
            Some(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "status feed lagged");
            }
            Some(Err(RecvError::Closed)) | None => break,
        }
    }
    Ok(received)
}
