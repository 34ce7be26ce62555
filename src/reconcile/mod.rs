//! Reconciliation of the local topology with the agents.
//!
//! Each procedure reads a snapshot of the [`TopologyStore`], issues calls to
//! the agents it names, and writes their answers back. Calls to distinct
//! agents run concurrently; store updates are applied one node at a time
//! after the replies are in.
//!
//! Every fact is asserted to the agent that owns it: a node's parent is set
//! by telling the child, a node's children by telling the parent.

pub mod report;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{info, warn};

pub use report::{
    BatchReport, FailureKind, NodeOutcome, NodeReport, PropagationReport, PropagationStep,
    StepOutcome, SyncReport,
};

use crate::models::{Node, NodePatch, TopologyStore};
use crate::notifications::NotificationFeed;
use crate::transport::protocol::{
    AgentDescriptor, AgentNodeInfo, ProtocolError, expect_ack, expect_children, expect_node,
    expect_parent,
};
use crate::transport::{ConnectionPool, Operation, RpcClient, TransportConfig, TransportError};
use crate::{Error, Result};

/// A procedure was asked to do something the topology cannot support yet.
///
/// Always raised before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} needs a label and an address first")]
    IncompleteNode(String),

    #[error("node {node} has no usable address ('{address}')")]
    InvalidAddress { node: String, address: String },

    #[error("node {0} has not been initialized (no agent id)")]
    MissingAgentId(String),

    #[error("node {0} has no recorded parent")]
    MissingParent(String),

    #[error("parent '{parent_ref}' of node {node} is not in the topology")]
    UnknownParent { node: String, parent_ref: String },
}

/// Failure of one agent call.
#[derive(Debug)]
enum CallError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl CallError {
    fn kind(&self) -> FailureKind {
        match self {
            CallError::Transport(_) => FailureKind::Transport,
            CallError::Protocol(_) => FailureKind::Protocol,
        }
    }

    fn message(&self) -> String {
        match self {
            CallError::Transport(e) => e.to_string(),
            CallError::Protocol(e) => e.to_string(),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        CallError::Transport(e)
    }
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        CallError::Protocol(e)
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Transport(e) => Error::Transport(e),
            CallError::Protocol(e) => Error::Protocol(e),
        }
    }
}

/// One call to issue as part of a fan-out.
struct Planned {
    client: Arc<RpcClient>,
    payload: Value,
}

/// Issue every planned call concurrently; replies come back in plan order.
async fn fan_out(
    operation: Operation,
    plans: &[Planned],
) -> Vec<std::result::Result<Value, TransportError>> {
    join_all(plans.iter().map(|plan| {
        let client = Arc::clone(&plan.client);
        let payload = plan.payload.clone();
        async move { client.call(operation, payload).await }
    }))
    .await
}

fn precondition_failure(e: PreconditionError) -> (FailureKind, String) {
    (FailureKind::Precondition, e.to_string())
}

/// Check that a node can be contacted at all.
fn require_address(node: &Node) -> std::result::Result<(), PreconditionError> {
    if node.address.is_valid() {
        Ok(())
    } else {
        Err(PreconditionError::InvalidAddress {
            node: node.local_id.clone(),
            address: node.address.to_string(),
        })
    }
}

/// Drives agents toward the topology.
#[derive(Debug)]
pub struct Orchestrator {
    pool: ConnectionPool,
}

impl Orchestrator {
    pub fn new(config: TransportConfig, feed: NotificationFeed) -> Self {
        Self {
            pool: ConnectionPool::new(config, feed),
        }
    }

    pub fn with_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Close connections to addresses the topology no longer names.
    pub fn prune(&mut self, store: &TopologyStore) {
        self.pool.retain(&store.addresses());
    }

    fn client_for(&mut self, node: &Node) -> Arc<RpcClient> {
        self.pool.get_or_connect(&node.address, node.tier)
    }

    /// Call `initialize` on every node with a label and a valid address.
    ///
    /// Nodes already holding an agent id are submitted again. One node's
    /// failure never stops the others.
    pub async fn initialize_all(&mut self, store: &mut TopologyStore) -> BatchReport {
        self.prune(store);
        self.identify_all(store, Operation::Initialize).await
    }

    /// Call `get_node_info` on every node with a valid address.
    pub async fn fetch_identities(&mut self, store: &mut TopologyStore) -> BatchReport {
        self.prune(store);
        self.identify_all(store, Operation::GetNodeInfo).await
    }

    async fn identify_all(
        &mut self,
        store: &mut TopologyStore,
        operation: Operation,
    ) -> BatchReport {
        let mut reports: Vec<NodeReport> = Vec::new();
        let mut targets: Vec<usize> = Vec::new();
        let mut plans: Vec<Planned> = Vec::new();

        for node in store.nodes() {
            let report = NodeReport {
                local_id: node.local_id.clone(),
                label: node.label.clone(),
                address: node.address.to_string(),
                outcome: NodeOutcome::Skipped {
                    reason: String::new(),
                },
            };

            let ready = match operation {
                Operation::Initialize if node.label.trim().is_empty() => {
                    Err(PreconditionError::IncompleteNode(node.local_id.clone()))
                }
                _ => require_address(node),
            };
            if let Err(e) = ready {
                reports.push(NodeReport {
                    outcome: NodeOutcome::Skipped {
                        reason: e.to_string(),
                    },
                    ..report
                });
                continue;
            }

            let payload = match operation {
                Operation::Initialize => serde_json::to_value(AgentDescriptor::for_initialize(node))
                    .unwrap_or(Value::Null),
                _ => json!({}),
            };
            plans.push(Planned {
                client: self.pool.get_or_connect(&node.address, node.tier),
                payload,
            });
            targets.push(reports.len());
            reports.push(report);
        }

        let replies = fan_out(operation, &plans).await;

        for (index, reply) in targets.into_iter().zip(replies) {
            let report = &mut reports[index];
            let result: std::result::Result<AgentNodeInfo, CallError> = reply
                .map_err(CallError::from)
                .and_then(|value| expect_node(operation, &value).map_err(CallError::from));

            report.outcome = match result {
                Ok(info) => {
                    let mut patch = NodePatch::new().agent_id(Some(info.id.clone()));
                    // A reply without a MAC leaves the stored one alone.
                    if let Some(mac) = &info.device_mac {
                        patch = patch.hardware_id(Some(mac.clone()));
                    }
                    if let Err(e) = store.update_node(&report.local_id, &patch) {
                        warn!(node = %report.local_id, error = %e, "node vanished during batch");
                    }
                    info!(
                        node = %report.local_id,
                        agent_id = %info.id,
                        %operation,
                        "agent identified"
                    );
                    NodeOutcome::Succeeded {
                        agent_id: info.id,
                        hardware_id: info.device_mac,
                    }
                }
                Err(e) => {
                    warn!(
                        node = %report.local_id,
                        %operation,
                        error = %e.message(),
                        "agent call failed"
                    );
                    NodeOutcome::Failed {
                        kind: e.kind(),
                        error: e.message(),
                    }
                }
            };
        }

        BatchReport::new(operation, reports)
    }

    /// Tell every child whose parent is initialized who its parent is.
    ///
    /// The child's local `parent_ref` is set to the parent's agent id first.
    /// Edges whose parent has no agent id yet are skipped.
    pub async fn propagate_parents(&mut self, store: &mut TopologyStore) -> PropagationReport {
        self.prune(store);
        let operation = Operation::SetParent;

        let mut steps: Vec<PropagationStep> = Vec::new();
        let mut targets: Vec<usize> = Vec::new();
        let mut plans: Vec<Planned> = Vec::new();
        let mut updates: Vec<(String, String)> = Vec::new();

        for edge in store.edges() {
            let mut step = PropagationStep {
                target: edge.target.clone(),
                parent: edge.source.clone(),
                children: vec![edge.target.clone()],
                store_updated: false,
                outcome: StepOutcome::Sent { message: None },
            };

            let (Some(parent), Some(child)) = (store.node(&edge.source), store.node(&edge.target))
            else {
                step.outcome = StepOutcome::Skipped {
                    reason: format!("edge {} names a missing node", edge.id),
                };
                steps.push(step);
                continue;
            };
            let Some(parent_agent_id) = parent.agent_id.clone() else {
                step.outcome = StepOutcome::Skipped {
                    reason: format!("parent {} is not initialized", parent.local_id),
                };
                steps.push(step);
                continue;
            };

            if child.parent_ref.as_deref() != Some(parent_agent_id.as_str()) {
                updates.push((child.local_id.clone(), parent_agent_id));
                step.store_updated = true;
            }

            if let Err(e) = require_address(child) {
                let (kind, error) = precondition_failure(e);
                step.outcome = StepOutcome::Failed { kind, error };
                steps.push(step);
                continue;
            }

            let payload = serde_json::to_value(AgentDescriptor::of(parent)).unwrap_or(Value::Null);
            plans.push(Planned {
                client: self.pool.get_or_connect(&child.address, child.tier),
                payload,
            });
            targets.push(steps.len());
            steps.push(step);
        }

        for (child, parent_agent_id) in updates {
            let patch = NodePatch::new().parent_ref(Some(parent_agent_id));
            if let Err(e) = store.update_node(&child, &patch) {
                warn!(node = %child, error = %e, "failed to record parent");
            }
        }

        let replies = fan_out(operation, &plans).await;
        apply_acks(operation, &mut steps, targets, replies);
        PropagationReport::new(operation, steps)
    }

    /// Send every initialized parent the full list of its initialized children.
    ///
    /// The list replaces whatever the agent had. A parent that still records
    /// children but has no edge left is sent an empty list.
    pub async fn propagate_children(&mut self, store: &mut TopologyStore) -> PropagationReport {
        self.prune(store);
        let operation = Operation::SetChildren;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in store.edges() {
            groups
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }
        for node in store.nodes() {
            if node.children_refs.as_ref().is_some_and(|c| !c.is_empty()) {
                groups.entry(node.local_id.clone()).or_default();
            }
        }

        let mut steps: Vec<PropagationStep> = Vec::new();
        let mut targets: Vec<usize> = Vec::new();
        let mut plans: Vec<Planned> = Vec::new();
        let mut updates: Vec<(String, BTreeSet<String>)> = Vec::new();

        for (parent_id, child_ids) in groups {
            let mut step = PropagationStep {
                target: parent_id.clone(),
                parent: parent_id.clone(),
                children: child_ids.clone(),
                store_updated: false,
                outcome: StepOutcome::Sent { message: None },
            };

            let Some(parent) = store.node(&parent_id) else {
                step.outcome = StepOutcome::Skipped {
                    reason: format!("parent {} is missing", parent_id),
                };
                steps.push(step);
                continue;
            };
            if parent.agent_id.is_none() {
                step.outcome = StepOutcome::Skipped {
                    reason: format!("parent {} is not initialized", parent_id),
                };
                steps.push(step);
                continue;
            }

            let children: Vec<&Node> = child_ids
                .iter()
                .filter_map(|id| store.node(id))
                .filter(|child| child.agent_id.is_some())
                .collect();
            let child_agent_ids: BTreeSet<String> = children
                .iter()
                .filter_map(|child| child.agent_id.clone())
                .collect();

            if parent.children_refs.as_ref() != Some(&child_agent_ids) {
                updates.push((parent_id.clone(), child_agent_ids));
                step.store_updated = true;
            }

            if let Err(e) = require_address(parent) {
                let (kind, error) = precondition_failure(e);
                step.outcome = StepOutcome::Failed { kind, error };
                steps.push(step);
                continue;
            }

            let descriptors: Vec<AgentDescriptor> =
                children.iter().map(|child| AgentDescriptor::of(child)).collect();
            let payload = serde_json::to_value(descriptors).unwrap_or(Value::Null);
            plans.push(Planned {
                client: self.pool.get_or_connect(&parent.address, parent.tier),
                payload,
            });
            targets.push(steps.len());
            steps.push(step);
        }

        for (parent, children) in updates {
            let patch = NodePatch::new().children_refs(Some(children));
            if let Err(e) = store.update_node(&parent, &patch) {
                warn!(node = %parent, error = %e, "failed to record children");
            }
        }

        let replies = fan_out(operation, &plans).await;
        apply_acks(operation, &mut steps, targets, replies);
        PropagationReport::new(operation, steps)
    }

    /// Tell a node's agent to drop its parent, then forget it locally.
    pub async fn remove_parent(
        &mut self,
        store: &mut TopologyStore,
        child: &str,
    ) -> Result<Option<String>> {
        let node = store
            .node(child)
            .ok_or_else(|| PreconditionError::UnknownNode(child.to_string()))?;
        require_address(node)?;

        let client = self.client_for(node);
        let reply = client.call(Operation::RemoveParent, json!({})).await?;
        let message = expect_ack(Operation::RemoveParent, &reply)?;

        store.update_node(child, &NodePatch::new().parent_ref(None))?;
        info!(node = %child, "parent removed");
        Ok(message)
    }

    /// Tell the recorded parent's agent to drop this child.
    ///
    /// Requires the child's agent id and a parent reference that resolves to
    /// a node in the topology.
    pub async fn remove_child(
        &mut self,
        store: &mut TopologyStore,
        child: &str,
    ) -> Result<Option<String>> {
        let node = store
            .node(child)
            .ok_or_else(|| PreconditionError::UnknownNode(child.to_string()))?;
        let child_agent_id = node
            .agent_id
            .clone()
            .ok_or_else(|| PreconditionError::MissingAgentId(child.to_string()))?;
        let parent_ref = node
            .parent_ref
            .clone()
            .ok_or_else(|| PreconditionError::MissingParent(child.to_string()))?;
        let parent = store
            .resolve_ref(&parent_ref)
            .ok_or_else(|| PreconditionError::UnknownParent {
                node: child.to_string(),
                parent_ref: parent_ref.clone(),
            })?;
        require_address(parent)?;
        let parent_id = parent.local_id.clone();
        let remaining = parent.children_refs.clone().map(|mut children| {
            children.remove(&child_agent_id);
            children
        });

        let client = self.client_for(parent);
        let reply = client
            .call(Operation::RemoveChild, json!({ "child_id": child_agent_id }))
            .await?;
        let message = expect_ack(Operation::RemoveChild, &reply)?;

        store.update_node(&parent_id, &NodePatch::new().children_refs(remaining))?;
        info!(node = %child, parent = %parent_id, "child removed");
        Ok(message)
    }

    /// Ask a node's agent who its parent is.
    pub async fn query_parent(
        &mut self,
        store: &TopologyStore,
        local_id: &str,
    ) -> Result<Option<AgentNodeInfo>> {
        let node = store
            .node(local_id)
            .ok_or_else(|| PreconditionError::UnknownNode(local_id.to_string()))?;
        require_address(node)?;
        let client = self.client_for(node);
        let reply = client.call(Operation::GetParent, json!({})).await?;
        Ok(expect_parent(Operation::GetParent, &reply)?)
    }

    /// Ask a node's agent for its children.
    pub async fn query_children(
        &mut self,
        store: &TopologyStore,
        local_id: &str,
    ) -> Result<Vec<AgentNodeInfo>> {
        let node = store
            .node(local_id)
            .ok_or_else(|| PreconditionError::UnknownNode(local_id.to_string()))?;
        require_address(node)?;
        let client = self.client_for(node);
        let reply = client.call(Operation::GetChildren, json!({})).await?;
        Ok(expect_children(Operation::GetChildren, &reply)?)
    }

    /// Initialize every agent, then propagate parents and children.
    pub async fn sync(&mut self, store: &mut TopologyStore) -> SyncReport {
        let initialize = self.initialize_all(store).await;
        let parents = self.propagate_parents(store).await;
        let children = self.propagate_children(store).await;
        SyncReport {
            success: initialize.success && parents.success && children.success,
            initialize,
            parents,
            children,
        }
    }
}

/// Record `set_parent`/`set_children` replies on their steps.
fn apply_acks(
    operation: Operation,
    steps: &mut [PropagationStep],
    targets: Vec<usize>,
    replies: Vec<std::result::Result<Value, TransportError>>,
) {
    for (index, reply) in targets.into_iter().zip(replies) {
        let step = &mut steps[index];
        let result = reply
            .map_err(CallError::from)
            .and_then(|value| expect_ack(operation, &value).map_err(CallError::from));
        step.outcome = match result {
            Ok(message) => {
                info!(node = %step.target, %operation, "propagated");
                StepOutcome::Sent { message }
            }
            Err(e) => {
                warn!(
                    node = %step.target,
                    %operation,
                    error = %e.message(),
                    "propagation failed"
                );
                StepOutcome::Failed {
                    kind: e.kind(),
                    error: e.message(),
                }
            }
        };
    }
}
