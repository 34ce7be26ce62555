//! Outcomes of reconciliation procedures.

use serde::Serialize;

use crate::transport::Operation;

/// Which layer a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Precondition,
    Transport,
    Protocol,
}

/// Result for one node of a fan-out batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The agent answered with its identity
    Succeeded {
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hardware_id: Option<String>,
    },
    /// The node was not contacted
    Skipped { reason: String },
    Failed { kind: FailureKind, error: String },
}

impl NodeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeOutcome::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub local_id: String,
    pub label: String,
    pub address: String,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

/// Aggregate of an `initialize`/`get_node_info` fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub operation: Operation,
    /// No contacted node failed
    pub success: bool,
    pub nodes: Vec<NodeReport>,
}

impl BatchReport {
    pub fn new(operation: Operation, nodes: Vec<NodeReport>) -> Self {
        let success = !nodes.iter().any(|n| n.outcome.is_failure());
        Self {
            operation,
            success,
            nodes,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.nodes.iter().filter(|n| n.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.nodes.iter().filter(|n| n.outcome.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.nodes.len() - self.succeeded() - self.failed()
    }

    pub fn outcome(&self, local_id: &str) -> Option<&NodeOutcome> {
        self.nodes
            .iter()
            .find(|n| n.local_id == local_id)
            .map(|n| &n.outcome)
    }
}

/// Result of one `set_parent`/`set_children` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Sent {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Skipped { reason: String },
    Failed { kind: FailureKind, error: String },
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, StepOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationStep {
    /// Local id of the node whose agent was (or would have been) called
    pub target: String,
    /// Local id of the parent the step is about
    pub parent: String,
    /// Local ids of the children the step is about
    pub children: Vec<String>,
    /// Whether the local store changed
    pub store_updated: bool,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Aggregate of a propagation procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub operation: Operation,
    pub success: bool,
    pub steps: Vec<PropagationStep>,
}

impl PropagationReport {
    pub fn new(operation: Operation, steps: Vec<PropagationStep>) -> Self {
        let success = !steps.iter().any(|s| s.outcome.is_failure());
        Self {
            operation,
            success,
            steps,
        }
    }

    pub fn sent(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_sent()).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_failure()).count()
    }

    pub fn store_changes(&self) -> usize {
        self.steps.iter().filter(|s| s.store_updated).count()
    }
}

/// initialize → propagate parents → propagate children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub initialize: BatchReport,
    pub parents: PropagationReport,
    pub children: PropagationReport,
}
