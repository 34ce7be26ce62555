//! In-memory topology of the operator's intended tree.
//!
//! The store is a plain data container: every mutation is synchronous and
//! local. Reconciliation reads snapshots from it and writes agent responses
//! back through `update_node`.

use std::collections::BTreeSet;

use super::{Address, Edge, Node, NodePatch, Tier, local_id, local_id_seq};
use crate::{Error, Result};

/// Nodes and edges of one topology.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyStore {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Next local id sequence number; never decreases so ids are not reused
    next_seq: u64,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            next_seq: 1,
        }
    }

    /// Rebuild a store from persisted parts.
    ///
    /// Edges are taken as-is. The sequence counter is raised past every
    /// standard-form local id already present.
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>, next_seq: u64) -> Result<Self> {
        let mut store = Self {
            nodes: Vec::with_capacity(nodes.len()),
            edges,
            next_seq: next_seq.max(1),
        };
        for node in nodes {
            store.add_node(node)?;
        }
        Ok(store)
    }

    /// Sequence number the next allocated local id will use.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Reserve a fresh local id.
    pub fn allocate_local_id(&mut self) -> String {
        let id = local_id(self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Create a node of the given tier with a fresh local id.
    pub fn create_node(&mut self, tier: Tier) -> &Node {
        let id = self.allocate_local_id();
        self.nodes.push(Node::new(id, tier));
        let last = self.nodes.len() - 1;
        &self.nodes[last]
    }

    /// Add a node. Fails if its local id is already taken.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if node.local_id.trim().is_empty() {
            return Err(Error::InvalidInput("node local id is empty".to_string()));
        }
        if self.node(&node.local_id).is_some() {
            return Err(Error::InvalidInput(format!(
                "node {} already exists",
                node.local_id
            )));
        }
        if let Some(seq) = local_id_seq(&node.local_id) {
            self.next_seq = self.next_seq.max(seq + 1);
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Apply partial changes to a node. Returns whether anything changed.
    pub fn update_node(&mut self, local_id: &str, patch: &NodePatch) -> Result<bool> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.local_id == local_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", local_id)))?;
        Ok(patch.apply(node))
    }

    /// Remove a node, its edges, and every reference other nodes hold to it.
    pub fn remove_node(&mut self, local_id: &str) -> Result<Node> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.local_id == local_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", local_id)))?;
        let removed = self.nodes.remove(index);

        self.edges
            .retain(|e| e.source != removed.local_id && e.target != removed.local_id);

        for node in &mut self.nodes {
            if node
                .parent_ref
                .as_deref()
                .is_some_and(|r| removed.answers_to(r))
            {
                node.parent_ref = None;
            }
            if let Some(children) = &mut node.children_refs {
                children.retain(|r| !removed.answers_to(r));
            }
        }

        Ok(removed)
    }

    /// Remove every node and edge. Local ids already handed out stay retired.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    /// Look up a node by local id.
    pub fn node(&self, local_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.local_id == local_id)
    }

    /// Resolve a parent/child reference, preferring agent ids over local ids.
    pub fn resolve_ref(&self, reference: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.agent_id.as_deref() == Some(reference))
            .or_else(|| self.node(reference))
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link `parent` to `child`.
    ///
    /// Enforces what the editing surface guarantees: both nodes exist, the
    /// tiers pair up (root → mid, mid → leaf), and the child has no other
    /// parent edge.
    pub fn connect(&mut self, parent: &str, child: &str) -> Result<&Edge> {
        if parent == child {
            return Err(Error::InvalidInput(format!(
                "cannot connect {} to itself",
                parent
            )));
        }
        let parent_node = self
            .node(parent)
            .ok_or_else(|| Error::NotFound(format!("node {}", parent)))?;
        let child_node = self
            .node(child)
            .ok_or_else(|| Error::NotFound(format!("node {}", child)))?;

        if !parent_node.tier.can_parent(child_node.tier) {
            return Err(Error::InvalidInput(format!(
                "a {} node cannot be the parent of a {} node",
                parent_node.tier, child_node.tier
            )));
        }
        if let Some(existing) = self.parent_edge(child) {
            return Err(Error::InvalidInput(format!(
                "node {} already has parent {}",
                child, existing.source
            )));
        }

        self.edges.push(Edge::new(parent, child));
        let last = self.edges.len() - 1;
        Ok(&self.edges[last])
    }

    /// Remove the edge from `parent` to `child`.
    pub fn disconnect(&mut self, parent: &str, child: &str) -> Result<Edge> {
        let index = self
            .edges
            .iter()
            .position(|e| e.source == parent && e.target == child)
            .ok_or_else(|| Error::NotFound(format!("edge {} -> {}", parent, child)))?;
        Ok(self.edges.remove(index))
    }

    /// The edge leading into `child`, if any.
    pub fn parent_edge(&self, child: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.target == child)
    }

    /// Nodes linked below `parent` by an edge.
    pub fn children_of(&self, parent: &str) -> Vec<&Node> {
        self.edges
            .iter()
            .filter(|e| e.source == parent)
            .filter_map(|e| self.node(&e.target))
            .collect()
    }

    /// Distinct valid addresses named by the topology.
    pub fn addresses(&self) -> BTreeSet<Address> {
        self.nodes
            .iter()
            .filter(|n| n.address.is_valid())
            .map(|n| n.address.clone())
            .collect()
    }
}
