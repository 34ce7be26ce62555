//! Command implementations for the fedtree CLI.
//!
//! This module contains the business logic for each CLI command.
//! Commands are organized by what they touch:
//! - `node` / `edge` / `clear` / `check` - Local topology editing
//! - `export` / `import` - Topology files
//! - [`remote`] - Commands that talk to agents
//! - `config` - Resolved settings

pub mod remote;

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::info;

pub use remote::{
    ChildrenAnswer, DetachSide, Detached, ParentAnswer, detach_child, detach_parent, fetch, init,
    propagate_children, propagate_parents, query_children, query_parent, sync, watch,
};

use crate::config::ResolvedConfig;
use crate::models::{
    Address, Edge, Node, NodePatch, Position, ShapeReport, Tier, TopologyStore, check_shape,
};
use crate::storage;
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

pub(crate) fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

/// One-line summary of a node.
pub(crate) fn describe_node(node: &Node) -> String {
    let address = if node.address.is_valid() {
        node.address.to_string()
    } else {
        "(no address)".to_string()
    };
    let agent = node
        .agent_id
        .as_deref()
        .map(|id| format!(" agent {}", id))
        .unwrap_or_default();
    format!(
        "{} [{}] \"{}\" {}{}",
        node.local_id, node.tier, node.label, address, agent
    )
}

fn parse_address(raw: &str) -> Result<Address> {
    if raw.trim().is_empty() {
        Ok(Address::default())
    } else {
        Address::parse(raw)
    }
}

// ==================== Node Commands ====================

#[derive(Serialize)]
pub struct NodeAdded {
    pub node: Node,
}

impl Output for NodeAdded {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Added {}", describe_node(&self.node))
    }
}

/// Add a node of `tier` to the topology file.
pub fn node_add(
    topology: &Path,
    tier: Tier,
    label: Option<String>,
    address: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
) -> Result<NodeAdded> {
    let mut store = storage::load_or_default(topology)?;
    let id = store.create_node(tier).local_id.clone();

    let mut patch = NodePatch::new();
    if let Some(label) = label {
        patch = patch.label(label);
    }
    if let Some(raw) = address {
        patch = patch.address(parse_address(&raw)?);
    }
    if x.is_some() || y.is_some() {
        patch = patch.position(Position {
            x: x.unwrap_or_default(),
            y: y.unwrap_or_default(),
        });
    }
    store.update_node(&id, &patch)?;

    storage::save(&store, topology)?;
    let node = store
        .node(&id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
    info!(node = %id, tier = %tier, "node added");
    Ok(NodeAdded { node })
}

/// Changes requested by `fedtree node update`.
#[derive(Debug, Clone, Default)]
pub struct NodeChanges {
    pub label: Option<String>,
    pub address: Option<String>,
    pub tier: Option<Tier>,
    pub agent_id: Option<String>,
    pub clear_agent_id: bool,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

#[derive(Serialize)]
pub struct NodeUpdated {
    pub changed: bool,
    pub node: Node,
}

impl Output for NodeUpdated {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.changed {
            format!("Updated {}", describe_node(&self.node))
        } else {
            format!("No changes to {}", self.node.local_id)
        }
    }
}

/// Apply `changes` to one node.
///
/// A tier change is refused while the node has edges, since they would no
/// longer pair up.
pub fn node_update(topology: &Path, id: &str, changes: NodeChanges) -> Result<NodeUpdated> {
    let mut store = storage::load_or_default(topology)?;
    let current = store
        .node(id)
        .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;

    let mut patch = NodePatch::new();
    if let Some(label) = changes.label {
        patch = patch.label(label);
    }
    if let Some(raw) = changes.address {
        patch = patch.address(parse_address(&raw)?);
    }
    if let Some(tier) = changes.tier.filter(|t| *t != current.tier) {
        let linked = store
            .edges()
            .iter()
            .any(|e| e.source == id || e.target == id);
        if linked {
            return Err(Error::InvalidInput(format!(
                "node {} has edges; remove them before changing its tier",
                id
            )));
        }
        patch.tier = Some(tier);
    }
    if changes.clear_agent_id {
        patch = patch.agent_id(None);
    } else if let Some(agent_id) = changes.agent_id {
        patch = patch.agent_id(Some(agent_id));
    }
    if changes.x.is_some() || changes.y.is_some() {
        patch = patch.position(Position {
            x: changes.x.unwrap_or(current.position.x),
            y: changes.y.unwrap_or(current.position.y),
        });
    }

    let changed = store.update_node(id, &patch)?;
    if changed {
        storage::save(&store, topology)?;
    }
    let node = store
        .node(id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
    Ok(NodeUpdated { changed, node })
}

#[derive(Serialize)]
pub struct NodeRemoved {
    pub node: Node,
    pub edges_removed: usize,
}

impl Output for NodeRemoved {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Removed {} ({} edge{})",
            describe_node(&self.node),
            self.edges_removed,
            if self.edges_removed == 1 { "" } else { "s" }
        )
    }
}

/// Remove a node together with its edges.
pub fn node_remove(topology: &Path, id: &str) -> Result<NodeRemoved> {
    let mut store = storage::load_or_default(topology)?;
    let edges_before = store.edges().len();
    let node = store.remove_node(id)?;
    let edges_removed = edges_before - store.edges().len();
    storage::save(&store, topology)?;
    info!(node = %id, edges_removed, "node removed");
    Ok(NodeRemoved {
        node,
        edges_removed,
    })
}

#[derive(Serialize)]
pub struct NodeShow {
    pub node: Node,
    /// Local id of the parent edge's source, if any
    pub parent: Option<String>,
    /// Local ids of nodes linked below this one
    pub children: Vec<String>,
}

impl Output for NodeShow {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let node = &self.node;
        let mut lines = vec![describe_node(node)];
        if let Some(parent) = &self.parent {
            lines.push(format!("  parent edge: {}", parent));
        }
        if !self.children.is_empty() {
            lines.push(format!("  child edges: {}", self.children.join(", ")));
        }
        if let Some(parent_ref) = &node.parent_ref {
            lines.push(format!("  recorded parent: {}", parent_ref));
        }
        if let Some(children) = &node.children_refs {
            let ids: Vec<&str> = children.iter().map(String::as_str).collect();
            lines.push(format!("  recorded children: [{}]", ids.join(", ")));
        }
        if let Some(hardware_id) = &node.hardware_id {
            lines.push(format!("  hardware: {}", hardware_id));
        }
        lines.join("\n")
    }
}

pub fn node_show(topology: &Path, id: &str) -> Result<NodeShow> {
    let store = storage::load_or_default(topology)?;
    let node = store
        .node(id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
    Ok(NodeShow {
        parent: store.parent_edge(id).map(|e| e.source.clone()),
        children: store
            .children_of(id)
            .iter()
            .map(|n| n.local_id.clone())
            .collect(),
        node,
    })
}

#[derive(Serialize)]
pub struct NodeList {
    pub count: usize,
    pub nodes: Vec<Node>,
}

impl Output for NodeList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.nodes.is_empty() {
            return "No nodes.".to_string();
        }
        let mut lines = vec![format!("{} node(s):", self.count)];
        lines.extend(self.nodes.iter().map(|n| format!("  {}", describe_node(n))));
        lines.join("\n")
    }
}

pub fn node_list(topology: &Path, tier: Option<Tier>) -> Result<NodeList> {
    let store = storage::load_or_default(topology)?;
    let nodes: Vec<Node> = store
        .nodes()
        .iter()
        .filter(|n| tier.is_none_or(|t| n.tier == t))
        .cloned()
        .collect();
    Ok(NodeList {
        count: nodes.len(),
        nodes,
    })
}

// ==================== Edge Commands ====================

#[derive(Serialize)]
pub struct EdgeChanged {
    pub action: &'static str,
    pub edge: Edge,
}

impl Output for EdgeChanged {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let verb = if self.action == "added" { "Linked" } else { "Unlinked" };
        format!("{} {} -> {}", verb, self.edge.source, self.edge.target)
    }
}

/// Link `parent` to `child`.
pub fn edge_add(topology: &Path, parent: &str, child: &str) -> Result<EdgeChanged> {
    let mut store = storage::load_or_default(topology)?;
    let edge = store.connect(parent, child)?.clone();
    storage::save(&store, topology)?;
    info!(edge = %edge.id, "edge added");
    Ok(EdgeChanged {
        action: "added",
        edge,
    })
}

/// Remove the link between `parent` and `child`.
///
/// Only the local intent changes; agents keep their links until the next
/// propagation or an explicit `detach`.
pub fn edge_remove(topology: &Path, parent: &str, child: &str) -> Result<EdgeChanged> {
    let mut store = storage::load_or_default(topology)?;
    let edge = store.disconnect(parent, child)?;
    storage::save(&store, topology)?;
    info!(edge = %edge.id, "edge removed");
    Ok(EdgeChanged {
        action: "removed",
        edge,
    })
}

#[derive(Serialize)]
pub struct EdgeList {
    pub count: usize,
    pub edges: Vec<Edge>,
}

impl Output for EdgeList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.edges.is_empty() {
            return "No edges.".to_string();
        }
        let mut lines = vec![format!("{} edge(s):", self.count)];
        lines.extend(
            self.edges
                .iter()
                .map(|e| format!("  {} -> {}", e.source, e.target)),
        );
        lines.join("\n")
    }
}

pub fn edge_list(topology: &Path) -> Result<EdgeList> {
    let store = storage::load_or_default(topology)?;
    Ok(EdgeList {
        count: store.edges().len(),
        edges: store.edges().to_vec(),
    })
}

// ==================== Topology Commands ====================

#[derive(Serialize)]
pub struct Cleared {
    pub nodes_removed: usize,
    pub edges_removed: usize,
}

impl Output for Cleared {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Cleared {} node(s) and {} edge(s)",
            self.nodes_removed, self.edges_removed
        )
    }
}

/// Empty the topology. Local ids already handed out are not reused.
pub fn clear(topology: &Path) -> Result<Cleared> {
    let mut store = storage::load_or_default(topology)?;
    let result = Cleared {
        nodes_removed: store.len(),
        edges_removed: store.edges().len(),
    };
    store.clear();
    storage::save(&store, topology)?;
    Ok(result)
}

impl Output for ShapeReport {
    fn to_json(&self) -> String {
        json(&serde_json::json!({
            "valid": self.is_valid(),
            "node_count": self.node_count,
            "edge_count": self.edge_count,
            "component_count": self.component_count,
            "violations": self.violations,
        }))
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{} node(s), {} edge(s), {} component(s)",
            self.node_count, self.edge_count, self.component_count
        )];
        if self.is_valid() {
            lines.push("Topology is a valid tree.".to_string());
        } else {
            for violation in &self.violations {
                lines.push(format!("  ✗ {}", violation.describe()));
            }
        }
        lines.join("\n")
    }
}

/// Validate the topology's shape.
pub fn check(topology: &Path) -> Result<ShapeReport> {
    let store = storage::load_or_default(topology)?;
    Ok(check_shape(&store))
}

#[derive(Serialize)]
pub struct Transferred {
    pub path: PathBuf,
    pub nodes: usize,
    pub edges: usize,
}

pub struct Exported(pub Transferred);

impl Output for Exported {
    fn to_json(&self) -> String {
        json(&self.0)
    }

    fn to_human(&self) -> String {
        format!(
            "Exported {} node(s) and {} edge(s) to {}",
            self.0.nodes,
            self.0.edges,
            self.0.path.display()
        )
    }
}

/// Write the topology to `dest`, or to a timestamped file in the
/// working directory.
pub fn export(topology: &Path, dest: Option<PathBuf>) -> Result<Exported> {
    let store = storage::load_or_default(topology)?;
    let path = dest.unwrap_or_else(|| PathBuf::from(storage::default_export_name(Local::now())));
    storage::save(&store, &path)?;
    Ok(Exported(Transferred {
        path,
        nodes: store.len(),
        edges: store.edges().len(),
    }))
}

pub struct Imported(pub Transferred);

impl Output for Imported {
    fn to_json(&self) -> String {
        json(&self.0)
    }

    fn to_human(&self) -> String {
        format!(
            "Imported {} node(s) and {} edge(s) from {}",
            self.0.nodes,
            self.0.edges,
            self.0.path.display()
        )
    }
}

/// Replace the topology with the contents of `source`.
///
/// The file is fully parsed before anything is replaced.
pub fn import(topology: &Path, source: &Path) -> Result<Imported> {
    let store: TopologyStore = storage::load(source)?;
    storage::save(&store, topology)?;
    info!(source = %source.display(), nodes = store.len(), "topology imported");
    Ok(Imported(Transferred {
        path: source.to_path_buf(),
        nodes: store.len(),
        edges: store.edges().len(),
    }))
}

// ==================== Config Commands ====================

#[derive(Serialize)]
pub struct ConfigShow {
    /// config.kdl that was consulted, if any
    pub config_file: Option<PathBuf>,
    pub settings: ResolvedConfig,
}

impl Output for ConfigShow {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let s = &self.settings;
        let mut lines = Vec::new();
        if let Some(path) = &self.config_file {
            lines.push(format!("config file: {}", path.display()));
        }
        lines.push(format!("scheme: {} ({})", s.scheme.value, s.scheme.source));
        lines.push(format!(
            "retry-delay-ms: {} ({})",
            s.retry_delay_ms.value, s.retry_delay_ms.source
        ));
        if let Some(max) = &s.retry_max_delay_ms {
            lines.push(format!("retry-max-delay-ms: {} ({})", max.value, max.source));
        }
        lines.push(format!(
            "address-poll-ms: {} ({})",
            s.address_poll_ms.value, s.address_poll_ms.source
        ));
        lines.push(format!(
            "call-timeout-secs: {} ({})",
            s.call_timeout_secs.value, s.call_timeout_secs.source
        ));
        let roles = &s.role_paths.value;
        lines.push(format!(
            "role-path: root={} mid={} leaf={} ({})",
            roles.root, roles.mid, roles.leaf, s.role_paths.source
        ));
        lines.push(format!(
            "topology: {} ({})",
            s.topology.value.display(),
            s.topology.source
        ));
        lines.join("\n")
    }
}

pub fn config_show(config_file: Option<PathBuf>, settings: &ResolvedConfig) -> ConfigShow {
    ConfigShow {
        config_file,
        settings: settings.clone(),
    }
}
