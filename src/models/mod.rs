//! Data models for fedtree.
//!
//! This module defines the core data structures:
//! - `Tier` - Position of an agent in the tree (root, mid, leaf)
//! - `Address` - Host and port an agent listens on
//! - `Node` - One agent as the operator intends it to be
//! - `Edge` - A directed parent → child intent between two nodes
//! - `NodePatch` - Partial changes applied through `TopologyStore::update_node`

pub mod graph;
pub mod topology;

pub use graph::{ShapeReport, ShapeViolation, UnionFind, check_shape};
pub use topology::TopologyStore;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for operator-session node identifiers.
pub const LOCAL_ID_PREFIX: &str = "nd";

/// Tier of an agent in the tree.
///
/// On the wire tiers travel as the integer `node_type` field
/// (root = 1, mid = 2, leaf = 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    /// The single coordinating agent at the top of the tree
    Root,
    /// Aggregating agents between the root and the leaves
    Mid,
    /// Agents at the bottom of the tree
    Leaf,
}

impl Tier {
    /// All tiers, top to bottom.
    pub const ALL: [Tier; 3] = [Tier::Root, Tier::Mid, Tier::Leaf];

    /// Wire code used in the `node_type` field.
    pub fn code(&self) -> u8 {
        match self {
            Tier::Root => 1,
            Tier::Mid => 2,
            Tier::Leaf => 3,
        }
    }

    /// Parse from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Tier::Root),
            2 => Some(Tier::Mid),
            3 => Some(Tier::Leaf),
            _ => None,
        }
    }

    /// Parse from string, case-insensitive.
    ///
    /// Accepts the tier names and the original cloud/fog/edge vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "root" | "cloud" | "1" => Some(Tier::Root),
            "mid" | "fog" | "2" => Some(Tier::Mid),
            "leaf" | "edge" | "3" => Some(Tier::Leaf),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Root => "root",
            Tier::Mid => "mid",
            Tier::Leaf => "leaf",
        }
    }

    /// The tier a parent of this tier must have, if any.
    pub fn parent_tier(&self) -> Option<Tier> {
        match self {
            Tier::Root => None,
            Tier::Mid => Some(Tier::Root),
            Tier::Leaf => Some(Tier::Mid),
        }
    }

    /// Whether a node of this tier may be the parent of a node of `child` tier.
    pub fn can_parent(&self, child: Tier) -> bool {
        child.parent_tier() == Some(*self)
    }

    /// Label given to freshly created nodes of this tier.
    pub fn default_label(&self) -> &'static str {
        match self {
            Tier::Root => "Cloud Node",
            Tier::Mid => "Fog Node",
            Tier::Leaf => "Edge Node",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.code()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Tier::from_code(code).ok_or_else(|| format!("unknown node_type {}", code))
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Tier::parse(s).ok_or_else(|| format!("unknown tier '{}' (expected root, mid or leaf)", s))
    }
}

/// Network location of an agent.
///
/// An empty host or a zero port means the operator has not filled it in yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether this address can be used to open a connection.
    ///
    /// The host must be non-empty and form a valid URL host, and the port
    /// must be non-zero.
    pub fn is_valid(&self) -> bool {
        if self.host.trim().is_empty() || self.port == 0 {
            return false;
        }
        match url::Url::parse(&format!("ws://{}:{}/", self.host, self.port)) {
            Ok(url) => url.host_str().is_some() && url.port_or_known_default() == Some(self.port),
            Err(_) => false,
        }
    }

    /// Parse `host:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("expected host:port, got '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid port in '{}'", s)))?;
        let address = Self::new(host, port);
        if !address.is_valid() {
            return Err(Error::InvalidInput(format!("invalid address '{}'", s)));
        }
        Ok(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Position on the editing canvas. Carried through export/import only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// One agent as the operator intends it to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operator-session identifier, assigned before any agent contact
    pub local_id: String,

    /// Identifier assigned by the agent on initialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    pub tier: Tier,

    pub address: Address,

    /// Display label, sent to the agent as its name
    pub label: String,

    /// Parent reference (the parent's agent id once reconciled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,

    /// Children references (the children's agent ids once reconciled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_refs: Option<BTreeSet<String>>,

    /// Hardware identifier reported by the agent (e.g. device MAC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,

    #[serde(default)]
    pub position: Position,
}

impl Node {
    /// Create a node with the tier's default label and no address.
    pub fn new(local_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            local_id: local_id.into(),
            agent_id: None,
            tier,
            address: Address::default(),
            label: tier.default_label().to_string(),
            parent_ref: None,
            children_refs: None,
            hardware_id: None,
            position: Position::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    /// Whether label and address are filled in well enough to contact the agent.
    pub fn is_contactable(&self) -> bool {
        !self.label.trim().is_empty() && self.address.is_valid()
    }

    /// Whether `reference` designates this node (agent id or local id).
    pub fn answers_to(&self, reference: &str) -> bool {
        self.agent_id.as_deref() == Some(reference) || self.local_id == reference
    }
}

/// Partial changes for `TopologyStore::update_node`.
///
/// Outer `None` leaves a field untouched. For optional fields the inner
/// value is what gets stored, so `Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub label: Option<String>,
    pub address: Option<Address>,
    pub tier: Option<Tier>,
    pub agent_id: Option<Option<String>>,
    pub parent_ref: Option<Option<String>>,
    pub children_refs: Option<Option<BTreeSet<String>>>,
    pub hardware_id: Option<Option<String>>,
    pub position: Option<Position>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn agent_id(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn parent_ref(mut self, parent_ref: Option<String>) -> Self {
        self.parent_ref = Some(parent_ref);
        self
    }

    pub fn children_refs(mut self, children: Option<BTreeSet<String>>) -> Self {
        self.children_refs = Some(children);
        self
    }

    pub fn hardware_id(mut self, hardware_id: Option<String>) -> Self {
        self.hardware_id = Some(hardware_id);
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Whether applying this patch would change nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a node. Returns whether any field changed.
    pub fn apply(&self, node: &mut Node) -> bool {
        let before = node.clone();
        if let Some(label) = &self.label {
            node.label = label.clone();
        }
        if let Some(address) = &self.address {
            node.address = address.clone();
        }
        if let Some(tier) = self.tier {
            node.tier = tier;
        }
        if let Some(agent_id) = &self.agent_id {
            node.agent_id = agent_id.clone();
        }
        if let Some(parent_ref) = &self.parent_ref {
            node.parent_ref = parent_ref.clone();
        }
        if let Some(children) = &self.children_refs {
            node.children_refs = children.clone();
        }
        if let Some(hardware_id) = &self.hardware_id {
            node.hardware_id = hardware_id.clone();
        }
        if let Some(position) = self.position {
            node.position = position;
        }
        *node != before
    }
}

/// A directed parent → child intent between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    /// Local id of the parent
    pub source: String,
    /// Local id of the child
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: edge_id(&source, &target),
            source,
            target,
        }
    }
}

/// Canonical edge identifier for a parent/child pair.
pub fn edge_id(source: &str, target: &str) -> String {
    format!("edge-{}-{}", source, target)
}

/// Build a local id from its sequence number.
pub fn local_id(seq: u64) -> String {
    format!("{}-{}", LOCAL_ID_PREFIX, seq)
}

/// Extract the sequence number from a local id, if it has the standard form.
pub fn local_id_seq(id: &str) -> Option<u64> {
    id.strip_prefix(LOCAL_ID_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}
