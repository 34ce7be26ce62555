//! Tree-shape analysis for a topology.
//!
//! Reconciliation never validates shape; these checks are run on demand
//! (`fedtree check`) to report what the tier rules would reject.

use std::collections::HashMap;

use serde::Serialize;

use super::{Tier, TopologyStore};

/// Union-Find (Disjoint Set Union) over node local ids.
///
/// Uses path compression and union by rank.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: HashMap<String, String>,
    rank: HashMap<String, usize>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. No-op if it already exists.
    pub fn make_set(&mut self, x: &str) {
        if !self.parent.contains_key(x) {
            self.parent.insert(x.to_string(), x.to_string());
            self.rank.insert(x.to_string(), 0);
        }
    }

    /// Representative of the set containing `x`, or `None` if unknown.
    pub fn find(&mut self, x: &str) -> Option<String> {
        let parent = self.parent.get(x)?.clone();
        if parent == x {
            return Some(parent);
        }
        let root = self.find(&parent)?;
        self.parent.insert(x.to_string(), root.clone());
        Some(root)
    }

    /// Merge the sets containing `x` and `y`. Returns `false` if they were
    /// already merged or either is unknown.
    pub fn union(&mut self, x: &str, y: &str) -> bool {
        let (Some(root_x), Some(root_y)) = (self.find(x), self.find(y)) else {
            return false;
        };
        if root_x == root_y {
            return false;
        }

        let rank_x = self.rank.get(&root_x).copied().unwrap_or(0);
        let rank_y = self.rank.get(&root_y).copied().unwrap_or(0);
        if rank_x < rank_y {
            self.parent.insert(root_x, root_y);
        } else if rank_x > rank_y {
            self.parent.insert(root_y, root_x);
        } else {
            self.parent.insert(root_y, root_x.clone());
            self.rank.insert(root_x, rank_x + 1);
        }
        true
    }

    pub fn connected(&mut self, x: &str, y: &str) -> bool {
        match (self.find(x), self.find(y)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// All components, each sorted, largest first.
    pub fn components(&mut self) -> Vec<Vec<String>> {
        let mut by_root: HashMap<String, Vec<String>> = HashMap::new();
        let elements: Vec<String> = self.parent.keys().cloned().collect();
        for elem in elements {
            if let Some(root) = self.find(&elem) {
                by_root.entry(root).or_default().push(elem);
            }
        }
        let mut components: Vec<Vec<String>> = by_root
            .into_values()
            .map(|mut c| {
                c.sort();
                c
            })
            .collect();
        components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        components
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

/// One rule the topology breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeViolation {
    /// More than one root node exists
    MultipleRoots { nodes: Vec<String> },
    /// An edge pairs tiers the rules do not allow
    TierMismatch {
        parent: String,
        child: String,
        parent_tier: Tier,
        child_tier: Tier,
    },
    /// A node has more than one parent edge
    MultipleParents { node: String, parents: Vec<String> },
    /// An edge names a node that does not exist
    DanglingEdge { edge: String, missing: String },
    /// A group of nodes not attached to the root's tree
    Detached { nodes: Vec<String> },
}

impl ShapeViolation {
    pub fn describe(&self) -> String {
        match self {
            ShapeViolation::MultipleRoots { nodes } => {
                format!("multiple root nodes: {}", nodes.join(", "))
            }
            ShapeViolation::TierMismatch {
                parent,
                child,
                parent_tier,
                child_tier,
            } => format!(
                "{} ({}) cannot parent {} ({})",
                parent, parent_tier, child, child_tier
            ),
            ShapeViolation::MultipleParents { node, parents } => {
                format!("{} has several parents: {}", node, parents.join(", "))
            }
            ShapeViolation::DanglingEdge { edge, missing } => {
                format!("edge {} references missing node {}", edge, missing)
            }
            ShapeViolation::Detached { nodes } => {
                format!("not attached to the root: {}", nodes.join(", "))
            }
        }
    }
}

/// Result of a shape check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShapeReport {
    pub node_count: usize,
    pub edge_count: usize,
    pub component_count: usize,
    pub violations: Vec<ShapeViolation>,
}

impl ShapeReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check the topology against the tier rules.
pub fn check_shape(store: &TopologyStore) -> ShapeReport {
    let mut violations = Vec::new();

    let roots: Vec<String> = store
        .nodes()
        .iter()
        .filter(|n| n.tier == Tier::Root)
        .map(|n| n.local_id.clone())
        .collect();
    if roots.len() > 1 {
        violations.push(ShapeViolation::MultipleRoots {
            nodes: roots.clone(),
        });
    }

    let mut uf = UnionFind::new();
    for node in store.nodes() {
        uf.make_set(&node.local_id);
    }

    let mut parents: HashMap<&str, Vec<String>> = HashMap::new();
    for edge in store.edges() {
        let (Some(parent), Some(child)) = (store.node(&edge.source), store.node(&edge.target))
        else {
            let missing = if store.node(&edge.source).is_none() {
                edge.source.clone()
            } else {
                edge.target.clone()
            };
            violations.push(ShapeViolation::DanglingEdge {
                edge: edge.id.clone(),
                missing,
            });
            continue;
        };

        if !parent.tier.can_parent(child.tier) {
            violations.push(ShapeViolation::TierMismatch {
                parent: parent.local_id.clone(),
                child: child.local_id.clone(),
                parent_tier: parent.tier,
                child_tier: child.tier,
            });
        }
        parents
            .entry(edge.target.as_str())
            .or_default()
            .push(edge.source.clone());
        uf.union(&edge.source, &edge.target);
    }

    let mut multi: Vec<ShapeViolation> = parents
        .into_iter()
        .filter(|(_, p)| p.len() > 1)
        .map(|(node, parents)| ShapeViolation::MultipleParents {
            node: node.to_string(),
            parents,
        })
        .collect();
    multi.sort_by_key(|v| v.describe());
    violations.extend(multi);

    let components = uf.components();
    if let Some(root) = roots.first() {
        for component in &components {
            if !component.contains(root) {
                violations.push(ShapeViolation::Detached {
                    nodes: component.clone(),
                });
            }
        }
    }

    ShapeReport {
        node_count: store.len(),
        edge_count: store.edges().len(),
        component_count: components.len(),
        violations,
    }
}
