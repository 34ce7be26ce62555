//! Topology file storage.
//!
//! A topology is saved as `{"nodes": [...], "edges": [...], "next_seq": n}`.
//! Each node keeps its canvas position and carries its data under `data`:
//!
//! ```json
//! {"id": "nd-1", "position": {"x": 0, "y": 0},
//!  "data": {"label": "Cloud Node", "ip_address": "10.0.0.1", "port": 9000,
//!           "node_type": 1, "backed_id": "1", "children_ids": ["2"]}}
//! ```
//!
//! Loading is tolerant: optional fields may be missing, agent ids may be
//! numbers, and a missing `next_seq` is derived from the local ids present.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::{Address, Edge, Node, Position, Tier, TopologyStore, edge_id};
use crate::{Error, Result};

/// Default topology file in the working directory.
pub const DEFAULT_TOPOLOGY_FILE: &str = "topology.json";

#[derive(Debug, Serialize, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    nodes: Vec<FileNode>,
    #[serde(default)]
    edges: Vec<FileEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_seq: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileNode {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    position: Position,
    data: FileNodeData,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileNodeData {
    #[serde(default)]
    label: String,
    #[serde(default)]
    ip_address: String,
    #[serde(default)]
    port: u16,
    node_type: Tier,
    #[serde(
        default,
        deserialize_with = "optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    backed_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    parent_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_ids",
        skip_serializing_if = "Option::is_none"
    )]
    children_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_mac: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEdge {
    #[serde(default)]
    id: String,
    source: String,
    target: String,
}

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    value_to_id(Value::deserialize(deserializer)?)
        .ok_or_else(|| serde::de::Error::custom("id must be a string or number"))
}

fn optional_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(value_to_id))
}

fn optional_ids<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?
        .map(|ids| ids.into_iter().filter_map(value_to_id).collect()))
}

impl From<&Node> for FileNode {
    fn from(node: &Node) -> Self {
        Self {
            id: node.local_id.clone(),
            position: node.position,
            data: FileNodeData {
                label: node.label.clone(),
                ip_address: node.address.host.clone(),
                port: node.address.port,
                node_type: node.tier,
                backed_id: node.agent_id.clone(),
                parent_id: node.parent_ref.clone(),
                children_ids: node
                    .children_refs
                    .as_ref()
                    .map(|children| children.iter().cloned().collect()),
                device_mac: node.hardware_id.clone(),
            },
        }
    }
}

impl From<FileNode> for Node {
    fn from(file: FileNode) -> Self {
        let data = file.data;
        Node {
            local_id: file.id,
            agent_id: data.backed_id,
            tier: data.node_type,
            address: Address::new(data.ip_address, data.port),
            label: data.label,
            parent_ref: data.parent_id,
            children_refs: data
                .children_ids
                .map(|children| children.into_iter().collect::<BTreeSet<String>>()),
            hardware_id: data.device_mac,
            position: file.position,
        }
    }
}

/// Serialize a topology to pretty JSON.
pub fn to_json(store: &TopologyStore) -> Result<String> {
    let file = TopologyFile {
        nodes: store.nodes().iter().map(FileNode::from).collect(),
        edges: store
            .edges()
            .iter()
            .map(|e| FileEdge {
                id: e.id.clone(),
                source: e.source.clone(),
                target: e.target.clone(),
            })
            .collect(),
        next_seq: Some(store.next_seq()),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

/// Parse a topology from JSON.
pub fn from_json(json: &str) -> Result<TopologyStore> {
    let file: TopologyFile = serde_json::from_str(json)?;
    let nodes: Vec<Node> = file.nodes.into_iter().map(Node::from).collect();
    let edges: Vec<Edge> = file
        .edges
        .into_iter()
        .map(|e| Edge {
            id: if e.id.is_empty() {
                edge_id(&e.source, &e.target)
            } else {
                e.id
            },
            source: e.source,
            target: e.target,
        })
        .collect();
    TopologyStore::from_parts(nodes, edges, file.next_seq.unwrap_or(1))
}

/// Write a topology to `path`, replacing it atomically.
pub fn save(store: &TopologyStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let contents = to_json(store)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), nodes = store.len(), "topology saved");
    Ok(())
}

/// Read a topology from `path`.
pub fn load(path: &Path) -> Result<TopologyStore> {
    let contents = fs::read_to_string(path)?;
    from_json(&contents).map_err(|e| match e {
        Error::Json(e) => Error::InvalidInput(format!(
            "{} is not a valid topology file: {}",
            path.display(),
            e
        )),
        other => other,
    })
}

/// Read a topology from `path`, or start empty if the file does not exist.
pub fn load_or_default(path: &Path) -> Result<TopologyStore> {
    if path.exists() {
        load(path)
    } else {
        debug!(path = %path.display(), "no topology file yet");
        Ok(TopologyStore::new())
    }
}

/// File name used by `export` when no path is given.
pub fn default_export_name(now: DateTime<Local>) -> String {
    format!("federated_topology_{}.json", now.format("%Y_%m_%d_%H_%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodePatch;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample_store() -> TopologyStore {
        let mut store = TopologyStore::new();
        let root = store.create_node(Tier::Root).local_id.clone();
        let mid = store.create_node(Tier::Mid).local_id.clone();
        let gone = store.create_node(Tier::Leaf).local_id.clone();
        store.remove_node(&gone).unwrap();
        store
            .update_node(
                &root,
                &NodePatch::new()
                    .address(Address::new("10.0.0.1", 9000))
                    .agent_id(Some("1".to_string()))
                    .children_refs(Some(["2".to_string()].into_iter().collect()))
                    .position(Position { x: 10.0, y: -4.5 }),
            )
            .unwrap();
        store
            .update_node(
                &mid,
                &NodePatch::new()
                    .address(Address::new("10.0.0.2", 9001))
                    .agent_id(Some("2".to_string()))
                    .parent_ref(Some("1".to_string()))
                    .hardware_id(Some("aa:bb:cc:dd:ee:ff".to_string())),
            )
            .unwrap();
        store.connect(&root, &mid).unwrap();
        store
    }

    #[test]
    fn test_json_roundtrip_preserves_topology() {
        let store = sample_store();
        let restored = from_json(&to_json(&store).unwrap()).unwrap();
        assert_eq!(restored, store);
        assert_eq!(restored.next_seq(), 4);
    }

    #[test]
    fn test_json_uses_file_field_names() {
        let value: Value = serde_json::from_str(&to_json(&sample_store()).unwrap()).unwrap();
        let root = &value["nodes"][0];
        assert_eq!(root["id"], "nd-1");
        assert_eq!(root["data"]["ip_address"], "10.0.0.1");
        assert_eq!(root["data"]["node_type"], 1);
        assert_eq!(root["data"]["backed_id"], "1");
        assert_eq!(root["data"]["children_ids"][0], "2");
        assert_eq!(value["nodes"][1]["data"]["device_mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(value["edges"][0]["source"], "nd-1");
        assert_eq!(value["next_seq"], 4);
    }

    #[test]
    fn test_import_tolerates_missing_fields() {
        let json = r#"{
            "nodes": [
                {"id": "nd-7", "data": {"node_type": 2, "backed_id": 12}},
                {"id": "edge-a", "data": {"label": "x", "node_type": 3, "children_ids": [1, "b"]}}
            ],
            "edges": [{"source": "nd-7", "target": "edge-a"}]
        }"#;
        let store = from_json(json).unwrap();
        let mid = store.node("nd-7").unwrap();
        assert_eq!(mid.agent_id.as_deref(), Some("12"));
        assert_eq!(mid.position, Position::default());
        assert_eq!(mid.label, "");
        assert!(!mid.address.is_valid());
        assert_eq!(store.next_seq(), 8);
        assert_eq!(store.edges()[0].id, "edge-nd-7-edge-a");
        let leaf = store.node("edge-a").unwrap();
        assert_eq!(leaf.children_refs.as_ref().map(|c| c.len()), Some(2));
    }

    #[test]
    fn test_import_rejects_unknown_tier() {
        let json = r#"{"nodes": [{"id": "nd-1", "data": {"node_type": 9}}]}"#;
        assert!(from_json(json).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("topology.json");
        let store = sample_store();
        save(&store, &path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("topology.json.tmp").exists());
        assert_eq!(load(&path).unwrap(), store);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = load_or_default(&dir.path().join("absent.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_reports_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("not a valid topology file"));
    }

    #[test]
    fn test_default_export_name() {
        let now = Local.with_ymd_and_hms(2026, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(
            default_export_name(now),
            "federated_topology_2026_03_09_07_05.json"
        );
    }
}
