//! Wire protocol between fedtree and agents.
//!
//! Requests are `{"operation": <name>, "data": <payload>}`. Replies carry no
//! envelope: they are interpreted by which field is present (`node`,
//! `parent_node`, `children`, `error`). Agents may also push
//! `{"type": "status_update", ...}` frames at any time.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::models::{Address, Node, Tier};
use crate::notifications::StatusMessage;

/// Frame type tag of agent status notifications.
pub const STATUS_UPDATE_TYPE: &str = "status_update";

/// Default path segment of the control endpoint.
pub const DEFAULT_ROLE_PATH: &str = "node";

/// Operations an agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    GetNodeInfo,
    GetParent,
    GetChildren,
    SetParent,
    SetChildren,
    RemoveParent,
    RemoveChild,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::GetNodeInfo => "get_node_info",
            Operation::GetParent => "get_parent",
            Operation::GetChildren => "get_children",
            Operation::SetParent => "set_parent",
            Operation::SetChildren => "set_children",
            Operation::RemoveParent => "remove_parent",
            Operation::RemoveChild => "remove_child",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent replies that did not say what the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected response to {operation}: expected '{expected}', got {reply}")]
    UnexpectedResponse {
        operation: Operation,
        expected: &'static str,
        reply: String,
    },

    #[error("agent rejected {operation}: {message}")]
    Agent {
        operation: Operation,
        message: String,
    },
}

/// Outgoing request frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFrame {
    pub operation: Operation,
    pub data: Value,
}

impl RequestFrame {
    pub fn new(operation: Operation, data: Value) -> Self {
        Self { operation, data }
    }
}

/// How a node describes itself or a peer to an agent.
///
/// `initialize` omits `id`; `set_parent` and `set_children` include it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub node_type: Tier,
    pub ip_address: String,
    pub port: u16,
}

impl AgentDescriptor {
    /// Descriptor of an already-initialized node.
    pub fn of(node: &Node) -> Self {
        Self {
            id: node.agent_id.clone(),
            ..Self::for_initialize(node)
        }
    }

    /// Descriptor sent with `initialize`.
    pub fn for_initialize(node: &Node) -> Self {
        Self {
            id: None,
            name: node.label.clone(),
            node_type: node.tier,
            ip_address: node.address.host.clone(),
            port: node.address.port,
        }
    }
}

/// What an agent reports about itself or a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNodeInfo {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_mac: Option<String>,
}

/// Agent ids arrive as strings or numbers; store them as strings.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "agent id must be a string or number, got {}",
            other
        ))),
    }
}

/// Fail with the agent's own message if the reply carries `error`.
fn check_error(operation: Operation, reply: &Value) -> Result<(), ProtocolError> {
    match reply.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(message)) => Err(ProtocolError::Agent {
            operation,
            message: message.clone(),
        }),
        Some(other) => Err(ProtocolError::Agent {
            operation,
            message: other.to_string(),
        }),
    }
}

fn unexpected(operation: Operation, expected: &'static str, reply: &Value) -> ProtocolError {
    ProtocolError::UnexpectedResponse {
        operation,
        expected,
        reply: reply.to_string(),
    }
}

fn field<'a>(
    operation: Operation,
    reply: &'a Value,
    name: &'static str,
) -> Result<&'a Value, ProtocolError> {
    check_error(operation, reply)?;
    reply.get(name).ok_or_else(|| unexpected(operation, name, reply))
}

/// Extract the `node` field of an `initialize`/`get_node_info` reply.
pub fn expect_node(operation: Operation, reply: &Value) -> Result<AgentNodeInfo, ProtocolError> {
    let node = field(operation, reply, "node")?;
    AgentNodeInfo::deserialize(node).map_err(|_| unexpected(operation, "node", reply))
}

/// Extract the `parent_node` field of a `get_parent` reply; `null` means none.
pub fn expect_parent(
    operation: Operation,
    reply: &Value,
) -> Result<Option<AgentNodeInfo>, ProtocolError> {
    match field(operation, reply, "parent_node")? {
        Value::Null => Ok(None),
        parent => AgentNodeInfo::deserialize(parent)
            .map(Some)
            .map_err(|_| unexpected(operation, "parent_node", reply)),
    }
}

/// Extract the `children` list of a `get_children` reply.
pub fn expect_children(
    operation: Operation,
    reply: &Value,
) -> Result<Vec<AgentNodeInfo>, ProtocolError> {
    let children = field(operation, reply, "children")?;
    Vec::<AgentNodeInfo>::deserialize(children).map_err(|_| unexpected(operation, "children", reply))
}

/// Accept any reply without `error`, returning its `message` if present.
pub fn expect_ack(operation: Operation, reply: &Value) -> Result<Option<String>, ProtocolError> {
    check_error(operation, reply)?;
    Ok(reply
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Whether a frame carries the status notification tag, readable or not.
pub fn is_status_update(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some(STATUS_UPDATE_TYPE)
}

/// Parse a status notification frame, or `None` for any other frame and
/// for tagged frames whose body does not parse.
pub fn parse_status_update(frame: &Value) -> Option<StatusMessage> {
    if !is_status_update(frame) {
        return None;
    }
    StatusMessage::deserialize(frame).ok()
}

/// Endpoint path segment per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolePaths {
    pub root: String,
    pub mid: String,
    pub leaf: String,
}

impl Default for RolePaths {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROLE_PATH.to_string(),
            mid: DEFAULT_ROLE_PATH.to_string(),
            leaf: DEFAULT_ROLE_PATH.to_string(),
        }
    }
}

impl RolePaths {
    pub fn for_tier(&self, tier: Tier) -> &str {
        match tier {
            Tier::Root => &self.root,
            Tier::Mid => &self.mid,
            Tier::Leaf => &self.leaf,
        }
    }
}

/// Build `scheme://host:port/<role>/ws`.
pub fn endpoint_url(scheme: &str, address: &Address, role: &str) -> Result<Url, url::ParseError> {
    let role = role.trim_matches('/');
    if role.is_empty() {
        Url::parse(&format!("{}://{}:{}/ws", scheme, address.host, address.port))
    } else {
        Url::parse(&format!(
            "{}://{}:{}/{}/ws",
            scheme, address.host, address.port, role
        ))
    }
}
