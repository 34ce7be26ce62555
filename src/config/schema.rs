//! KDL schema for config.kdl.

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

/// Schemes an agent endpoint may use.
pub const SUPPORTED_SCHEMES: [&str; 2] = ["ws", "wss"];

/// Operator preferences stored in config.kdl.
///
/// # KDL Schema
///
/// ```kdl
/// scheme "ws"
/// retry-delay-ms 3000
/// retry-max-delay-ms 30000   // switches to exponential backoff
/// address-poll-ms 1000
/// call-timeout-secs 30       // 0 waits forever
/// role-path root="node" mid="node" leaf="node"
/// topology "/srv/fedtree/topology.json"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedtreeConfig {
    /// URL scheme of agent endpoints
    pub scheme: Option<String>,

    /// Delay before redialing a closed connection
    pub retry_delay_ms: Option<u64>,

    /// Upper bound of the exponential backoff; unset means a fixed delay
    pub retry_max_delay_ms: Option<u64>,

    /// Poll interval while a connection has no valid address
    pub address_poll_ms: Option<u64>,

    /// Upper bound on one agent call
    pub call_timeout_secs: Option<u64>,

    /// Endpoint path segment for root agents
    pub role_path_root: Option<String>,
    /// Endpoint path segment for mid agents
    pub role_path_mid: Option<String>,
    /// Endpoint path segment for leaf agents
    pub role_path_leaf: Option<String>,

    /// Default topology file
    pub topology: Option<String>,
}

fn string_arg(doc: &KdlDocument, name: &str) -> Option<String> {
    doc.get(name)?
        .entries()
        .first()?
        .value()
        .as_string()
        .map(|s| s.to_string())
}

fn u64_arg(doc: &KdlDocument, name: &str) -> Option<u64> {
    let value = doc.get(name)?.entries().first()?.value().as_integer()?;
    u64::try_from(value).ok()
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn push_string(doc: &mut KdlDocument, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        let mut node = KdlNode::new(name);
        node.push(KdlEntry::new(KdlValue::String(value.clone())));
        doc.nodes_mut().push(node);
    }
}

fn push_u64(doc: &mut KdlDocument, name: &str, value: Option<u64>) {
    if let Some(value) = value {
        let mut node = KdlNode::new(name);
        node.push(KdlEntry::new(KdlValue::Integer(value as i128)));
        doc.nodes_mut().push(node);
    }
}

impl FedtreeConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref scheme) = self.scheme {
            if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
                return Err(format!("scheme must be ws or wss, got '{}'", scheme));
            }
        }
        if self.retry_delay_ms == Some(0) {
            return Err("retry-delay-ms must be positive".to_string());
        }
        if self.address_poll_ms == Some(0) {
            return Err("address-poll-ms must be positive".to_string());
        }
        if let (Some(base), Some(max)) = (self.retry_delay_ms, self.retry_max_delay_ms) {
            if max < base {
                return Err(format!(
                    "retry-max-delay-ms ({}) is below retry-delay-ms ({})",
                    max, base
                ));
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document. Unknown nodes are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        config.scheme = string_arg(doc, "scheme");
        config.retry_delay_ms = u64_arg(doc, "retry-delay-ms");
        config.retry_max_delay_ms = u64_arg(doc, "retry-max-delay-ms");
        config.address_poll_ms = u64_arg(doc, "address-poll-ms");
        config.call_timeout_secs = u64_arg(doc, "call-timeout-secs");
        config.topology = string_arg(doc, "topology");

        if let Some(node) = doc.get("role-path") {
            config.role_path_root = string_prop(node, "root");
            config.role_path_mid = string_prop(node, "mid");
            config.role_path_leaf = string_prop(node, "leaf");
        }

        config
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        push_string(&mut doc, "scheme", &self.scheme);
        push_u64(&mut doc, "retry-delay-ms", self.retry_delay_ms);
        push_u64(&mut doc, "retry-max-delay-ms", self.retry_max_delay_ms);
        push_u64(&mut doc, "address-poll-ms", self.address_poll_ms);
        push_u64(&mut doc, "call-timeout-secs", self.call_timeout_secs);

        let roles = [
            ("root", &self.role_path_root),
            ("mid", &self.role_path_mid),
            ("leaf", &self.role_path_leaf),
        ];
        if roles.iter().any(|(_, v)| v.is_some()) {
            let mut node = KdlNode::new("role-path");
            for (key, value) in roles {
                if let Some(value) = value {
                    node.push(KdlEntry::new_prop(key, KdlValue::String(value.clone())));
                }
            }
            doc.nodes_mut().push(node);
        }

        push_string(&mut doc, "topology", &self.topology);

        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &FedtreeConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                *slot = other.clone();
            }
        }
        take(&mut self.scheme, &other.scheme);
        take(&mut self.retry_delay_ms, &other.retry_delay_ms);
        take(&mut self.retry_max_delay_ms, &other.retry_max_delay_ms);
        take(&mut self.address_poll_ms, &other.address_poll_ms);
        take(&mut self.call_timeout_secs, &other.call_timeout_secs);
        take(&mut self.role_path_root, &other.role_path_root);
        take(&mut self.role_path_mid, &other.role_path_mid);
        take(&mut self.role_path_leaf, &other.role_path_leaf);
        take(&mut self.topology, &other.topology);
    }
}
