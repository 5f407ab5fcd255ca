use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// An addressable peer in the cluster.
///
/// Identity is carried entirely by `id`: two nodes with the same id compare
/// equal even if their addresses differ, and the id is the routing and
/// statistics grouping key. A node whose address changed must be removed and
/// re-added by the membership layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Integer identity, unique within the cluster
    pub id: u32,
    /// Hostname or IP the node listens on
    pub host: String,
    /// TCP port the node listens on
    pub port: u16,
}

impl Node {
    pub fn new(id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// The `host:port` string used for socket connects.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// A node plus the capability bitmasks the load balancer consults.
///
/// Endpoints are immutable for the lifetime of a membership snapshot; a new
/// snapshot replaces the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: Node,
    /// Transient capability bits
    pub capability: u64,
    /// Capability bits that survive restarts
    pub persistent_capability: u64,
}

impl Endpoint {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            capability: 0,
            persistent_capability: 0,
        }
    }

    pub fn with_capability(mut self, capability: u64, persistent_capability: u64) -> Self {
        self.capability = capability;
        self.persistent_capability = persistent_capability;
        self
    }

    /// Whether this endpoint advertises every bit in both requested masks.
    pub fn can_serve(&self, capability: u64, persistent_capability: u64) -> bool {
        self.capability & capability == capability
            && self.persistent_capability & persistent_capability == persistent_capability
    }
}
