//! Hash ring routing
//!
//! Nodes are ordered by the MurmurHash3 of their `host:port` identity. The
//! ring decides which node owns a key; it never shrinks at runtime.

use crate::error::{MeshKvError, Result};
use crate::hash::ring_hash;
use std::fmt;
use std::str::FromStr;

/// Network identity of a node: `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = MeshKvError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| MeshKvError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(MeshKvError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| MeshKvError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Parse a comma-separated `host:port` list.
///
/// Malformed entries are returned separately so the caller can report them;
/// empty entries are ignored.
pub fn parse_node_list(list: &str) -> (Vec<NodeAddr>, Vec<String>) {
    let mut nodes = Vec::new();
    let mut invalid = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse() {
            Ok(addr) => nodes.push(addr),
            Err(_) => invalid.push(entry.to_string()),
        }
    }
    (nodes, invalid)
}

/// A ring member. The hash is derived from the address and never set directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: NodeAddr,
    ring_hash: u32,
}

impl Node {
    pub fn new(addr: NodeAddr) -> Self {
        let ring_hash = ring_hash(&addr.to_string());
        Self { addr, ring_hash }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn ring_hash(&self) -> u32 {
        self.ring_hash
    }
}

/// How a key hash is matched to a node position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Start from the first node in ring order and move to any node whose
    /// hash is `>=` the key hash and strictly below the current candidate.
    /// Keys with no such node stay on the first node; there is no wrap to
    /// the highest position. On ties the first minimal match wins.
    #[default]
    FirstMinimal,
    /// Classic consistent hashing: the first node at or after the key hash,
    /// wrapping to the lowest position.
    Successor,
}

/// Ordered set of nodes, always containing the local node
#[derive(Debug, Clone)]
pub struct HashRing {
    local: NodeAddr,
    nodes: Vec<Node>,
    strategy: RoutingStrategy,
}

impl HashRing {
    /// Create a ring holding only the local node
    pub fn new(local: NodeAddr, strategy: RoutingStrategy) -> Self {
        Self {
            nodes: vec![Node::new(local.clone())],
            local,
            strategy,
        }
    }

    /// Create a ring from the local node plus its configured peers
    pub fn with_peers(
        local: NodeAddr,
        peers: impl IntoIterator<Item = NodeAddr>,
        strategy: RoutingStrategy,
    ) -> Self {
        let mut ring = Self::new(local, strategy);
        for peer in peers {
            ring.add_node(peer);
        }
        ring
    }

    /// Insert a node and restore ring order.
    ///
    /// Returns false when the address is already a member.
    pub fn add_node(&mut self, addr: NodeAddr) -> bool {
        if self.nodes.iter().any(|n| n.addr == addr) {
            return false;
        }
        self.nodes.push(Node::new(addr));
        // stable: equal hashes keep insertion order
        self.nodes.sort_by_key(|n| n.ring_hash);
        true
    }

    /// Node that owns `key`
    pub fn resolve(&self, key: &str) -> &Node {
        let key_hash = ring_hash(key);
        let first = &self.nodes[0];
        match self.strategy {
            RoutingStrategy::FirstMinimal => {
                let mut target = first;
                for node in &self.nodes {
                    if node.ring_hash >= key_hash && node.ring_hash < target.ring_hash {
                        target = node;
                    }
                }
                target
            }
            RoutingStrategy::Successor => self
                .nodes
                .iter()
                .find(|n| n.ring_hash >= key_hash)
                .unwrap_or(first),
        }
    }

    pub fn is_local(&self, node: &Node) -> bool {
        node.addr == self.local
    }

    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    /// All members in ring order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Every member except the local node, in ring order
    pub fn peers(&self) -> Vec<NodeAddr> {
        self.nodes
            .iter()
            .filter(|n| !self.is_local(n))
            .map(|n| n.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }
}
