//! Loads and validates the JSON topology file (§6 of the protocol spec):
//!
//! ```json
//! {
//!   "nodes": { "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101} },
//!   "connections": { "1": [2], "2": [1, 3], "3": [2] }
//! }
//! ```
//!
//! This mirrors `apps/node/src/config/p2p.rs::P2pConfig::to_client_config`'s
//! "deserialize then validate, then build the thing the core actually
//! wants" shape: `serde_json` only parses the wire format into plain structs
//! here; every invariant the core relies on (symmetry, tree-ness, no
//! self-loop, no unknown neighbor id) is checked in [`load`] before a
//! [`JsonTopologyProvider`] is ever handed to `election_core::ElectionNode`.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use election_core::{NodeAddress, Topology, TopologyProvider};

#[derive(Debug, Deserialize)]
struct NodeEntry {
    host: String,
    election_port: u16,
    application_port: u16,
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    nodes: BTreeMap<String, NodeEntry>,
    connections: BTreeMap<String, Vec<i64>>,
}

/// Errors loading or validating a topology file.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read topology file {0:?}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),

    #[error("failed to parse topology file {0:?}: {1}")]
    Json(std::path::PathBuf, #[source] serde_json::Error),

    #[error("node id {0:?} is not a decimal integer")]
    InvalidNodeId(String),

    #[error("node {0:?} not found in the topology file")]
    UnknownNode(String),

    #[error("connections reference unknown node {0}")]
    UnknownNeighbor(i64),

    #[error("connections are asymmetric between {0} and {1}")]
    Asymmetric(i64, i64),

    #[error("node {0} lists itself as a neighbor")]
    SelfNeighbor(i64),

    #[error("connections graph is not a tree over {nodes} nodes ({edges} edges, expected {expected})")]
    NotATree { nodes: usize, edges: usize, expected: usize },

    #[error("connections graph is not fully connected: {unreached} node(s) unreachable from node {from}")]
    Disconnected { from: i64, unreached: usize },

    #[error(transparent)]
    Topology(#[from] election_core::TopologyError),
}

/// A `TopologyProvider` backed by a parsed-and-validated topology file.
///
/// Wraps `election_core::Topology` (what the core actually consumes) and
/// additionally remembers every node's `application_port`, which the core
/// has no use for but the post-election demo app (§6 "Post-election
/// application layer") does.
pub struct JsonTopologyProvider {
    inner: Topology,
    application_ports: BTreeMap<i64, u16>,
}

impl JsonTopologyProvider {
    /// The `application_port` of `node_id`, if it exists in the topology.
    pub fn application_port(&self, node_id: i64) -> Option<u16> {
        self.application_ports.get(&node_id).copied()
    }
}

impl TopologyProvider for JsonTopologyProvider {
    fn self_id(&self) -> i64 {
        self.inner.self_id()
    }

    fn self_address(&self) -> NodeAddress {
        self.inner.self_address()
    }

    fn neighbors(&self) -> &BTreeMap<i64, NodeAddress> {
        self.inner.neighbors()
    }

    fn starter_id(&self) -> i64 {
        self.inner.starter_id()
    }

    fn node_count(&self) -> usize {
        self.inner.node_count()
    }
}

/// Load the topology file at `path` and build the [`JsonTopologyProvider`]
/// for the node named `node_name` (a key into the file's `nodes` map).
pub fn load(path: &Path, node_name: &str) -> Result<JsonTopologyProvider, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
    let file: TopologyFile =
        serde_json::from_str(&raw).map_err(|e| Error::Json(path.to_path_buf(), e))?;

    let mut nodes: BTreeMap<i64, &NodeEntry> = BTreeMap::new();
    for (key, entry) in &file.nodes {
        let id: i64 = key.parse().map_err(|_| Error::InvalidNodeId(key.clone()))?;
        nodes.insert(id, entry);
    }
    let all_node_ids: BTreeSet<i64> = nodes.keys().copied().collect();

    let mut adjacency: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for (key, peers) in &file.connections {
        let id: i64 = key.parse().map_err(|_| Error::InvalidNodeId(key.clone()))?;
        if !all_node_ids.contains(&id) {
            return Err(Error::UnknownNeighbor(id));
        }
        for &peer in peers {
            if peer == id {
                return Err(Error::SelfNeighbor(id));
            }
            if !all_node_ids.contains(&peer) {
                return Err(Error::UnknownNeighbor(peer));
            }
            adjacency.entry(id).or_default().insert(peer);
        }
    }

    for (&a, peers) in &adjacency {
        for &b in peers {
            let reciprocal = adjacency.get(&b).is_some_and(|p| p.contains(&a));
            if !reciprocal {
                return Err(Error::Asymmetric(a, b));
            }
        }
    }

    let edge_count: usize = adjacency.values().map(|peers| peers.len()).sum::<usize>() / 2;
    let expected = all_node_ids.len().saturating_sub(1);
    if edge_count != expected {
        return Err(Error::NotATree { nodes: all_node_ids.len(), edges: edge_count, expected });
    }
    assert_connected(&all_node_ids, &adjacency)?;

    let self_id: i64 = node_name.parse().map_err(|_| Error::UnknownNode(node_name.to_string()))?;
    let self_entry = *nodes.get(&self_id).ok_or_else(|| Error::UnknownNode(node_name.to_string()))?;

    let application_ports: BTreeMap<i64, u16> =
        nodes.iter().map(|(&id, entry)| (id, entry.application_port)).collect();

    let self_address = NodeAddress::new(self_entry.host.clone(), self_entry.election_port);
    let neighbors: BTreeMap<i64, NodeAddress> = adjacency
        .get(&self_id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|peer_id| {
            let entry = nodes[&peer_id];
            (peer_id, NodeAddress::new(entry.host.clone(), entry.election_port))
        })
        .collect();

    let inner = Topology::new(self_id, self_address, neighbors, all_node_ids)?;
    Ok(JsonTopologyProvider { inner, application_ports })
}

/// A tree with `n - 1` edges is connected iff a BFS/DFS from any node
/// reaches every other node; checked separately from the edge count so a
/// malformed file with the right edge count but two disjoint components (one
/// of them cyclic) is reported as `Disconnected`, not silently accepted.
fn assert_connected(all_node_ids: &BTreeSet<i64>, adjacency: &BTreeMap<i64, BTreeSet<i64>>) -> Result<(), Error> {
    let Some(&start) = all_node_ids.iter().next() else {
        return Ok(());
    };

    let mut visited = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if let Some(peers) = adjacency.get(&node) {
            stack.extend(peers.iter().copied());
        }
    }

    let unreached = all_node_ids.len() - visited.len();
    if unreached > 0 {
        return Err(Error::Disconnected { from: start, unreached });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_topology(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    const THREE_NODE_LINE: &str = r#"{
        "nodes": {
            "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101},
            "2": {"host": "127.0.0.1", "election_port": 9002, "application_port": 9102},
            "3": {"host": "127.0.0.1", "election_port": 9003, "application_port": 9103}
        },
        "connections": { "1": [2], "2": [1, 3], "3": [2] }
    }"#;

    #[test]
    fn loads_middle_node_with_two_neighbors() {
        let file = write_topology(THREE_NODE_LINE);
        let provider = load(file.path(), "2").unwrap();

        assert_eq!(provider.self_id(), 2);
        assert_eq!(provider.neighbors().len(), 2);
        assert_eq!(provider.node_count(), 3);
        assert_eq!(provider.starter_id(), 1);
        assert_eq!(provider.application_port(3), Some(9103));
    }

    #[test]
    fn rejects_unknown_node_name() {
        let file = write_topology(THREE_NODE_LINE);
        let err = load(file.path(), "99").unwrap_err();
        assert!(matches!(err, Error::UnknownNode(_)));
    }

    #[test]
    fn rejects_asymmetric_connections() {
        let json = r#"{
            "nodes": {
                "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101},
                "2": {"host": "127.0.0.1", "election_port": 9002, "application_port": 9102}
            },
            "connections": { "1": [2], "2": [] }
        }"#;
        let file = write_topology(json);
        let err = load(file.path(), "1").unwrap_err();
        assert!(matches!(err, Error::Asymmetric(_, _)));
    }

    #[test]
    fn rejects_cyclic_connections() {
        let json = r#"{
            "nodes": {
                "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101},
                "2": {"host": "127.0.0.1", "election_port": 9002, "application_port": 9102},
                "3": {"host": "127.0.0.1", "election_port": 9003, "application_port": 9103}
            },
            "connections": { "1": [2, 3], "2": [1, 3], "3": [1, 2] }
        }"#;
        let file = write_topology(json);
        let err = load(file.path(), "1").unwrap_err();
        assert!(matches!(err, Error::NotATree { .. }));
    }

    #[test]
    fn rejects_disconnected_graph_with_right_edge_count() {
        // A 3-node cycle (3 edges) plus an isolated 4th node: n-1=3 edges
        // over 4 nodes, so the edge-count check alone passes. Only the
        // connectivity check catches node 4 being unreachable.
        let json = r#"{
            "nodes": {
                "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101},
                "2": {"host": "127.0.0.1", "election_port": 9002, "application_port": 9102},
                "3": {"host": "127.0.0.1", "election_port": 9003, "application_port": 9103},
                "4": {"host": "127.0.0.1", "election_port": 9004, "application_port": 9104}
            },
            "connections": { "1": [2, 3], "2": [1, 3], "3": [1, 2], "4": [] }
        }"#;
        let file = write_topology(json);
        let err = load(file.path(), "1").unwrap_err();
        assert!(matches!(err, Error::Disconnected { .. }));
    }

    #[test]
    fn rejects_self_loop() {
        let json = r#"{
            "nodes": {
                "1": {"host": "127.0.0.1", "election_port": 9001, "application_port": 9101}
            },
            "connections": { "1": [1] }
        }"#;
        let file = write_topology(json);
        let err = load(file.path(), "1").unwrap_err();
        assert!(matches!(err, Error::SelfNeighbor(1)));
    }
}
