//! A second, independent reader of the same topology file `electiond`
//! loads (§6). Deliberately smaller than `electiond::config::topology`: it
//! trusts that whoever ran the election already validated the file (the
//! election itself cannot converge on a malformed, non-tree topology), so it
//! only re-derives what this demo needs -- this node's neighbors and every
//! node's application address -- rather than re-running the full tree check.
use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use election_core::{NodeAddress, Topology};

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

    #[error(transparent)]
    Topology(#[from] election_core::TopologyError),
}

/// This node's election view plus every node's application address, so the
/// demo can dial the leader once it is known even though the leader is not
/// necessarily a neighbor.
pub struct DemoTopology {
    pub provider: Topology,
    pub application_addresses: BTreeMap<i64, (String, u16)>,
}

pub fn load(path: &Path, node_name: &str) -> Result<DemoTopology, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
    let file: TopologyFile =
        serde_json::from_str(&raw).map_err(|e| Error::Json(path.to_path_buf(), e))?;

    let mut nodes: BTreeMap<i64, NodeEntry> = BTreeMap::new();
    for (key, entry) in file.nodes {
        let id: i64 = key.parse().map_err(|_| Error::InvalidNodeId(key.clone()))?;
        nodes.insert(id, entry);
    }
    let all_node_ids = nodes.keys().copied().collect();

    let self_id: i64 = node_name.parse().map_err(|_| Error::UnknownNode(node_name.to_string()))?;
    let self_entry = nodes.get(&self_id).ok_or_else(|| Error::UnknownNode(node_name.to_string()))?;
    let self_address = NodeAddress::new(self_entry.host.clone(), self_entry.election_port);

    let neighbor_ids: Vec<i64> = file
        .connections
        .get(node_name)
        .cloned()
        .unwrap_or_default();
    let neighbors: BTreeMap<i64, NodeAddress> = neighbor_ids
        .into_iter()
        .filter_map(|id| nodes.get(&id).map(|e| (id, NodeAddress::new(e.host.clone(), e.election_port))))
        .collect();

    let application_addresses = nodes
        .iter()
        .map(|(&id, entry)| (id, (entry.host.clone(), entry.application_port)))
        .collect();

    let provider = Topology::new(self_id, self_address, neighbors, all_node_ids)?;
    Ok(DemoTopology { provider, application_addresses })
}
