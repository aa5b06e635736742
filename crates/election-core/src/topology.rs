//! Static network topology: this node's id/address and its neighbor map.
//!
//! Loading a topology from JSON is an external collaborator's job (see
//! `apps/electiond::config::topology`); this module only defines the data the
//! core consumes and the invariants it must uphold (§3/§6).
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// A neighbor's (or this node's own) listen address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Resolve to a [`SocketAddr`] suitable for `bind`/`dial`.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::UnresolvableAddress(self.clone()))?
            .next()
            .ok_or_else(|| Error::UnresolvableAddress(self.clone()))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors constructing or resolving a [`Topology`].
#[derive(Error, Debug)]
pub enum Error {
    /// This node's id appears as its own neighbor.
    #[error("node {0} lists itself as a neighbor")]
    SelfNeighbor(i64),

    /// The neighbor graph is not symmetric: `b` is a neighbor of `a` but not
    /// vice versa. Checked by whoever builds the full multi-node topology
    /// (tests, or an external loader); a single node's [`Topology`] only
    /// knows its own edges.
    #[error("asymmetric edge between {0} and {1}")]
    Asymmetric(i64, i64),

    /// A neighbor address could not be resolved to a socket address.
    #[error("could not resolve address {0}")]
    UnresolvableAddress(NodeAddress),
}

/// This node's view of the network: its own id/address, and its neighbors'.
///
/// Immutable after construction, as required by §3 -- nothing in
/// `election-core` ever mutates a `Topology` once it has handed a node to
/// [`crate::facade::ElectionNode`].
#[derive(Debug, Clone)]
pub struct Topology {
    self_id: i64,
    self_address: NodeAddress,
    neighbors: BTreeMap<i64, NodeAddress>,
    /// Ids of every node in the network, not just this node's neighbors --
    /// needed to answer [`TopologyProvider::starter_id`] and
    /// [`TopologyProvider::node_count`], which are global properties of the
    /// topology file (§6), even though `neighbors()` itself is local.
    all_node_ids: BTreeSet<i64>,
}

impl Topology {
    /// Construct a topology. Fails if `self_id` appears among its own
    /// neighbors (§3: "the local id is never a key").
    pub fn new(
        self_id: i64,
        self_address: NodeAddress,
        neighbors: BTreeMap<i64, NodeAddress>,
        all_node_ids: BTreeSet<i64>,
    ) -> Result<Self, Error> {
        if neighbors.contains_key(&self_id) {
            return Err(Error::SelfNeighbor(self_id));
        }
        Ok(Self { self_id, self_address, neighbors, all_node_ids })
    }
}

/// What `election-core` needs to know about the network it is running on.
///
/// An external collaborator (the CLI, a JSON topology loader, a test) is
/// responsible for producing an implementation; the election engine only
/// ever reads through this trait.
pub trait TopologyProvider: Send + Sync {
    /// This node's own id.
    fn self_id(&self) -> i64;
    /// This node's own listen address.
    fn self_address(&self) -> NodeAddress;
    /// Map of neighbor id to neighbor listen address.
    fn neighbors(&self) -> &BTreeMap<i64, NodeAddress>;
    /// The distinguished "election starter" (minimum node id) -- an
    /// orchestration convenience, not a protocol requirement (§4.4, §9).
    fn starter_id(&self) -> i64;
    /// Total number of nodes participating in the election.
    fn node_count(&self) -> usize;
}

impl TopologyProvider for Topology {
    fn self_id(&self) -> i64 {
        self.self_id
    }

    fn self_address(&self) -> NodeAddress {
        self.self_address.clone()
    }

    fn neighbors(&self) -> &BTreeMap<i64, NodeAddress> {
        &self.neighbors
    }

    fn starter_id(&self) -> i64 {
        self.all_node_ids.iter().min().copied().unwrap_or(self.self_id)
    }

    fn node_count(&self) -> usize {
        self.all_node_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_ids(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn rejects_self_as_neighbor() {
        let mut neighbors = BTreeMap::new();
        neighbors.insert(1, NodeAddress::new("127.0.0.1", 9001));

        let err = Topology::new(
            1,
            NodeAddress::new("127.0.0.1", 9000),
            neighbors,
            node_ids(&[1]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SelfNeighbor(1)));
    }

    #[test]
    fn resolves_loopback_address() {
        let addr = NodeAddress::new("127.0.0.1", 9001);
        assert_eq!(addr.to_socket_addr().unwrap().port(), 9001);
    }

    #[test]
    fn starter_id_is_global_minimum() {
        let mut neighbors = BTreeMap::new();
        neighbors.insert(2, NodeAddress::new("127.0.0.1", 9002));
        neighbors.insert(4, NodeAddress::new("127.0.0.1", 9004));

        let topology = Topology::new(
            3,
            NodeAddress::new("127.0.0.1", 9003),
            neighbors,
            node_ids(&[1, 2, 3, 4]),
        )
        .unwrap();

        assert_eq!(topology.starter_id(), 1);
        assert_eq!(topology.node_count(), 4);
    }
}
