//! The election facade (§4.4): the thin API a caller actually drives.
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::info;

use crate::election::{Election, Error as ElectionError, MessageHandler};
use crate::manager::{ConnectionManager, Error as ManagerError};
use crate::topology::{Error as TopologyError, TopologyProvider};

/// Errors that can abort startup or a running election, surfaced to the
/// facade caller per §7's error-handling policy.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Election(#[from] ElectionError),
}

/// One node's participation in the election (§1/§2).
///
/// `start()` brings up the connection manager and the driver thread;
/// `initiate_election()` is a symmetric-protocol convenience;
/// `await_result()` blocks until the leader is known.
pub struct ElectionNode {
    topology: Arc<dyn TopologyProvider>,
    manager: Arc<ConnectionManager>,
    election: Arc<Election>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ElectionNode {
    pub fn new(topology: Arc<dyn TopologyProvider>) -> Result<Self, Error> {
        let neighbor_addrs = topology
            .neighbors()
            .iter()
            .map(|(&peer_id, addr)| Ok((peer_id, addr.to_socket_addr()?)))
            .collect::<Result<HashMap<_, _>, TopologyError>>()?;

        let manager = ConnectionManager::new(topology.self_id(), neighbor_addrs);
        let election = Election::new(topology.as_ref(), manager.clone());

        Ok(Self {
            topology,
            manager,
            election,
            driver: Mutex::new(None),
        })
    }

    /// Start the acceptor and the election driver thread (§2, §5). Neighbors
    /// are not dialed here: the manager dials each one lazily, right before
    /// the first frame addressed to it, so this node's start-up never races
    /// a neighbor's listener coming up.
    pub fn start(&self) -> Result<(), Error> {
        let self_addr = self.topology.self_address().to_socket_addr()?;
        let handler: Arc<dyn MessageHandler> = self.election.clone();
        self.manager.start(self_addr, handler)?;

        info!(
            self_id = self.topology.self_id(),
            neighbors = self.topology.neighbors().len(),
            "election node started"
        );

        let election = self.election.clone();
        let self_id = self.topology.self_id();
        let handle = thread::Builder::new()
            .name(format!("election-driver-{self_id}"))
            .spawn(move || election.run_driver())
            .expect("failed to spawn election driver thread");
        *self.driver.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// A no-op at the protocol level: the protocol is symmetric, and every
    /// node's driver thread already begins requesting parenthood as soon as
    /// it is allowed to (§4.4). Kept only as an orchestration convenience
    /// for callers that want to block on the result from the same call that
    /// "starts" the election for this node.
    pub fn initiate_election(&self, block: bool) -> Result<Option<i64>, ElectionError> {
        if block {
            Ok(Some(self.await_result()?))
        } else {
            Ok(None)
        }
    }

    /// Block until `leader_id` is known (§4.4).
    pub fn await_result(&self) -> Result<i64, ElectionError> {
        self.election.await_result()
    }

    /// The neighbors this node has accepted as children (§3's "edge
    /// orientation"). Meaningful once the election has progressed; a node
    /// still waiting on `possible_parents` may report an incomplete set.
    pub fn children(&self) -> BTreeSet<i64> {
        self.election.children()
    }

    /// Whether this node is the distinguished "election starter" (the
    /// minimum node id across the whole topology, §6/§9) -- vestigial per
    /// §9, since the protocol is symmetric, but exposed for callers that
    /// want to mirror the original orchestration.
    pub fn is_starter(&self) -> bool {
        self.topology.self_id() == self.topology.starter_id()
    }
}
