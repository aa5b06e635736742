//! The election state machine (§4.3): message kinds, the driver loop, and
//! the message handler that mutates protocol state under a single lock.
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::topology::TopologyProvider;

/// Low end of the root-contention back-off range (§5): larger than a typical
/// loopback/LAN round-trip, so a rejected request has a real chance to
/// desynchronize from its peer's retry.
const BACKOFF_MIN_MS: u64 = 10;
/// High end of the back-off range (§5).
const BACKOFF_MAX_MS: u64 = 100;

/// Wire-level message kinds (§4.3, closed set). `ERROR` is folded into
/// [`Kind::Reject`] at the handler: both are treated identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ParentRequest,
    ParentAck,
    ParentReject,
    LeaderAnnouncement,
    Error,
}

/// The wire tokens from §6's grammar, as a small namespace of constants
/// rather than a process-wide singleton (§9 "global state avoidance").
pub mod wire {
    pub const BE_MY_PARENT: &str = "be_my_parent";
    pub const YOU_ARE_MY_CHILD: &str = "you_are_my_child";
    pub const YOU_ARE_NOT_MY_CHILD: &str = "you_are_not_my_child";
    pub const LEADER_ANNOUNCEMENT: &str = "leader_announcement";
    pub const ERROR: &str = "error";
}

impl Kind {
    pub fn as_wire(self) -> &'static str {
        match self {
            Kind::ParentRequest => wire::BE_MY_PARENT,
            Kind::ParentAck => wire::YOU_ARE_MY_CHILD,
            Kind::ParentReject => wire::YOU_ARE_NOT_MY_CHILD,
            Kind::LeaderAnnouncement => wire::LEADER_ANNOUNCEMENT,
            Kind::Error => wire::ERROR,
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            wire::BE_MY_PARENT => Kind::ParentRequest,
            wire::YOU_ARE_MY_CHILD => Kind::ParentAck,
            wire::YOU_ARE_NOT_MY_CHILD => Kind::ParentReject,
            wire::LEADER_ANNOUNCEMENT => Kind::LeaderAnnouncement,
            wire::ERROR => Kind::Error,
            _ => return None,
        })
    }
}

/// Errors surfaced by the election logic itself, as opposed to the
/// transport it rides on (`crate::manager::Error`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A reader saw a frame whose `kind` isn't in the closed set of §4.3.
    /// Isolated to the offending peer's reader thread (§7); never fatal.
    #[error("unrecognized message kind {0:?}")]
    Protocol(String),

    /// A send the driver cannot make progress without (the initial
    /// `PARENT_REQUEST`, or this node's own `LEADER_ANNOUNCEMENT`) failed.
    /// Surfaced to `await_result` callers per §7's "core surfaces fatal
    /// errors to the facade caller".
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

/// The narrow capability the election logic uses to reach the transport,
/// resolving the cyclic ownership between the connection manager and the
/// state machine (§9): `ConnectionManager` implements this; the election
/// logic never sees a socket or a peer map directly.
pub trait FrameSender: Send + Sync {
    fn send(&self, peer_id: i64, kind: Kind, payload: i64) -> Result<(), crate::manager::Error>;
    fn shutdown(&self);
}

/// The narrow capability the transport uses to reach the election logic
/// (§9): reader threads call this, never touching `ElectionState` directly.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, peer_id: i64, kind: Kind, payload: i64);
}

/// Protocol state (§3), guarded by a single coarse lock as required by §5.
struct Inner {
    possible_parents: BTreeSet<i64>,
    children: BTreeSet<i64>,
    leader_id: Option<i64>,
    done: bool,
    awaiting: Option<i64>,
    last_parent_response: Option<bool>,
    fatal: Option<Error>,
}

/// The election state machine for a single node (§4.3).
///
/// One instance per process. `Mutex<Inner>` plus three condition variables
/// implement the four suspension points of §5: `able_to_request_parent`
/// (driver waiting to be allowed to send its request), `parent_response`
/// (driver waiting for an ack/reject to its outstanding request),
/// `leader_decided` (the facade caller blocked in `await_result`).
pub struct Election {
    self_id: i64,
    is_leaf: bool,
    inner: Mutex<Inner>,
    able_to_request_parent: Condvar,
    parent_response: Condvar,
    leader_decided: Condvar,
    sender: Arc<dyn FrameSender>,
}

impl Election {
    pub fn new(topology: &dyn TopologyProvider, sender: Arc<dyn FrameSender>) -> Arc<Self> {
        let possible_parents: BTreeSet<i64> = topology.neighbors().keys().copied().collect();
        let is_leaf = possible_parents.len() == 1;

        Arc::new(Self {
            self_id: topology.self_id(),
            is_leaf,
            inner: Mutex::new(Inner {
                possible_parents,
                children: BTreeSet::new(),
                leader_id: None,
                done: false,
                awaiting: None,
                last_parent_response: None,
                fatal: None,
            }),
            able_to_request_parent: Condvar::new(),
            parent_response: Condvar::new(),
            leader_decided: Condvar::new(),
            sender,
        })
    }

    /// Snapshot of the neighbors this node has accepted as children (§3),
    /// once the election has settled enough to answer meaningfully. Exposed
    /// so tests (and any embedding caller) can check edge orientation
    /// against the elected leader instead of only the leader id itself.
    pub fn children(&self) -> BTreeSet<i64> {
        self.inner.lock().unwrap().children.clone()
    }

    /// Block until this node knows the leader, or a fatal transport error
    /// makes that impossible (§7).
    pub fn await_result(&self) -> Result<i64, Error> {
        let mut inner = self.inner.lock().unwrap();
        while inner.leader_id.is_none() && inner.fatal.is_none() {
            inner = self.leader_decided.wait(inner).unwrap();
        }
        match (inner.leader_id, inner.fatal.clone()) {
            (Some(id), _) => Ok(id),
            (None, Some(err)) => Err(err),
            (None, None) => unreachable!("woke with neither a leader nor a fatal error"),
        }
    }

    /// The driver thread's main loop (§4.3's pseudocode, verbatim).
    pub fn run_driver(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !(self.is_leaf || inner.possible_parents.len() <= 1) {
            inner = self.able_to_request_parent.wait(inner).unwrap();
        }

        loop {
            if inner.possible_parents.is_empty() {
                inner.leader_id = Some(self.self_id);
                inner.done = true;
                let children: Vec<i64> = inner.children.iter().copied().collect();
                drop(inner);

                info!(self_id = self.self_id, "no remaining possible parents, declaring self leader");
                for child in children {
                    if let Err(err) = self.sender.send(child, Kind::LeaderAnnouncement, self.self_id) {
                        warn!(self_id = self.self_id, child, %err, "failed to forward leader announcement to child");
                    }
                }
                self.leader_decided.notify_all();
                self.sender.shutdown();
                return;
            }

            let parent = *inner.possible_parents.iter().next().unwrap();
            inner.awaiting = Some(parent);
            drop(inner);

            debug!(self_id = self.self_id, parent, "sending parent request");
            if let Err(err) = self.sender.send(parent, Kind::ParentRequest, self.self_id) {
                let mut locked = self.inner.lock().unwrap();
                locked.fatal = Some(Error::Fatal(err.to_string()));
                drop(locked);
                self.leader_decided.notify_all();
                return;
            }

            inner = self.inner.lock().unwrap();
            while inner.last_parent_response.is_none() {
                inner = self.parent_response.wait(inner).unwrap();
            }
            let accepted = inner.last_parent_response.take().unwrap();
            inner.awaiting = None;

            if accepted {
                inner.done = true;
                debug!(self_id = self.self_id, parent, "parent request accepted");
                drop(inner);
                return;
            }

            debug!(self_id = self.self_id, parent, "parent request rejected, backing off");
            drop(inner);
            std::thread::sleep(backoff());
            inner = self.inner.lock().unwrap();
        }
    }

    fn on_parent_request(&self, from: i64) {
        let mut inner = self.inner.lock().unwrap();

        if inner.awaiting == Some(from) {
            // Root contention (§4.3): we have an outstanding request to
            // `from` and `from` is simultaneously requesting from us.
            // Reject the incoming request and unblock our own driver so it
            // backs off and retries.
            inner.last_parent_response = Some(false);
            inner.awaiting = None;
            drop(inner);

            info!(self_id = self.self_id, peer = from, "root contention detected, rejecting and retrying");
            if let Err(err) = self.sender.send(from, Kind::Error, self.self_id) {
                warn!(self_id = self.self_id, peer = from, %err, "failed to send contention rejection");
            }
            self.parent_response.notify_all();
            return;
        }

        if inner.possible_parents.remove(&from) {
            inner.children.insert(from);
            let now_ready = inner.possible_parents.len() <= 1;
            drop(inner);

            debug!(self_id = self.self_id, child = from, "accepted parent request");
            if let Err(err) = self.sender.send(from, Kind::ParentAck, self.self_id) {
                warn!(self_id = self.self_id, child = from, %err, "failed to ack parent request");
            }
            if now_ready {
                self.able_to_request_parent.notify_all();
            }
            return;
        }

        drop(inner);
        debug!(self_id = self.self_id, peer = from, "rejecting parent request (already resolved)");
        if let Err(err) = self.sender.send(from, Kind::Error, self.self_id) {
            warn!(self_id = self.self_id, peer = from, %err, "failed to reject parent request");
        }
    }

    fn on_parent_response(&self, accepted: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_parent_response = Some(accepted);
        drop(inner);
        self.parent_response.notify_all();
    }

    fn on_leader_announcement(&self, leader: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.leader_id.is_some() {
            // Already know the leader (shouldn't happen on a tree, since
            // the flood follows parent/child edges with no cycles, but
            // guard against a duplicate/late announcement anyway).
            return;
        }
        inner.leader_id = Some(leader);
        inner.done = true;
        let children: Vec<i64> = inner.children.iter().copied().collect();
        drop(inner);

        info!(self_id = self.self_id, leader, "leader announced");
        for child in children {
            if let Err(err) = self.sender.send(child, Kind::LeaderAnnouncement, leader) {
                warn!(self_id = self.self_id, child, %err, "failed to forward leader announcement");
            }
        }
        self.leader_decided.notify_all();
        self.sender.shutdown();
    }
}

impl MessageHandler for Election {
    fn handle_message(&self, peer_id: i64, kind: Kind, payload: i64) {
        match kind {
            Kind::ParentRequest => self.on_parent_request(peer_id),
            Kind::ParentAck => self.on_parent_response(true),
            Kind::ParentReject | Kind::Error => self.on_parent_response(false),
            Kind::LeaderAnnouncement => self.on_leader_announcement(payload),
        }
    }
}

fn backoff() -> Duration {
    Duration::from_millis(fastrand::u64(BACKOFF_MIN_MS..=BACKOFF_MAX_MS))
}

/// A mock of the narrow sender capability, in the same shape as
/// `yuv-p2p`'s `client::handle::MockHandle` (`mockall::mock!` over a plain
/// trait, rather than `#[automock]`, since the trait lives in this module).
#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub FrameSender {}

    impl FrameSender for FrameSender {
        fn send(&self, peer_id: i64, kind: Kind, payload: i64) -> Result<(), crate::manager::Error>;
        fn shutdown(&self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeAddress;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: StdMutex<Vec<(i64, Kind, i64)>>,
        shutdown_called: StdMutex<bool>,
    }

    impl FrameSender for RecordingSender {
        fn send(&self, peer_id: i64, kind: Kind, payload: i64) -> Result<(), crate::manager::Error> {
            self.sent.lock().unwrap().push((peer_id, kind, payload));
            Ok(())
        }

        fn shutdown(&self) {
            *self.shutdown_called.lock().unwrap() = true;
        }
    }

    struct FakeTopology {
        self_id: i64,
        neighbors: BTreeMap<i64, NodeAddress>,
    }

    impl TopologyProvider for FakeTopology {
        fn self_id(&self) -> i64 {
            self.self_id
        }
        fn self_address(&self) -> NodeAddress {
            NodeAddress::new("127.0.0.1", 0)
        }
        fn neighbors(&self) -> &BTreeMap<i64, NodeAddress> {
            &self.neighbors
        }
        fn starter_id(&self) -> i64 {
            self.self_id
        }
        fn node_count(&self) -> usize {
            self.neighbors.len() + 1
        }
    }

    fn topology(self_id: i64, neighbor_ids: &[i64]) -> FakeTopology {
        let neighbors = neighbor_ids
            .iter()
            .map(|id| (*id, NodeAddress::new("127.0.0.1", 0)))
            .collect();
        FakeTopology { self_id, neighbors }
    }

    #[test]
    fn kind_round_trips_through_wire_encoding() {
        for kind in [
            Kind::ParentRequest,
            Kind::ParentAck,
            Kind::ParentReject,
            Kind::LeaderAnnouncement,
            Kind::Error,
        ] {
            assert_eq!(Kind::from_wire(kind.as_wire()), Some(kind));
        }
        assert_eq!(Kind::from_wire("not_a_kind"), None);
    }

    #[test]
    fn accepting_last_possible_parent_signals_request_condition() {
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(2, &[1, 3]);
        let election = Election::new(&topo, sender.clone());

        election.handle_message(1, Kind::ParentRequest, 1);
        {
            let inner = election.inner.lock().unwrap();
            assert_eq!(inner.children, BTreeSet::from([1]));
            assert_eq!(inner.possible_parents, BTreeSet::from([3]));
        }
        assert_eq!(sender.sent.lock().unwrap().last(), Some(&(1, Kind::ParentAck, 2)));

        election.handle_message(3, Kind::ParentRequest, 3);
        {
            let inner = election.inner.lock().unwrap();
            assert!(inner.possible_parents.is_empty());
            assert_eq!(inner.children, BTreeSet::from([1, 3]));
        }
    }

    #[test]
    fn leader_announcement_forwards_to_children_and_sets_leader_once() {
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(4, &[1, 2, 3]);
        let election = Election::new(&topo, sender.clone());

        {
            let mut inner = election.inner.lock().unwrap();
            inner.children = BTreeSet::from([1, 2]);
        }

        election.handle_message(99, Kind::LeaderAnnouncement, 4);
        assert_eq!(election.await_result().unwrap(), 4);
        assert!(*sender.shutdown_called.lock().unwrap());
        let sent = sender.sent.lock().unwrap();
        assert!(sent.contains(&(1, Kind::LeaderAnnouncement, 4)));
        assert!(sent.contains(&(2, Kind::LeaderAnnouncement, 4)));

        // A second announcement must not re-fire the flood or overwrite leader_id.
        let sent_len_before = sent.len();
        drop(sent);
        election.handle_message(99, Kind::LeaderAnnouncement, 7);
        assert_eq!(election.await_result().unwrap(), 4);
        assert_eq!(sender.sent.lock().unwrap().len(), sent_len_before);
    }

    #[test]
    fn root_contention_rejects_and_unblocks_awaiting_peer() {
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(1, &[2]);
        let election = Election::new(&topo, sender.clone());

        {
            let mut inner = election.inner.lock().unwrap();
            inner.awaiting = Some(2);
        }

        election.handle_message(2, Kind::ParentRequest, 2);

        let inner = election.inner.lock().unwrap();
        assert_eq!(inner.awaiting, None);
        assert_eq!(inner.last_parent_response, Some(false));
        drop(inner);
        assert_eq!(sender.sent.lock().unwrap().last(), Some(&(2, Kind::Error, 1)));
    }

    #[test]
    fn unrelated_parent_request_is_rejected() {
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(1, &[2]);
        let election = Election::new(&topo, sender.clone());

        // 5 is not a neighbor: possible_parents.remove(&5) is a no-op.
        election.handle_message(5, Kind::ParentRequest, 5);
        assert_eq!(sender.sent.lock().unwrap().last(), Some(&(5, Kind::Error, 1)));
    }

    #[test]
    fn single_node_topology_is_immediately_its_own_leader() {
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(1, &[]);
        let election = Election::new(&topo, sender);
        election.run_driver();
        assert_eq!(election.await_result().unwrap(), 1);
    }

    #[test]
    fn declaring_self_leader_shuts_down_the_transport() {
        // A node whose `possible_parents` empties out declares itself leader
        // without ever receiving a `LEADER_ANNOUNCEMENT` (it sends one
        // instead), so it must call `shutdown()` itself -- otherwise its
        // acceptor/reader threads would run forever.
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(1, &[]);
        let election = Election::new(&topo, sender.clone());
        election.run_driver();

        assert_eq!(election.await_result().unwrap(), 1);
        assert!(*sender.shutdown_called.lock().unwrap());
    }

    #[test]
    fn fatal_send_error_surfaces_from_await_result() {
        let mut mock = MockFrameSender::new();
        mock.expect_send()
            .returning(|_, _, _| Err(crate::manager::Error::NoChannel(9)));
        let sender: Arc<dyn FrameSender> = Arc::new(mock);

        let topo = topology(1, &[9]);
        let election = Election::new(&topo, sender);
        election.run_driver();

        let err = election.await_result().unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[quickcheck_macros::quickcheck]
    fn possible_parents_is_monotone_non_increasing(requests: Vec<u8>) -> bool {
        const NEIGHBORS: u8 = 5;
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(100, &(1..=NEIGHBORS as i64).collect::<Vec<_>>());
        let election = Election::new(&topo, sender);

        let mut prev_len = election.inner.lock().unwrap().possible_parents.len();
        for r in requests {
            let peer = (r % NEIGHBORS) as i64 + 1;
            election.handle_message(peer, Kind::ParentRequest, peer);
            let len = election.inner.lock().unwrap().possible_parents.len();
            if len > prev_len {
                return false;
            }
            prev_len = len;
        }
        true
    }

    #[quickcheck_macros::quickcheck]
    fn children_and_possible_parents_stay_disjoint(requests: Vec<u8>) -> bool {
        const NEIGHBORS: u8 = 5;
        let sender = Arc::new(RecordingSender::default());
        let topo = topology(100, &(1..=NEIGHBORS as i64).collect::<Vec<_>>());
        let election = Election::new(&topo, sender);

        for r in requests {
            let peer = (r % NEIGHBORS) as i64 + 1;
            election.handle_message(peer, Kind::ParentRequest, peer);
        }
        let inner = election.inner.lock().unwrap();
        inner.possible_parents.is_disjoint(&inner.children)
    }
}
