//! Tree-based (IEEE 1394 style) distributed leader election over TCP.
//!
//! Given an acyclic communication graph known in advance to every
//! participant (a [`topology::Topology`]), [`facade::ElectionNode`]
//! cooperatively elects exactly one leader and causes every non-leader to
//! learn the leader's identity.
//!
//! Layering, leaves first: [`net`] is the framed-socket layer,
//! [`manager`] owns per-peer connections and dispatches inbound frames,
//! [`election`] is the protocol state machine, and [`facade`] is the thin
//! public API a caller actually drives.

pub mod election;
pub mod facade;
pub mod manager;
pub mod net;
pub mod topology;

pub use election::{Error as ElectionError, Kind};
pub use facade::{ElectionNode, Error};
pub use manager::ConnectionManager;
pub use topology::{Error as TopologyError, NodeAddress, Topology, TopologyProvider};
