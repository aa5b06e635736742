//! The one piece of configuration this system has (§6 of the protocol
//! spec): the JSON topology file. Loading and validating it lives here,
//! outside `election-core`, per §1's "JSON network-topology loading" being
//! an external collaborator.
pub mod topology;
