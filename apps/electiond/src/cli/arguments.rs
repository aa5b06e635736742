use std::path::PathBuf;

use clap::Args;
use tracing::Level;

/// `launch <node_name> --topology <path>` (§6 of the protocol spec): run the
/// election for the node named `node_name` in the topology file to
/// completion, then print the elected leader's id to stdout.
#[derive(Args)]
pub struct Launch {
    /// Key into the topology file's `nodes` map identifying this process.
    pub node_name: String,

    /// Path to the JSON topology file (§6's schema).
    #[arg(long, default_value = "topology.json")]
    pub topology: PathBuf,

    /// Tracing verbosity for this run.
    #[arg(long, default_value = "info")]
    pub verbosity: Level,
}
