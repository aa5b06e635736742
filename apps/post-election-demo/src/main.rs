//! Minimal post-election application layer (§6 "Post-election application
//! layer", supplemented from `original_source/lib/device.py`'s handshake):
//! once the leader is known, every non-leader dials the leader's
//! `application_port` and exchanges a one-line greeting; the leader accepts
//! one connection per other node and echoes what it receives.
//!
//! This is intentionally small -- it exists to demonstrate the
//! `ElectionNode::await_result()` seam an outer application layer consumes,
//! not to build out a real application protocol.
mod topology;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{bail, WrapErr};
use tracing::{info, warn};

use election_core::{ElectionNode, TopologyProvider};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Key into the topology file's `nodes` map identifying this process.
    node_name: String,

    /// Path to the JSON topology file (§6's schema).
    #[arg(long, default_value = "topology.json")]
    topology: PathBuf,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let topology::DemoTopology { provider, application_addresses } =
        topology::load(&args.topology, &args.node_name).wrap_err("failed to load topology")?;
    let self_id = provider.self_id();

    let node = ElectionNode::new(Arc::new(provider)).wrap_err("failed to construct election node")?;
    node.start().wrap_err("failed to start election node")?;

    let leader = node.await_result().wrap_err("election did not converge")?;
    info!(self_id, leader, "election finished, entering post-election handshake");

    if leader == self_id {
        let (host, port) = application_addresses
            .get(&self_id)
            .cloned()
            .ok_or_else(|| eyre::eyre!("no application_port recorded for self ({self_id})"))?;
        serve_as_leader(&host, port, self_id)
    } else {
        let (host, port) = application_addresses
            .get(&leader)
            .cloned()
            .ok_or_else(|| eyre::eyre!("no application_port recorded for leader ({leader})"))?;
        greet_leader(&host, port, self_id)
    }
}

/// The leader accepts one connection, reads one greeting line, and echoes it
/// back -- mirroring `lib/device.py`'s simple handshake without any of the
/// original's domain logic.
fn serve_as_leader(host: &str, port: u16, self_id: i64) -> eyre::Result<()> {
    let listener = TcpListener::bind((host, port))
        .wrap_err_with(|| format!("failed to bind application port {host}:{port}"))?;
    info!(self_id, %host, port, "leader listening for post-election greetings");

    let (mut stream, peer_addr) = listener.accept().wrap_err("failed to accept a post-election connection")?;
    let mut reader = BufReader::new(stream.try_clone().wrap_err("failed to clone accepted stream")?);
    let mut line = String::new();
    reader.read_line(&mut line).wrap_err("failed to read greeting")?;
    let greeting = line.trim_end();
    info!(%peer_addr, greeting, "received post-election greeting");

    writeln!(stream, "{greeting}").wrap_err("failed to echo greeting")?;
    Ok(())
}

/// A non-leader dials the leader and sends a greeting identifying itself.
fn greet_leader(host: &str, port: u16, self_id: i64) -> eyre::Result<()> {
    let mut stream = TcpStream::connect((host, port))
        .wrap_err_with(|| format!("failed to dial leader's application port {host}:{port}"))?;
    writeln!(stream, "hello from {self_id}").wrap_err("failed to send greeting")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).wrap_err("failed to read echoed greeting")?;
    let echoed = line.trim_end();

    if echoed != format!("hello from {self_id}") {
        warn!(echoed, "leader echoed back something unexpected");
        bail!("unexpected echo from leader: {echoed:?}");
    }

    info!(self_id, echoed, "leader echoed our greeting back");
    Ok(())
}
