use std::sync::Arc;

use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::{filter::Targets, prelude::*, EnvFilter};

use election_core::ElectionNode;

use crate::{cli::arguments, config::topology};

/// Initialize the tracing subscriber for a `launch` run: per-target level
/// filtering composed with `RUST_LOG`, the same `Targets` + `EnvFilter`
/// layering as `apps/node/src/cli/actions.rs`'s subscriber, just without the
/// hand-rolled formatting layer since this binary has no legacy log format to
/// preserve.
fn init_tracing(verbosity: tracing::Level) -> eyre::Result<()> {
    let targets = Targets::new()
        .with_target("election_core", verbosity)
        .with_target("electiond", verbosity)
        .with_default(verbosity);

    let env_filter = EnvFilter::builder()
        .with_default_directive(verbosity.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true).with_filter(targets))
        .with(env_filter)
        .try_init()
        .map_err(|err| eyre::eyre!("failed to install tracing subscriber: {err}"))
}

/// `launch <node_name> --topology <path>` (§6): run the election for
/// `node_name` to completion and print the elected leader's id to stdout.
///
/// Any fatal error -- malformed topology, a bind/dial failure, a closed
/// socket mid-protocol -- is reported via `eyre` and turns into a non-zero
/// process exit, matching §6/§7's documented CLI contract.
pub fn launch(args: arguments::Launch) -> eyre::Result<()> {
    init_tracing(args.verbosity)?;

    let provider = topology::load(&args.topology, &args.node_name)
        .wrap_err_with(|| format!("failed to load topology for node {:?}", args.node_name))?;

    let node = ElectionNode::new(Arc::new(provider)).wrap_err("failed to construct election node")?;
    node.start().wrap_err("failed to start election node")?;

    info!(
        node_name = %args.node_name,
        is_starter = node.is_starter(),
        "election started, awaiting result"
    );
    // The protocol is symmetric, so calling `initiate_election` is safe on
    // every node regardless of `is_starter()` -- it is only ever the
    // orchestration convenience of blocking on this node's own result.
    let leader = node
        .initiate_election(true)
        .wrap_err("election did not converge")?
        .expect("initiate_election(true) always returns a leader id");

    println!("{leader}");
    Ok(())
}
