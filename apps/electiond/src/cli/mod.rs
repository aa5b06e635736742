mod actions;
mod arguments;
use clap::Parser;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub enum Cli {
    /// Load a topology file and run one node's election to completion, see
    /// `launch --help` for more information.
    Launch(arguments::Launch),
}

impl Cli {
    pub fn exec(self) -> eyre::Result<()> {
        match self {
            Self::Launch(args) => actions::launch(args),
        }
    }
}

pub fn run() -> eyre::Result<()> {
    Cli::parse().exec()
}
