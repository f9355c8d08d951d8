//! `forkrec` CLI: record scripted wallet calls against an ephemeral fork.

use clap::Parser;

mod cmd;
pub use cmd::*;

mod logging;
pub use logging::*;

mod diff;
mod record;

/// Top-level CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "forkrec", version, infer_subcommands = true)]
pub struct Cli {
    /// Logging configuration.
    #[command(flatten)]
    pub log: LogArgs,

    /// Subcommand to run.
    #[command(subcommand)]
    pub cmd: MainCmd,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    cli.log.init();
    cli.cmd.run().await.inspect_err(|e| eprintln!("{e}"))
}
