use clap::Subcommand;

/// Main command enumeration for the forkrec CLI tool
#[derive(Subcommand, Debug)]
pub enum MainCmd {
    /// Record a scripted sequence of provider calls against a fresh fork
    Record(crate::record::Cmd),
    /// Compute the normalized balance delta between two values
    Diff(crate::diff::Cmd),
}

/// Error types for the main command system
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to read or parse the call script
    #[error("script error: {0}")]
    Script(String),
    /// File system error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Session lifecycle or ledger error
    #[error("{0}")]
    Router(#[from] forkrec::RouterError),
    /// A routed provider call failed
    #[error("{0}")]
    Rpc(#[from] forkrec::RpcError),
    /// Balance value could not be normalized
    #[error("{0}")]
    Balance(#[from] forkrec::BalanceError),
}

impl MainCmd {
    /// Execute the main command
    pub async fn run(&self) -> Result<(), Error> {
        match self {
            Self::Record(cmd) => cmd.run().await,
            Self::Diff(cmd) => cmd.run(),
        }
    }
}
