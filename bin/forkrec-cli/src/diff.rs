//! Compute the normalized balance delta between two decimal values.

use clap::Parser;
use forkrec::balance_delta;

use crate::Error;

/// Compute the normalized balance delta between two values
#[derive(Parser, Debug)]
pub struct Cmd {
    /// Baseline balance (decimal string)
    #[arg(value_name = "BASELINE")]
    pub baseline: String,

    /// Fork balance (decimal string)
    #[arg(value_name = "FORK")]
    pub fork: String,

    /// Fractional digits both values are normalized to before subtracting
    #[arg(long = "precision", default_value_t = 18)]
    pub precision: u32,
}

impl Cmd {
    /// Execute the diff command
    pub fn run(&self) -> Result<(), Error> {
        let delta = balance_delta(&self.baseline, &self.fork, self.precision)?;
        println!("{delta}");
        Ok(())
    }
}
