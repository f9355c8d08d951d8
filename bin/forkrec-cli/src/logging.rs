//! Logging configuration for the forkrec CLI tool.
//!
//! Provides CLI arguments for configuring tracing/logging output with support for:
//! - Verbosity levels via `-v/-vv/-vvv` flags
//! - Custom log filters via `RUST_LOG` environment variable
//! - Colorful console output via `--log.no-color` flag

use clap::Parser;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration arguments.
#[derive(Debug, Clone, Default, Parser)]
#[command(next_help_heading = "Logging")]
pub struct LogArgs {
    /// Increase logging verbosity (-v = error, -vv = warn, -vvv = info, -vvvv = debug, -vvvvv =
    /// trace)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable colorful console logging.
    #[arg(long = "log.no-color", visible_aliases = ["log-no-color"], global = true)]
    pub log_no_color: bool,
}

impl LogArgs {
    /// Initialize the tracing subscriber based on the logging configuration.
    ///
    /// The log level is determined in the following order of precedence:
    /// 1. `RUST_LOG` environment variable (if set)
    /// 2. `-v` flags (increases from ERROR to WARN/INFO/DEBUG/TRACE)
    /// 3. Default is no logging (OFF)
    ///
    /// Log target is only shown for DEBUG level and above.
    pub fn init(&self) {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            // Use RUST_LOG if set
            EnvFilter::from_default_env()
        } else if self.verbose == 0 {
            // No verbosity: no logs
            EnvFilter::new("off")
        } else {
            // Verbosity-based level
            let level = match self.verbose {
                1 => Level::ERROR,
                2 => Level::WARN,
                3 => Level::INFO,
                4 => Level::DEBUG,
                _ => Level::TRACE,
            };
            EnvFilter::new(format!("forkrec={level},forkrec_cli={level}"))
        };

        // Show target only for DEBUG level and above (verbose >= 4)
        let show_target = self.verbose >= 4;

        fmt()
            .with_env_filter(filter)
            .with_target(show_target)
            .with_writer(std::io::stderr)
            .with_ansi(!self.log_no_color)
            .init();
    }
}
