use std::path::PathBuf;

use clap::Parser;

/// Terminal chat against a local OpenAI-compatible inference server.
///
/// Logs go to stderr (`RUST_LOG` filters them); the conversation uses stdout.
#[derive(Parser, Debug)]
#[command(name = "murmur", version)]
pub struct Cli {
    /// Settings file to read instead of the one in the user config directory.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}
