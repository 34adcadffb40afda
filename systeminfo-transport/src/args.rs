//! CLI argument parsing for the host binary.

use std::path::PathBuf;

use clap::Parser;

/// Host for the system information transport.
#[derive(Parser, Debug, Clone)]
#[command(about = "Samples host OS metrics and emits one JSON record per tick")]
pub struct HostArgs {
    /// Path to configuration file.
    #[arg(short, long, default_value = "systeminfo.json5")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}
