//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;

/// Embedded Edge Agent - runs a WASM workflow bundle against an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "eea-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long, env = "EEA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not read console commands from stdin
    #[arg(long)]
    pub no_console: bool,
}
