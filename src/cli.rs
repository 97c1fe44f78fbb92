//! Command line definition for the `conda-stream` binary.

use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "conda-stream",
    version,
    about = "Run conda commands with streaming progress, locally or through a relay"
)]
pub struct Cli {
    /// Config file (default: ~/.config/conda-stream/config.toml)
    #[arg(long, global = true, env = "CONDA_STREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// conda executable to spawn
    #[arg(long, global = true, env = "CONDA_STREAM_CONDA")]
    pub conda: Option<String>,

    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one conda subcommand and print its JSON result
    Run(RunArgs),
    /// Relay calls from WebSocket clients to the local conda
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// conda subcommand (install, create, info, ...)
    pub subcommand: String,

    /// Flag as camelCase key, optionally with a JSON or plain value
    /// (-f name=myenv, -f dryRun, -f channel='["conda-forge"]')
    #[arg(short = 'f', long = "flag", value_name = "KEY[=VALUE]")]
    pub flags: Vec<String>,

    /// Run through a relay instead of spawning conda
    #[arg(long)]
    pub channel: bool,

    /// Relay URL for --channel
    #[arg(long, env = "CONDA_STREAM_CHANNEL_URL")]
    pub channel_url: Option<String>,

    /// Cancel the call after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Do not request or render progress
    #[arg(long)]
    pub no_progress: bool,

    /// Positional arguments passed to conda
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub positional: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "CONDA_STREAM_BIND")]
    pub bind: Option<String>,
}

/// `key` -> `true`, `key=<json>` -> that JSON, `key=<text>` -> string.
pub fn parse_flag(raw: &str) -> (String, Value) {
    match raw.split_once('=') {
        None => (raw.to_string(), Value::Bool(true)),
        Some((key, value)) => {
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
            (key.to_string(), value)
        }
    }
}
