//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// credsync - credential lifecycle scheduling engine
///
/// Inspect the engine's configuration and the horizons and cache keys it
/// computes.
#[derive(Parser, Debug)]
#[command(name = "credsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CREDSYNC_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Compute requeue horizons for a lease or rotation
    Horizon(HorizonArgs),

    /// Compute a client cache key
    CacheKey(CacheKeyArgs),
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for the horizon command
#[derive(Parser, Debug)]
pub struct HorizonArgs {
    /// Lease duration or rotation TTL (e.g. 1h, 90s)
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub duration: std::time::Duration,

    /// Renewal percentage; defaults to the configured value
    #[arg(short, long)]
    pub renewal_percent: Option<i32>,

    /// Treat the duration as a static credential rotation TTL
    #[arg(long = "static")]
    pub static_creds: bool,

    /// Seed the jitter source
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of samples to draw
    #[arg(short = 'n', long, default_value_t = 1)]
    pub samples: u32,
}

/// Arguments for the cache-key command
#[derive(Parser, Debug)]
pub struct CacheKeyArgs {
    /// Authentication method (e.g. kubernetes, approle)
    #[arg(short, long)]
    pub method: String,

    /// Authentication configuration as JSON
    #[arg(long = "auth-config", default_value = "{}")]
    pub auth_config: String,

    /// Logical namespace on the credential source
    #[arg(short, long)]
    pub namespace: Option<String>,
}
