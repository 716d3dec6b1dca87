//! credsync - credential lifecycle scheduling engine
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use credsync::cli::args::{ConfigAction, ConfigArgs};
use credsync::cli::{Cli, Commands};
use credsync::config::{Config, ConfigManager};
use credsync::error::CredsyncResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CredsyncResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Init must work even when the existing file no longer parses
    let config = match &cli.command {
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Init { .. }),
        }) => Config::default(),
        _ => config_manager.load().await?,
    };

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using config at {}", config_manager.path().display());

    match cli.command {
        Commands::Config(args) => {
            credsync::cli::commands::config(args, &config_manager, &config).await
        }
        Commands::Horizon(args) => credsync::cli::commands::horizon(args, &config).await,
        Commands::CacheKey(args) => credsync::cli::commands::cache_key(args).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, format: &str) {
    let default = match verbose {
        0 => "credsync=warn",
        1 => "credsync=info",
        _ => "credsync=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
