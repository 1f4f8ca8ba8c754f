//! CLI entry point for Cairn.
//!
//! This binary provides the `cairn` command: `run` boots the server and
//! supervises it until Ctrl-C, `check-config` validates a configuration
//! file.

mod cli;
mod helpers;

use anyhow::{Context, Result};
use cairn_kernel::CancellationToken;
use cairn_server::{Server, ServerConfig};
use clap::Parser;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, ConfigArgs};
use crate::helpers::init_tracing;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::CheckConfig(args) => cmd_check_config(args),
    }
}

fn load_config(args: &ConfigArgs) -> Result<ServerConfig> {
    ServerConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(args: ConfigArgs) -> Result<()> {
    let config = load_config(&args)?;
    init_tracing(&config.log.level, args.log_json);
    info!(config = %args.config.display(), "starting cairn");

    let mut server = Server::new(config);
    server.init().context("failed to initialize server")?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    token.cancel();
                }
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
            }
        });
    }

    server.listen(&token).await.context("server terminated with a fault")?;
    info!("cairn stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(&args)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("# effective configuration ({})", args.config.display());
    println!("{rendered}");
    Ok(())
}
