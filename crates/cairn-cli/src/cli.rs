//! CLI argument definitions for Cairn.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Cairn -- a multi-tenant storage server backend.
#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Cairn -- multi-tenant storage server",
    long_about = "Persists users and keys as identity-cached resources and supervises the \
                  key pool, resource managers, and protocol listener as one service tree."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the server and run until Ctrl-C.
    Run(ConfigArgs),

    /// Parse the configuration file and print the effective settings.
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "config/cairn.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines instead of the compact format.
    #[arg(long)]
    pub log_json: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_the_config_path() {
        let cli = Cli::try_parse_from(["cairn", "run"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("config/cairn.toml"));
                assert!(!args.log_json);
            }
            Commands::CheckConfig(_) => panic!("expected run"),
        }
    }

    #[test]
    fn check_config_takes_a_path() {
        let cli = Cli::try_parse_from(["cairn", "check-config", "--config", "/etc/cairn.toml"])
            .unwrap();
        match cli.command {
            Commands::CheckConfig(args) => {
                assert_eq!(args.config, PathBuf::from("/etc/cairn.toml"));
            }
            Commands::Run(_) => panic!("expected check-config"),
        }
    }
}
