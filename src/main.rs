//! Unified trojan-adapter CLI.
//!
//! - `trojan-adapter probe` - Dial a target through an endpoint
//! - `trojan-adapter hash` - Print the header token for a password

use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// Trojan outbound adapter CLI.
#[derive(Parser)]
#[command(
    name = "trojan-adapter",
    version,
    about = "Trojan outbound connection adapter",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial a target through the configured endpoint and print the reply.
    #[command(name = "probe")]
    Probe(Box<trojan_outbound::ProbeArgs>),

    /// Print the 56-character header token for a password.
    #[command(name = "hash")]
    Hash(trojan_outbound::HashArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Probe(args) => trojan_outbound::cli::run(*args).await,
        Commands::Hash(args) => {
            trojan_outbound::cli::run_hash(&args);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
