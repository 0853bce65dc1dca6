use std::path::PathBuf;
use std::process::ExitCode;

use cached_status::config::{load as load_settings, Settings};
use cached_status::newsletter::NewsletterStatusResolver;
use cached_status::telemetry;
use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "cached-status", version, about = "Cached newsletter status lookups")]
struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHED_STATUS_CONFIG_FILE", value_name = "PATH")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve the newsletter status for an email address.
    Lookup {
        email: String,
        /// Skip the cache and ask the subscriber API directly.
        #[arg(long)]
        force_fresh: bool,
    },
    /// Drop the cached status for an email address.
    Invalidate { email: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let settings = match load_settings(cli.config_file.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = telemetry::init(&settings.logging) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(cli.command, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let resolver =
        NewsletterStatusResolver::from_settings(&settings.cache, &settings.newsletter).await?;

    match command {
        Command::Lookup { email, force_fresh } => {
            let outcome = resolver.lookup(&email, force_fresh).await?;
            println!("{email}: {} ({})", outcome.value(), outcome.kind());
            resolver.settle().await;
        }
        Command::Invalidate { email } => {
            let removed = resolver.forget(&email).await?;
            println!(
                "{email}: {}",
                if removed { "invalidated" } else { "not cached" }
            );
        }
    }

    Ok(())
}
