mod catalog;
mod cli;
mod drive;
mod engine;
mod error;
mod metrics;
mod model;
mod orchestrator;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr; progress output has its own writer.
fn setup_tracing(args: &cli::Cli) {
    let level = if args.verbose {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::WARN
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_tracing(&args);
    let is_silent = args.silent;

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_silent {
                println!("{e:#}");
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
