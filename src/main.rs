mod cli;
mod engine;
mod metrics;
mod model;
mod orchestrator;
mod report;
mod store;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "particle_stage=debug"
        } else {
            "particle_stage=warn"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    init_tracing(args.verbose && !is_silent);

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success
            std::process::exit(0);
        }
        Err(e) => {
            if is_silent {
                println!("{:#}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
