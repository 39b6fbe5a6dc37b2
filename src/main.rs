use anyhow::Result;
use clap::Parser;

use incant::cli::{Cli, Commands};
use incant::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    logging::init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Run(args) => commands::run::run(&args).await,
        Commands::List(args) => commands::list::run(&args),
        Commands::Show(args) => commands::show::run(&args),
        Commands::Invalidate(args) => commands::invalidate::run(&args),
        Commands::Clear(args) => commands::clear::run(&args),
    }
}
