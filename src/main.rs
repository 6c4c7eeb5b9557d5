mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use fetchd::config::Config;
use fetchd::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Server(args) => {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            server::run(config).await?;
        }
    }

    Ok(())
}
