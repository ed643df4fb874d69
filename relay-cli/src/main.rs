//! relay CLI: runs the Telegram relay. Config from env and optional CLI args.

use anyhow::Result;
use clap::Parser;
use relay_cli::{run_relay, Cli, Commands, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { token } => {
            let config = RelayConfig::load(token)?;
            run_relay(config).await
        }
    }
}
