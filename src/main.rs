use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lumishot::config::Config;
use lumishot::credits::CreditStore;

#[derive(Parser)]
#[command(name = "lumishot", version, about = "Credit-metered AI headshot backend")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Bind host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or adjust the credit ledger.
    Credits {
        #[command(subcommand)]
        command: CreditsCommand,
    },
}

#[derive(Subcommand)]
enum CreditsCommand {
    /// Show a user's balance (recovers pending credits first).
    Show { user_id: String },
    /// Reset a user to the daily baseline.
    Reset { user_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumishot=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            lumishot::gateway::run_gateway(&host, port, &config).await
        }
        Command::Credits { command } => {
            let store = CreditStore::open(&config.storage.db_path)?;
            let record = match command {
                CreditsCommand::Show { user_id } => store.balance(&user_id)?,
                CreditsCommand::Reset { user_id } => store.reset(&user_id)?,
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}
