mod commands;
mod probe;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "emecef-pos",
    version,
    about = "e-MECeF POS certification agent with offline queue"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent: sync on interval and whenever connectivity returns
    Run,
    /// Certify an invoice now, falling back to the offline queue
    Submit {
        /// JSON file containing the invoice payload
        file: PathBuf,
    },
    /// Show pending and abandoned invoices
    List,
    /// Trigger a sync pass immediately
    Sync,
    /// Give abandoned invoices a fresh retry budget and sync them
    RetryAbandoned,
    /// Show cumulative sync statistics
    Stats {
        /// Reset the counters instead of showing them
        #[arg(long)]
        reset: bool,
    },
    /// Delete every pending invoice (operator action, not undoable)
    Clear,
    /// Show or update terminal settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set {
        /// Certification provider: "mock" or "dgi"
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        terminal_id: Option<String>,
    },
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Config { action } => commands::configure(action),
        Command::Run => commands::run(commands::App::build()?).await,
        Command::Submit { file } => commands::submit(commands::App::build()?, &file).await,
        Command::List => commands::list(commands::App::build()?),
        Command::Sync => commands::sync(commands::App::build()?).await,
        Command::RetryAbandoned => commands::retry_abandoned(commands::App::build()?).await,
        Command::Stats { reset } => commands::stats(commands::App::build()?, reset),
        Command::Clear => commands::clear(commands::App::build()?),
    }
}
