use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Context;

#[derive(Parser)]
#[command(name = "skyaway", version, about = "Skyaway coin giveaway CLI")]
struct Cli {
    /// Config file (defaults to ~/.config/skyaway/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until Ctrl+C
    Run,
    /// Event lifecycle
    Event {
        #[command(subcommand)]
        action: commands::event::EventAction,
    },
    /// User directory
    User {
        #[command(subcommand)]
        action: commands::user::UserAction,
    },
    /// Claim coins in the running event
    Claim {
        #[command(subcommand)]
        action: commands::claim::ClaimAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match Context::load(cli.config) {
        Ok(ctx) => {
            init_tracing(&ctx.config.log.level);
            match cli.command {
                Commands::Run => commands::run::run(&ctx).await,
                Commands::Event { action } => commands::event::run(action, &ctx).await,
                Commands::User { action } => commands::user::run(action, &ctx),
                Commands::Claim { action } => commands::claim::run(action, &ctx).await,
                Commands::Config { action } => commands::config::run(action, ctx),
            }
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
