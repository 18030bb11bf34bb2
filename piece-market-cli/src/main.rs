//! Piece Market CLI - audit and maintenance of a node's piece storage
//!
//! Provides command-line access to the piece metadata index and storage.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use piece_market_core::MarketConfig;
use piece_market_core::config::expand_home;
use piece_market_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piece-market")]
#[command(about = "Inspect and maintain the pieces stored by a market node")]
struct Cli {
    /// Node home directory (overrides PIECE_MARKET_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MarketConfig::from_env().context("invalid environment configuration")?;
    if let Some(home) = cli.home {
        config.home = expand_home(&home.to_string_lossy());
    }

    init_tracing(cli.log_level.as_tracing_level(), &config.home.join("logs"))
        .context("failed to initialize logging")?;

    if let Err(e) = commands::handle_command(cli.command, &config).await {
        if e.is_user_error() {
            eprintln!("{}", e.user_message());
            std::process::exit(2);
        }
        return Err(anyhow::Error::new(e).context("command failed"));
    }
    Ok(())
}
