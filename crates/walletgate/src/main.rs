use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;

use gatecore::core::{config, init_logger};
use gatecore::storage::create_pool;
use walletgate::cli::{Cli, Commands};
use walletgate::webapp::run_webapp_server;

/// Main entry point for the wallet API server
///
/// Parses CLI arguments and dispatches to the appropriate subcommand.
///
/// # Errors
/// Returns an error if initialization fails (logging, database, missing bot token).
#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Log panics instead of terminating silently
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
        if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            log::error!("Panic message: {}", msg);
        }
    }));

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH)?;

    // Load environment variables from .env if present
    let _ = dotenv();

    match cli.command {
        Some(Commands::Serve { port }) => run_server(port).await,
        None => {
            // No command specified - default to serving
            log::info!("No command specified, starting API server in default mode");
            run_server(None).await
        }
    }
}

async fn run_server(port: Option<u16>) -> Result<()> {
    let bot_token = config::BOT_TOKEN.to_string();
    if bot_token.is_empty() {
        return Err(anyhow::anyhow!("BOT_TOKEN environment variable not set"));
    }

    let db_pool = Arc::new(
        create_pool(&config::DATABASE_PATH)
            .map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?,
    );

    let port = port.unwrap_or(*config::WEBAPP_PORT);
    run_webapp_server(port, db_pool, bot_token).await
}
