use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "walletgate")]
#[command(author, version, about = "Telegram wallet Mini App backend — auth and PIN lockout API", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server
    Serve {
        /// Port override (default: WEBAPP_PORT env var or 3000)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
