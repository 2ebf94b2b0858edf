//! Command-line interface.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config;

#[derive(Parser)]
#[command(name = "kaiwa", version, about = "Real-time voice conversation server")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signalling server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1", env = "KAIWA_HOST")]
        host: String,
        /// Port to bind
        #[arg(long, default_value_t = 8080, env = "KAIWA_PORT")]
        port: u16,
        /// TLS certificate file (development only; both --cert and
        /// --key must be given)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        /// TLS private key file
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            host,
            port,
            cert,
            key,
        } => crate::server::start(&host, port, cert, key).await,
        Command::Config => {
            let loaded = config::Config::load()?;
            println!("{}", toml::to_string_pretty(&loaded)?);
            Ok(())
        }
    }
}
