//! cinder-server entry point.

mod config;
mod connection;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use config::ServerConfig;

/// A RESP-speaking in-memory key/value server.
#[derive(Debug, Parser)]
#[command(name = "cinder-server", version)]
struct Args {
    /// Path to the configuration file. Defaults are used when the file
    /// does not exist.
    #[arg(default_value = "cinder.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info,cinder_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = if args.config.is_file() {
        match ServerConfig::load(&args.config) {
            Ok(config) => {
                info!(path = %args.config.display(), "config loaded");
                config
            }
            Err(e) => {
                error!("cannot load config: {e}");
                return ExitCode::from(2);
            }
        }
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        ServerConfig::default()
    };

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
