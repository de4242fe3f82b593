//! Mnemo relay: serves the operation and key-value channels for every
//! user listed in `MNEMO_TOKENS`.
//!
//! Environment:
//! - `MNEMO_BIND`   address to listen on (default `127.0.0.1:9090`)
//! - `MNEMO_DATA`   RocksDB directory (default `mnemo_relay`)
//! - `MNEMO_TOKENS` comma separated `token=user` pairs
//! - `RUST_LOG`     log filter (default `info`)

use std::process::ExitCode;

use log::{error, info, warn};
use mnemo_sync::{RelayServer, ServerConfig, StaticTokens};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("MNEMO_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(data) = std::env::var("MNEMO_DATA") {
        config.store.path = data.into();
    }
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let tokens = match StaticTokens::parse(&std::env::var("MNEMO_TOKENS").unwrap_or_default()) {
        Ok(tokens) => tokens,
        Err(e) => {
            error!("Invalid MNEMO_TOKENS: {e}");
            return ExitCode::FAILURE;
        }
    };
    if tokens.is_empty() {
        warn!("MNEMO_TOKENS is empty, every upgrade will be rejected");
    }

    let config = config_from_env();
    info!(
        "Starting relay on {} with data in {} ({} tokens)",
        config.bind_addr,
        config.store.path.display(),
        tokens.len()
    );

    let server = match RelayServer::new(config, tokens) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open relay store: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ({} connections served)", server.stats().total_connections);
        }
    }
    ExitCode::SUCCESS
}
