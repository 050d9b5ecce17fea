//! Clinichat development backend.
//!
//! An axum server that carries the push channel and the history, roster,
//! unread and mark-read endpoints the Clinichat client talks to. Messages
//! are kept in memory only.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin clinichat-relay
//!
//! # Run on custom address with staff accounts from a config file
//! cargo run --bin clinichat-relay -- --bind 127.0.0.1:8080 --config relay.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use clinichat_relay::config::{RelayCliArgs, RelayConfig};
use clinichat_relay::relay::{self, RelayState};
use clinichat_relay::store::MessageArchive;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        addr = %config.bind_addr,
        staff = config.staff.len(),
        "starting clinichat backend"
    );

    let archive = MessageArchive::with_max_history(config.max_history);
    let state = Arc::new(RelayState::with_config(
        config.max_body_size,
        archive,
        config.staff,
    ));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "backend listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "backend server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    }
}
