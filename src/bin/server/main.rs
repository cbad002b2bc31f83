//! chatd-server: multi-user chat server
//!
//! This server handles:
//! - Account registration and login with single-session enforcement
//! - Friend lists, friend requests and blocking
//! - Direct and group messaging with offline delivery
//! - Chat history, search and pinned messages backed by flat files

mod activity;
mod config;
mod connection;
mod error;
mod handlers;
mod state;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use connection::handle_connection;
use state::ServerState;
use store::FileStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chatd=debug")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    let store = FileStore::open(config.account_path(), config.message_path())
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))?;
    let mut server_state = ServerState::new(Arc::new(store));
    let loaded = server_state.load_accounts()?;
    info!(accounts = loaded, data_dir = %config.data_dir.display(), "accounts loaded");

    let state = Arc::new(Mutex::new(server_state));
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    let permits = Arc::new(Semaphore::new(config.max_connections));

    info!(addr = %config.listen_addr(), max_connections = config.max_connections, "chatd listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!(%addr, "connection limit reached, refusing client");
            drop(stream);
            continue;
        };

        let state = state.clone();
        let config = config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state, config).await {
                error!(%addr, error = %e, "connection error");
            }
            drop(permit);
        });
    }
}
