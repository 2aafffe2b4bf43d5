// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use irc_bot_rs::{
    cfg::{
        cli::config_path_from_env, config::BotConfig, logger::init_logger,
        store::ConfigStore,
    },
    client::client::IrcClient,
    handlers::{BUILTIN_HANDLERS, ClientHandle, manager::HandlerManager},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("config_logger.yaml")?;

    info!(
        "{} v{} starting at {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
    );

    let config_path = config_path_from_env()?;
    let cfg = BotConfig::load_from_file(&config_path).with_context(|| {
        format!("failed to load config {}", config_path.display())
    })?;

    let store = ConfigStore::new(config_path);
    let manager = Arc::new(HandlerManager::new(
        BUILTIN_HANDLERS.iter().map(|(name, ctor)| (*name, *ctor)),
        store.clone(),
    ));
    let client = IrcClient::new(cfg, store, manager.clone());
    let handle: Arc<dyn ClientHandle> = client.clone();

    manager.load_all(&handle).await;

    // INT and TERM both request a single orderly stop.
    {
        let client = client.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("failed to install TERM handler: {e}");
                    return;
                },
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
            info!("shutdown signal received");
            client.stop();
        });
    }

    client.run().await?;

    manager.shutdown(&handle).await;
    info!("shutdown complete");
    Ok(())
}
