#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use matrix_bridge_core::bridge::power_levels::PowerLevelPolicy;
use matrix_bridge_core::bridge::BridgeCore;
use matrix_bridge_core::cli::Args;
use matrix_bridge_core::config::Config;
use matrix_bridge_core::db::DatabaseManager;
use matrix_bridge_core::matrix::{MatrixApi, MatrixAppservice};
use matrix_bridge_core::utils::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Arc::new(
        Config::load_from_file(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config))?,
    );
    init_tracing(&config.logging);

    if let Err(e) = PowerLevelPolicy::from_config(&config.power_levels) {
        error!("refusing to start: {}", e);
        return Err(e.into());
    }

    if args.check_config {
        info!("configuration at {} is valid", args.config);
        return Ok(());
    }

    info!("matrix bridge core starting up domain={}", config.bridge.domain);

    let db_manager = DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let matrix_client = Arc::new(MatrixAppservice::new(config.clone()).await?);
    matrix_client
        .ensure_registered(&config.bridge.bot_user_id())
        .await
        .context("failed to register the bridge bot")?;

    // platform listeners embed the library and feed an EventDispatcher built on this core
    let _core = BridgeCore::new(config.clone(), &db_manager, matrix_client)?;
    info!("bridge core ready bot={}", config.bridge.bot_user_id());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("matrix bridge core shutting down");
    Ok(())
}
