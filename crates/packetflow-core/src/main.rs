// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Packetflow maintenance worker
//!
//! Standalone process that:
//! - Applies migrations to the configured database
//! - Reports stale sessions
//!
//! It never runs session loops. Processing records needs a `RecordProcessor`,
//! so applications embed the library and build a `PacketRuntime`, which
//! recovers ACTIVE sessions on start.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use packetflow_core::config::Config;
use packetflow_core::migrations;
use packetflow_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use packetflow_core::stale_monitor::StaleMonitor;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("packetflow_core=info".parse()?)
                .add_directive("packetflow_http=info".parse()?),
        )
        .init();

    info!("Starting Packetflow worker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let monitor_config = config.stale_monitor_config();
    info!(
        stale_check_interval_secs = monitor_config.poll_interval.as_secs(),
        stale_session_timeout_secs = monitor_config.stale_timeout.as_secs(),
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let persistence = connect_persistence(&config.database_url).await?;
    if !persistence.health_check_db().await? {
        return Err(anyhow::anyhow!("database health check failed"));
    }
    info!("Database health check passed");

    let monitor = StaleMonitor::new(persistence, monitor_config);
    let shutdown = monitor.shutdown_handle();
    let monitor_task = tokio::spawn(async move { monitor.run().await });

    info!("Packetflow worker initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.notify_one();
    monitor_task.await?;
    info!("Shutdown complete");

    Ok(())
}

/// Open the store named by `database_url` and run its migrations.
async fn connect_persistence(database_url: &str) -> Result<Arc<dyn Persistence>> {
    let sqlite_path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"));
    if let Some(path) = sqlite_path {
        info!(path, "Opening SQLite database (migrations run on open)");
        Ok(Arc::new(SqlitePersistence::from_path(path).await?))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Running PostgreSQL migrations...");
        migrations::run_postgres(&pool).await?;
        info!("Migrations completed");
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
