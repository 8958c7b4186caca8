// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting stale sessions.
//!
//! A session that is ACTIVE but has not checkpointed a packet within the
//! configured timeout is reported. This happens when:
//! - The endpoint hangs while retries keep the fetch alive
//! - The record processor never returns
//! - The process owning the loop died and recovery has not run yet
//!
//! The monitor only reports; it never changes session state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{Persistence, SessionRecord};

/// Configuration for the stale session monitor.
#[derive(Debug, Clone)]
pub struct StaleMonitorConfig {
    /// How often to check for stale sessions.
    pub poll_interval: Duration,
    /// Time without progress after which an ACTIVE session is stale.
    pub stale_timeout: Duration,
}

impl Default for StaleMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(600),
        }
    }
}

/// Background worker that reports ACTIVE sessions without recent progress.
pub struct StaleMonitor {
    persistence: Arc<dyn Persistence>,
    config: StaleMonitorConfig,
    shutdown: Arc<Notify>,
}

impl StaleMonitor {
    pub fn new(persistence: Arc<dyn Persistence>, config: StaleMonitorConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            "Stale session monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stale session monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_stale_sessions().await {
                        error!(error = %e, "Failed to check stale sessions");
                    }
                }
            }
        }

        info!("Stale session monitor stopped");
    }

    /// Find and report stale sessions. Returns what was found.
    pub async fn check_stale_sessions(&self) -> Result<Vec<SessionRecord>> {
        let cutoff = self.cutoff(Utc::now())?;
        let stale = self.persistence.find_stale_active_sessions(cutoff).await?;

        if stale.is_empty() {
            debug!("No stale sessions found");
            return Ok(stale);
        }

        for session in &stale {
            warn!(
                processing_id = %session.processing_id(),
                last_processed_at = ?session.last_processed_at,
                current_offset = session.current_offset,
                packets_processed = session.packets_processed,
                "Session is ACTIVE but has made no progress"
            );
        }
        info!(count = stale.len(), "Found stale sessions");

        Ok(stale)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.config.stale_timeout)
            .map_err(|e| CoreError::validation("stale_timeout", format!("invalid duration: {}", e)))?;
        Ok(now - timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{NewSession, SessionKey, SqlitePersistence};
    use chrono::NaiveDate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn persistence() -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqlitePersistence::new(pool))
    }

    fn session(activity_id: &str, created_at: DateTime<Utc>) -> NewSession {
        NewSession {
            key: SessionKey::new(activity_id, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()),
            activity_type: None,
            activity_status: None,
            endpoint_url: "http://localhost/records".to_string(),
            packet_size: 10,
            request_headers: "{}".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_reports_only_old_active_sessions() {
        let persistence = persistence().await;
        let old = Utc::now() - chrono::Duration::hours(2);
        persistence.insert_session(&session("old", old)).await.unwrap();
        persistence
            .insert_session(&session("fresh", Utc::now()))
            .await
            .unwrap();

        let monitor = StaleMonitor::new(
            persistence,
            StaleMonitorConfig {
                poll_interval: Duration::from_secs(60),
                stale_timeout: Duration::from_secs(3600),
            },
        );

        let stale = monitor.check_stale_sessions().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].activity_id, "old");
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let monitor = Arc::new(StaleMonitor::new(
            persistence().await,
            StaleMonitorConfig {
                poll_interval: Duration::from_millis(10),
                stale_timeout: Duration::from_secs(1),
            },
        ));
        let shutdown = monitor.shutdown_handle();

        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = StaleMonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.stale_timeout, Duration::from_secs(600));
    }
}
