// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for packetflow-core.
//!
//! This module provides [`PacketRuntime`] which wires the store, the page
//! source, the record processor and the classifier together, recovers
//! sessions left ACTIVE by a previous process and runs the stale session
//! monitor.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use packetflow_core::persistence::SqlitePersistence;
//! use packetflow_core::runtime::PacketRuntime;
//! use packetflow_http::{PaginationClient, PaginationClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/packetflow.db").await?);
//!     let client = Arc::new(PaginationClient::new(PaginationClientConfig::default())?);
//!
//!     let runtime = PacketRuntime::builder()
//!         .persistence(persistence)
//!         .page_source(client)
//!         .processor(Arc::new(MyProcessor))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... start sessions through runtime.state() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::classifier::{ErrorClassifier, PatternErrorClassifier};
use crate::fetcher::PageSource;
use crate::packet_loop::spawn_if_idle;
use crate::persistence::{Persistence, SessionStatus};
use crate::processor::RecordProcessor;
use crate::session_handlers::{EngineSettings, SessionHandlerState};
use crate::stale_monitor::{StaleMonitor, StaleMonitorConfig};

/// Builder for creating a [`PacketRuntime`].
pub struct PacketRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    page_source: Option<Arc<dyn PageSource>>,
    processor: Option<Arc<dyn RecordProcessor>>,
    classifier: Arc<dyn ErrorClassifier>,
    settings: EngineSettings,
    stale_monitor: Option<StaleMonitorConfig>,
}

impl std::fmt::Debug for PacketRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("page_source", &self.page_source.as_ref().map(|_| "..."))
            .field("processor", &self.processor.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("stale_monitor", &self.stale_monitor)
            .finish()
    }
}

impl Default for PacketRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            page_source: None,
            processor: None,
            classifier: Arc::new(PatternErrorClassifier::new()),
            settings: EngineSettings::default(),
            stale_monitor: Some(StaleMonitorConfig::default()),
        }
    }
}

impl PacketRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the page source (required).
    pub fn page_source(mut self, page_source: Arc<dyn PageSource>) -> Self {
        self.page_source = Some(page_source);
        self
    }

    /// Set the record processor (required).
    pub fn processor(mut self, processor: Arc<dyn RecordProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Replace the default pattern classifier.
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Configure the stale session monitor; `None` disables it.
    ///
    /// Default: enabled with [`StaleMonitorConfig::default`].
    pub fn stale_monitor(mut self, config: Option<StaleMonitorConfig>) -> Self {
        self.stale_monitor = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<PacketRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let page_source = self
            .page_source
            .ok_or_else(|| anyhow::anyhow!("page source is required"))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("record processor is required"))?;

        if self.settings.default_packet_size == 0 {
            return Err(anyhow::anyhow!("default packet size must be positive"));
        }
        if self
            .stale_monitor
            .as_ref()
            .is_some_and(|config| config.poll_interval.is_zero())
        {
            return Err(anyhow::anyhow!("stale monitor poll interval must be positive"));
        }

        let state = SessionHandlerState::new(persistence, page_source, processor)
            .with_classifier(self.classifier)
            .with_settings(self.settings);

        Ok(PacketRuntimeConfig {
            state: Arc::new(state),
            stale_monitor: self.stale_monitor,
        })
    }
}

/// Configuration for a [`PacketRuntime`].
pub struct PacketRuntimeConfig {
    state: Arc<SessionHandlerState>,
    stale_monitor: Option<StaleMonitorConfig>,
}

impl std::fmt::Debug for PacketRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRuntimeConfig")
            .field("state", &self.state)
            .field("stale_monitor", &self.stale_monitor)
            .finish()
    }
}

impl PacketRuntimeConfig {
    /// Start the runtime: recover ACTIVE sessions, then spawn the stale
    /// session monitor if enabled.
    pub async fn start(self) -> Result<PacketRuntime> {
        let recovered = recover_active_sessions(&self.state).await?;

        let monitor = self.stale_monitor.map(|config| {
            let monitor = StaleMonitor::new(self.state.persistence.clone(), config);
            let shutdown = monitor.shutdown_handle();
            let handle = tokio::spawn(async move { monitor.run().await });
            (shutdown, handle)
        });

        info!(
            recovered_sessions = recovered,
            stale_monitor = monitor.is_some(),
            "PacketRuntime started"
        );

        Ok(PacketRuntime {
            state: self.state,
            monitor,
        })
    }
}

/// A running packet engine that can be embedded in an application.
///
/// Session loops run as detached tasks; [`shutdown`](Self::shutdown) stops
/// the stale monitor only. Loops interrupted by process exit resume from
/// their checkpoint on the next start.
pub struct PacketRuntime {
    state: Arc<SessionHandlerState>,
    monitor: Option<(Arc<Notify>, JoinHandle<()>)>,
}

impl PacketRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PacketRuntimeBuilder {
        PacketRuntimeBuilder::new()
    }

    /// Shared handler state, passed to the `session_handlers` functions.
    pub fn state(&self) -> &Arc<SessionHandlerState> {
        &self.state
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.state.persistence
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("PacketRuntime shutting down...");

        let Some((shutdown, handle)) = self.monitor else {
            info!("PacketRuntime shutdown complete");
            return Ok(());
        };

        shutdown.notify_one();
        match handle.await {
            Ok(()) => {
                info!("PacketRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Stale monitor task panicked: {}", e);
                Err(anyhow::anyhow!("stale monitor task panicked: {}", e))
            }
        }
    }
}

/// Spawn loops for sessions persisted as ACTIVE that have no running loop.
///
/// Returns the number of loops spawned.
pub async fn recover_active_sessions(state: &Arc<SessionHandlerState>) -> Result<usize> {
    let sessions = state.persistence.list_active_or_paused().await?;
    let mut recovered = 0;

    for session in sessions
        .into_iter()
        .filter(|s| s.status == SessionStatus::Active)
    {
        let key = session.key();
        let slot = state.slots.slot(&key);
        let mut guard = slot.lock().await;
        if spawn_if_idle(state, &key, &mut guard) {
            info!(
                processing_id = %key,
                offset = session.current_offset,
                packets_processed = session.packets_processed,
                "Recovered active session"
            );
            recovered += 1;
        }
    }

    Ok(recovered)
}
