// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session control handlers for packetflow-core.
//!
//! These handlers implement the control surface: start, status, pause,
//! resume, cancel, retry of failed records and the session queries.
//!
//! Control operations never raise for a missing session or an invalid state;
//! they log and return `false`. Only `start` reports errors, for invalid input
//! or a key whose session can no longer be restarted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, instrument, warn};

use crate::classifier::{ErrorClassifier, PatternErrorClassifier};
use crate::error::{CoreError, Result};
use crate::fetcher::PageSource;
use crate::packet_loop::spawn_if_idle;
use crate::persistence::{
    NewSession, Persistence, RecordStatus, SessionKey, SessionRecord, SessionStatus,
};
use crate::processor::RecordProcessor;
use crate::slots::SessionSlots;

/// Engine-wide defaults applied when sessions and records are created.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Packet size used when `start` passes 0.
    pub default_packet_size: u32,
    /// `max_retries` copied onto every new record.
    pub record_max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_packet_size: 10,
            record_max_retries: 3,
        }
    }
}

/// Shared state for session handlers and the packet loops they spawn.
pub struct SessionHandlerState {
    /// Persistence implementation.
    pub persistence: Arc<dyn Persistence>,
    /// Source of packets (the HTTP pagination client in production).
    pub page_source: Arc<dyn PageSource>,
    /// Per-record work.
    pub processor: Arc<dyn RecordProcessor>,
    /// Classifies record failure messages.
    pub classifier: Arc<dyn ErrorClassifier>,
    pub settings: EngineSettings,
    pub(crate) slots: SessionSlots,
}

impl SessionHandlerState {
    /// Create handler state with the pattern classifier and default settings.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        page_source: Arc<dyn PageSource>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Self {
            persistence,
            page_source,
            processor,
            classifier: Arc::new(PatternErrorClassifier::new()),
            settings: EngineSettings::default(),
            slots: SessionSlots::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Whether a loop task currently owns the session.
    pub async fn is_loop_active(&self, key: &SessionKey) -> bool {
        self.slots.is_loop_active(key).await
    }
}

impl std::fmt::Debug for SessionHandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandlerState")
            .field("persistence", &"...")
            .field("page_source", &"...")
            .field("processor", &"...")
            .field("classifier", &"...")
            .field("settings", &self.settings)
            .finish()
    }
}

/// Parameters of a start request.
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub endpoint_url: String,
    /// 0 selects the configured default.
    pub packet_size: u32,
    /// Sent with every fetch of this session.
    pub headers: HashMap<String, String>,
    pub activity_id: String,
    pub application_date: NaiveDate,
    pub activity_type: Option<String>,
    pub activity_status: Option<String>,
}

impl StartSessionRequest {
    /// Request with no headers, default packet size and no descriptive fields.
    pub fn new(
        endpoint_url: impl Into<String>,
        activity_id: impl Into<String>,
        application_date: NaiveDate,
    ) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            packet_size: 0,
            headers: HashMap::new(),
            activity_id: activity_id.into(),
            application_date,
            activity_type: None,
            activity_status: None,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.activity_id.clone(), self.application_date)
    }
}

// ============================================================================
// Start
// ============================================================================

/// Handle a start request.
///
/// Idempotent on `(activity_id, application_date)`: if an ACTIVE or PAUSED
/// session exists its processing id is returned and nothing is created. A new
/// session is persisted as ACTIVE and its loop is spawned in the background.
///
/// # Errors
///
/// - `ValidationError` if `activity_id` or `endpoint_url` is empty
/// - `SessionAlreadyExists` if the key belongs to a FAILED, COMPLETED or
///   CANCELLED session
#[instrument(
    skip(state, request),
    fields(activity_id = %request.activity_id, application_date = %request.application_date)
)]
pub async fn handle_start_session(
    state: &Arc<SessionHandlerState>,
    request: StartSessionRequest,
) -> Result<String> {
    info!(endpoint_url = %request.endpoint_url, "Starting packet processing");

    if request.activity_id.trim().is_empty() {
        return Err(CoreError::validation("activity_id", "must not be empty"));
    }
    if request.endpoint_url.trim().is_empty() {
        return Err(CoreError::validation("endpoint_url", "must not be empty"));
    }

    let key = request.key();
    let slot = state.slots.slot(&key);
    let mut guard = slot.lock().await;

    if let Some(existing) = state.persistence.get_session(&key).await? {
        let processing_id = reuse_existing_session(&existing)?;
        if existing.status == SessionStatus::Active {
            spawn_if_idle(state, &key, &mut guard);
        }
        return Ok(processing_id);
    }

    let packet_size = if request.packet_size == 0 {
        state.settings.default_packet_size
    } else {
        request.packet_size
    };

    let session = NewSession {
        key: key.clone(),
        activity_type: request.activity_type,
        activity_status: request.activity_status,
        endpoint_url: request.endpoint_url,
        packet_size: i64::from(packet_size),
        request_headers: serde_json::to_string(&request.headers)?,
        created_at: Utc::now(),
    };

    if !state.persistence.insert_session(&session).await? {
        // Another process inserted the key between our read and write.
        let existing = state.persistence.get_session(&key).await?.ok_or_else(|| {
            CoreError::SessionNotFound {
                processing_id: key.processing_id(),
            }
        })?;
        return reuse_existing_session(&existing);
    }

    spawn_if_idle(state, &key, &mut guard);
    info!(packet_size, "Session created");

    Ok(key.processing_id())
}

fn reuse_existing_session(existing: &SessionRecord) -> Result<String> {
    if existing.status.is_open() {
        warn!(status = %existing.status, "Session already exists, reusing it");
        Ok(existing.processing_id())
    } else {
        Err(CoreError::SessionAlreadyExists {
            processing_id: existing.processing_id(),
            status: existing.status.to_string(),
        })
    }
}

// ============================================================================
// Status & Queries
// ============================================================================

/// Current session row, or `None` if the key is unknown.
#[instrument(skip(state), fields(processing_id = %key))]
pub async fn handle_get_session_status(
    state: &SessionHandlerState,
    key: &SessionKey,
) -> Result<Option<SessionRecord>> {
    state.persistence.get_session(key).await
}

/// Record counts by status for a session.
pub async fn handle_get_record_counts(
    state: &SessionHandlerState,
    key: &SessionKey,
) -> Result<HashMap<RecordStatus, i64>> {
    state.persistence.count_records_by_status(key).await
}

pub async fn handle_list_sessions_by_activity(
    state: &SessionHandlerState,
    activity_id: &str,
) -> Result<Vec<SessionRecord>> {
    state.persistence.list_sessions_by_activity(activity_id).await
}

pub async fn handle_list_sessions_by_date(
    state: &SessionHandlerState,
    application_date: NaiveDate,
) -> Result<Vec<SessionRecord>> {
    state.persistence.list_sessions_by_date(application_date).await
}

pub async fn handle_list_sessions_by_type(
    state: &SessionHandlerState,
    activity_type: &str,
) -> Result<Vec<SessionRecord>> {
    state.persistence.list_sessions_by_type(activity_type).await
}

/// All ACTIVE or PAUSED sessions.
pub async fn handle_list_active_sessions(
    state: &SessionHandlerState,
) -> Result<Vec<SessionRecord>> {
    state.persistence.list_active_or_paused().await
}

// ============================================================================
// Control Operations
// ============================================================================

/// Pause an ACTIVE session. The loop stops at its next iteration boundary,
/// after finishing the packet in flight.
#[instrument(skip(state), fields(processing_id = %key))]
pub async fn handle_pause_session(state: &SessionHandlerState, key: &SessionKey) -> Result<bool> {
    let slot = state.slots.slot(key);
    let _guard = slot.lock().await;

    let Some(session) = load_for_control(state, key).await? else {
        return Ok(false);
    };
    if session.status != SessionStatus::Active {
        warn!(status = %session.status, "Session is not active, cannot pause");
        return Ok(false);
    }

    let paused = state
        .persistence
        .transition_session(key, &[SessionStatus::Active], SessionStatus::Paused, Utc::now())
        .await?;
    if paused {
        info!("Session paused");
    }
    Ok(paused)
}

/// Resume a PAUSED or FAILED session from its persisted checkpoint.
///
/// Error detail of a FAILED session is kept.
#[instrument(skip(state), fields(processing_id = %key))]
pub async fn handle_resume_session(
    state: &Arc<SessionHandlerState>,
    key: &SessionKey,
) -> Result<bool> {
    let slot = state.slots.slot(key);
    let mut guard = slot.lock().await;

    let Some(session) = load_for_control(state, key).await? else {
        return Ok(false);
    };
    if !matches!(session.status, SessionStatus::Paused | SessionStatus::Failed) {
        warn!(status = %session.status, "Session is not in a resumable state");
        return Ok(false);
    }

    let resumed = state
        .persistence
        .transition_session(
            key,
            &[SessionStatus::Paused, SessionStatus::Failed],
            SessionStatus::Active,
            Utc::now(),
        )
        .await?;
    if resumed {
        info!(from = %session.status, offset = session.current_offset, "Session resumed");
        spawn_if_idle(state, key, &mut guard);
    }
    Ok(resumed)
}

/// Cancel an ACTIVE or PAUSED session. Final.
#[instrument(skip(state), fields(processing_id = %key))]
pub async fn handle_cancel_session(state: &SessionHandlerState, key: &SessionKey) -> Result<bool> {
    let slot = state.slots.slot(key);
    let _guard = slot.lock().await;

    let Some(session) = load_for_control(state, key).await? else {
        return Ok(false);
    };
    if !session.status.is_open() {
        warn!(status = %session.status, "Session cannot be cancelled");
        return Ok(false);
    }

    let cancelled = state
        .persistence
        .transition_session(
            key,
            &[SessionStatus::Active, SessionStatus::Paused],
            SessionStatus::Cancelled,
            Utc::now(),
        )
        .await?;
    if cancelled {
        info!("Session cancelled");
    }
    Ok(cancelled)
}

/// Reset FAILED records with retries left back to PENDING.
///
/// The session's loop re-dispatches them. A PAUSED session is resumed; a
/// FAILED session keeps its status until resumed explicitly. Rejected for
/// COMPLETED and CANCELLED sessions.
#[instrument(skip(state), fields(processing_id = %key))]
pub async fn handle_retry_failed_records(
    state: &Arc<SessionHandlerState>,
    key: &SessionKey,
) -> Result<bool> {
    let slot = state.slots.slot(key);
    let mut guard = slot.lock().await;

    let Some(session) = load_for_control(state, key).await? else {
        return Ok(false);
    };
    if session.status.is_final() {
        warn!(status = %session.status, "Session is final, records cannot be retried");
        return Ok(false);
    }

    let reset = state
        .persistence
        .reset_records_for_retry(key, Utc::now())
        .await?;
    if reset == 0 {
        info!("No retryable failed records found");
        return Ok(true);
    }
    info!(records = reset, "Retrying failed records");

    if session.status == SessionStatus::Paused {
        let resumed = state
            .persistence
            .transition_session(key, &[SessionStatus::Paused], SessionStatus::Active, Utc::now())
            .await?;
        if resumed {
            info!("Session resumed for retry");
            spawn_if_idle(state, key, &mut guard);
        }
    } else if session.status == SessionStatus::Active {
        // An idle ACTIVE session only happens after a restart before recovery.
        spawn_if_idle(state, key, &mut guard);
    }

    Ok(true)
}

async fn load_for_control(
    state: &SessionHandlerState,
    key: &SessionKey,
) -> Result<Option<SessionRecord>> {
    match state.persistence.get_session(key).await {
        Ok(Some(session)) => Ok(Some(session)),
        Ok(None) => {
            error!("Session not found");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
