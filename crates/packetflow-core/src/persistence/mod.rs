// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for packetflow-core.
//!
//! This module defines the session/record store abstraction and its SQLite
//! and PostgreSQL implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::CoreError;

/// Identity of a session: one run per activity per application date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    /// Caller-supplied activity identifier.
    pub activity_id: String,
    /// Business date the run belongs to.
    pub application_date: NaiveDate,
}

impl SessionKey {
    /// Create a session key.
    pub fn new(activity_id: impl Into<String>, application_date: NaiveDate) -> Self {
        Self {
            activity_id: activity_id.into(),
            application_date,
        }
    }

    /// Processing id returned to callers: `{activity_id}-{application_date}`.
    pub fn processing_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.activity_id,
            self.application_date.format("%Y-%m-%d")
        )
    }
}

/// A status string read from the store did not match any known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Session control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Loop is (or should be) running.
    Active,
    /// Stopped by pause; resumable.
    Paused,
    /// Stopped by a fetch or loop failure; resumable.
    Failed,
    /// Stopped by cancel; final.
    Cancelled,
    /// All pages consumed; final.
    Completed,
}

impl SessionStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        }
    }

    /// COMPLETED and CANCELLED accept no further transitions.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// ACTIVE or PAUSED; at most one such session per key.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Record processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Skipped,
}

impl RecordStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// SUCCESS, FAILED or SKIPPED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for RecordStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Session row from the persistence layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub activity_id: String,
    pub application_date: NaiveDate,
    pub activity_type: Option<String>,
    pub activity_status: Option<String>,
    pub endpoint_url: String,
    pub packet_size: i64,
    /// Caller headers as a JSON object, replayed on every fetch.
    pub request_headers: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Next offset to fetch.
    pub current_offset: i64,
    /// Number of packets checkpointed so far.
    pub packets_processed: i64,
    pub total_records: i64,
    pub processed_records: i64,
    pub failed_records: i64,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub http_status_code: Option<i64>,
    pub last_packet_processing_time_ms: Option<i64>,
    pub total_processing_time_ms: i64,
    pub last_processed_record_id: Option<String>,
    pub last_processed_record_data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Identity key of this session.
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.activity_id.clone(), self.application_date)
    }

    /// Processing id of this session.
    pub fn processing_id(&self) -> String {
        self.key().processing_id()
    }

    /// Decode the persisted caller headers.
    pub fn headers(&self) -> Result<HashMap<String, String>, CoreError> {
        if self.request_headers.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&self.request_headers)?)
    }
}

/// Record row from the persistence layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PacketRecord {
    /// Database primary key.
    pub id: i64,
    pub activity_id: String,
    pub application_date: NaiveDate,
    /// Identifier extracted from the payload, or a positional fallback.
    pub record_id: String,
    /// 1-based packet sequence number.
    pub packet_number: i64,
    /// 0-based position within the packet.
    pub record_index: i64,
    #[sqlx(try_from = "String")]
    pub status: RecordStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    /// JSON payload snapshot.
    pub record_data: String,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub failure_reason: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_scheduled_at: Option<DateTime<Utc>>,
}

impl PacketRecord {
    /// Whether a manual retry may reset this record.
    pub fn is_retryable(&self) -> bool {
        self.status == RecordStatus::Failed && self.retry_count < self.max_retries
    }
}

/// Fields for a new session row; status starts ACTIVE with zeroed counters.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub key: SessionKey,
    pub activity_type: Option<String>,
    pub activity_status: Option<String>,
    pub endpoint_url: String,
    pub packet_size: i64,
    /// Caller headers serialized as a JSON object.
    pub request_headers: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new PENDING record row.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub key: SessionKey,
    pub record_id: String,
    pub packet_number: i64,
    pub record_index: i64,
    pub max_retries: i64,
    pub record_data: String,
    pub created_at: DateTime<Utc>,
}

/// Error detail recorded on a FAILED session.
#[derive(Debug, Clone)]
pub struct SessionFailure {
    pub message: String,
    pub category: String,
    pub http_status: Option<i64>,
}

/// Error detail recorded on a FAILED record.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub message: String,
    pub category: String,
    pub failure_reason: String,
    pub processing_time_ms: i64,
}

/// Progress written after every record of a packet reached a terminal status.
#[derive(Debug, Clone)]
pub struct PacketCheckpoint {
    /// The packet being checkpointed; the write only applies while
    /// `packets_processed == packet_number - 1`.
    pub packet_number: i64,
    /// Records in the packet; added to `current_offset`.
    pub records_fetched: i64,
    /// New `total_records` value (never lower than the stored one).
    pub total_records: i64,
    pub last_record_id: Option<String>,
    pub last_record_data: Option<String>,
    pub packet_processing_time_ms: i64,
    pub processed_at: DateTime<Utc>,
}

/// Durable store for sessions and records.
///
/// All conditional writes return `true` when the row was changed, so callers
/// can tell a lost race from a successful transition.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new ACTIVE session. Returns `false` if the key already exists.
    async fn insert_session(&self, session: &NewSession) -> Result<bool, CoreError>;

    async fn get_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, CoreError>;

    /// Move a session from one of `from` to `to`, stamping the matching
    /// timestamp column (`paused_at`, `cancelled_at`, `completed_at`).
    async fn transition_session(
        &self,
        key: &SessionKey,
        from: &[SessionStatus],
        to: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Mark an ACTIVE session FAILED with error detail.
    async fn fail_session(
        &self,
        key: &SessionKey,
        failure: &SessionFailure,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Advance the checkpoint after a packet.
    async fn checkpoint_session(
        &self,
        key: &SessionKey,
        checkpoint: &PacketCheckpoint,
    ) -> Result<bool, CoreError>;

    async fn list_sessions_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    async fn list_sessions_by_date(
        &self,
        application_date: NaiveDate,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    async fn list_sessions_by_type(
        &self,
        activity_type: &str,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    /// ACTIVE or PAUSED sessions, oldest first.
    async fn list_active_or_paused(&self) -> Result<Vec<SessionRecord>, CoreError>;

    /// ACTIVE sessions with no progress since `cutoff`.
    async fn find_stale_active_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    async fn count_sessions_by_status(&self) -> Result<HashMap<SessionStatus, i64>, CoreError>;

    /// Insert a PENDING record and return its id.
    async fn insert_record(&self, record: &NewRecord) -> Result<i64, CoreError>;

    async fn get_record_at(
        &self,
        key: &SessionKey,
        packet_number: i64,
        record_index: i64,
    ) -> Result<Option<PacketRecord>, CoreError>;

    /// PENDING → PROCESSING. PROCESSING rows are left as they are.
    async fn mark_record_processing(&self, id: i64, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// PROCESSING → SUCCESS and `processed_records + 1`, atomically.
    async fn complete_record_success(
        &self,
        key: &SessionKey,
        id: i64,
        processing_time_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// PROCESSING → FAILED and `failed_records + 1`, atomically.
    async fn complete_record_failure(
        &self,
        key: &SessionKey,
        id: i64,
        failure: &RecordFailure,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// FAILED records with `retry_count < max_retries`.
    async fn find_retryable_failed_records(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<PacketRecord>, CoreError>;

    async fn find_pending_records(&self, key: &SessionKey)
    -> Result<Vec<PacketRecord>, CoreError>;

    /// PENDING or PROCESSING records in packets up to `max_packet`, in
    /// packet/index order.
    async fn find_dispatchable_records(
        &self,
        key: &SessionKey,
        max_packet: i64,
    ) -> Result<Vec<PacketRecord>, CoreError>;

    async fn find_failed_records_in_packet(
        &self,
        key: &SessionKey,
        packet_number: i64,
    ) -> Result<Vec<PacketRecord>, CoreError>;

    async fn list_records(&self, key: &SessionKey) -> Result<Vec<PacketRecord>, CoreError>;

    /// Reset retryable FAILED records to PENDING, bump their `retry_count`
    /// and decrement the session's `failed_records` accordingly. Returns the
    /// number of records reset.
    async fn reset_records_for_retry(
        &self,
        key: &SessionKey,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    async fn count_records_by_status(
        &self,
        key: &SessionKey,
    ) -> Result<HashMap<RecordStatus, i64>, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Timestamp column stamped when a session enters `status`.
pub(crate) fn transition_timestamp_column(status: SessionStatus) -> Option<&'static str> {
    match status {
        SessionStatus::Paused => Some("paused_at"),
        SessionStatus::Cancelled => Some("cancelled_at"),
        SessionStatus::Completed => Some("completed_at"),
        SessionStatus::Active | SessionStatus::Failed => None,
    }
}

pub(crate) fn parse_status_counts<S: FromStr>(
    rows: Vec<(String, i64)>,
) -> Result<HashMap<S, i64>, CoreError>
where
    S: std::hash::Hash + Eq,
    S::Err: fmt::Display,
{
    rows.into_iter()
        .map(|(status, count)| {
            status
                .parse::<S>()
                .map(|s| (s, count))
                .map_err(|e| CoreError::DatabaseError {
                    operation: "count_by_status".to_string(),
                    details: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_id_format() {
        let key = SessionKey::new(
            "ACT-42",
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
        );
        assert_eq!(key.processing_id(), "ACT-42-2025-01-05");
    }

    #[test]
    fn test_session_status_round_trip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
            SessionStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_session_status_classes() {
        assert!(SessionStatus::Completed.is_final());
        assert!(SessionStatus::Cancelled.is_final());
        assert!(!SessionStatus::Failed.is_final());
        assert!(SessionStatus::Active.is_open());
        assert!(SessionStatus::Paused.is_open());
        assert!(!SessionStatus::Failed.is_open());
    }

    #[test]
    fn test_record_status_terminal() {
        assert!(!RecordStatus::Pending.is_terminal());
        assert!(!RecordStatus::Processing.is_terminal());
        assert!(RecordStatus::Success.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::Skipped.is_terminal());
        assert_eq!(
            RecordStatus::try_from("SKIPPED".to_string()).unwrap(),
            RecordStatus::Skipped
        );
    }

    #[test]
    fn test_transition_timestamp_columns() {
        assert_eq!(
            transition_timestamp_column(SessionStatus::Paused),
            Some("paused_at")
        );
        assert_eq!(
            transition_timestamp_column(SessionStatus::Completed),
            Some("completed_at")
        );
        assert_eq!(transition_timestamp_column(SessionStatus::Active), None);
    }

    #[test]
    fn test_status_serializes_as_stored_string() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Cancelled).unwrap(),
            serde_json::json!("CANCELLED")
        );
        assert_eq!(
            serde_json::to_value(RecordStatus::Processing).unwrap(),
            serde_json::json!("PROCESSING")
        );
    }
}
