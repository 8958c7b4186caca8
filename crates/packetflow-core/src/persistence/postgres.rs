// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

use crate::error::CoreError;

use super::{
    NewRecord, NewSession, PacketCheckpoint, PacketRecord, Persistence, RecordFailure,
    RecordStatus, SessionFailure, SessionKey, SessionRecord, SessionStatus, parse_status_counts,
    transition_timestamp_column,
};

const SESSION_COLUMNS: &str = r#"
    activity_id, application_date, activity_type, activity_status, endpoint_url,
    packet_size, request_headers, status, current_offset, packets_processed,
    total_records, processed_records, failed_records, error_message, error_category,
    http_status_code, last_packet_processing_time_ms, total_processing_time_ms,
    last_processed_record_id, last_processed_record_data, created_at, updated_at,
    started_at, completed_at, paused_at, cancelled_at, last_processed_at
"#;

const RECORD_COLUMNS: &str = r#"
    id, activity_id, application_date, record_id, packet_number, record_index,
    status, retry_count, max_retries, record_data, error_message, error_category,
    failure_reason, processing_time_ms, created_at, updated_at, processed_at,
    failed_at, retry_scheduled_at
"#;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn list_records_where(
        &self,
        key: &SessionKey,
        condition: &str,
    ) -> Result<Vec<PacketRecord>, CoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packet_records \
             WHERE activity_id = $1 AND application_date = $2 {condition} \
             ORDER BY packet_number, record_index"
        );
        let records = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_session(&self, session: &NewSession) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO packet_sessions (
                activity_id, application_date, activity_type, activity_status,
                endpoint_url, packet_size, request_headers, status,
                created_at, updated_at, started_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'ACTIVE', $8, $8, $8)
            ON CONFLICT (activity_id, application_date) DO NOTHING
            "#,
        )
        .bind(&session.key.activity_id)
        .bind(session.key.application_date)
        .bind(&session.activity_type)
        .bind(&session.activity_status)
        .bind(&session.endpoint_url)
        .bind(session.packet_size)
        .bind(&session.request_headers)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions \
             WHERE activity_id = $1 AND application_date = $2"
        );
        let session = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .fetch_optional(&self.pool)
            .await?;

        Ok(session)
    }

    async fn transition_session(
        &self,
        key: &SessionKey,
        from: &[SessionStatus],
        to: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        if from.is_empty() {
            return Ok(false);
        }

        let stamp = transition_timestamp_column(to)
            .map(|column| format!(", {column} = $2"))
            .unwrap_or_default();
        let sql = format!(
            "UPDATE packet_sessions SET status = $1, updated_at = $2{stamp} \
             WHERE activity_id = $3 AND application_date = $4 AND status = ANY($5)"
        );
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(at)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .bind(from)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_session(
        &self,
        key: &SessionKey,
        failure: &SessionFailure,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE packet_sessions
            SET status = 'FAILED',
                error_message = $1,
                error_category = $2,
                http_status_code = $3,
                updated_at = $4
            WHERE activity_id = $5 AND application_date = $6 AND status = 'ACTIVE'
            "#,
        )
        .bind(&failure.message)
        .bind(&failure.category)
        .bind(failure.http_status)
        .bind(at)
        .bind(&key.activity_id)
        .bind(key.application_date)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn checkpoint_session(
        &self,
        key: &SessionKey,
        checkpoint: &PacketCheckpoint,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE packet_sessions
            SET current_offset = current_offset + $1,
                packets_processed = $2,
                total_records = GREATEST(total_records, $3),
                last_processed_record_id = COALESCE($4, last_processed_record_id),
                last_processed_record_data = COALESCE($5, last_processed_record_data),
                last_packet_processing_time_ms = $6,
                total_processing_time_ms = total_processing_time_ms + $6,
                last_processed_at = $7,
                updated_at = $7
            WHERE activity_id = $8
              AND application_date = $9
              AND packets_processed = $2 - 1
            "#,
        )
        .bind(checkpoint.records_fetched)
        .bind(checkpoint.packet_number)
        .bind(checkpoint.total_records)
        .bind(&checkpoint.last_record_id)
        .bind(&checkpoint.last_record_data)
        .bind(checkpoint.packet_processing_time_ms)
        .bind(checkpoint.processed_at)
        .bind(&key.activity_id)
        .bind(key.application_date)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_sessions_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions WHERE activity_id = $1 \
             ORDER BY application_date, created_at"
        );
        let sessions = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(activity_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn list_sessions_by_date(
        &self,
        application_date: NaiveDate,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions WHERE application_date = $1 \
             ORDER BY activity_id, created_at"
        );
        let sessions = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(application_date)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn list_sessions_by_type(
        &self,
        activity_type: &str,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions WHERE activity_type = $1 \
             ORDER BY application_date, created_at"
        );
        let sessions = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(activity_type)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn list_active_or_paused(&self) -> Result<Vec<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions \
             WHERE status IN ('ACTIVE', 'PAUSED') ORDER BY created_at"
        );
        let sessions = sqlx::query_as::<_, SessionRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn find_stale_active_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM packet_sessions \
             WHERE status = 'ACTIVE' \
               AND COALESCE(last_processed_at, started_at, created_at) < $1 \
             ORDER BY created_at"
        );
        let sessions = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn count_sessions_by_status(&self) -> Result<HashMap<SessionStatus, i64>, CoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM packet_sessions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        parse_status_counts(rows)
    }

    async fn insert_record(&self, record: &NewRecord) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO packet_records (
                activity_id, application_date, record_id, packet_number, record_index,
                status, retry_count, max_retries, record_data, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7, $8, $8)
            RETURNING id
            "#,
        )
        .bind(&record.key.activity_id)
        .bind(record.key.application_date)
        .bind(&record.record_id)
        .bind(record.packet_number)
        .bind(record.record_index)
        .bind(record.max_retries)
        .bind(&record.record_data)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn get_record_at(
        &self,
        key: &SessionKey,
        packet_number: i64,
        record_index: i64,
    ) -> Result<Option<PacketRecord>, CoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packet_records \
             WHERE activity_id = $1 AND application_date = $2 \
               AND packet_number = $3 AND record_index = $4"
        );
        let record = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .bind(packet_number)
            .bind(record_index)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn mark_record_processing(&self, id: i64, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE packet_records
            SET status = 'PROCESSING', processed_at = $1, updated_at = $1
            WHERE id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_record_success(
        &self,
        key: &SessionKey,
        id: i64,
        processing_time_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE packet_records
            SET status = 'SUCCESS', processing_time_ms = $1, processed_at = $2, updated_at = $2
            WHERE id = $3 AND status = 'PROCESSING'
            "#,
        )
        .bind(processing_time_ms)
        .bind(at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE packet_sessions
            SET processed_records = processed_records + 1, updated_at = $1
            WHERE activity_id = $2 AND application_date = $3
            "#,
        )
        .bind(at)
        .bind(&key.activity_id)
        .bind(key.application_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn complete_record_failure(
        &self,
        key: &SessionKey,
        id: i64,
        failure: &RecordFailure,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE packet_records
            SET status = 'FAILED',
                error_message = $1,
                error_category = $2,
                failure_reason = $3,
                processing_time_ms = $4,
                failed_at = $5,
                updated_at = $5
            WHERE id = $6 AND status = 'PROCESSING'
            "#,
        )
        .bind(&failure.message)
        .bind(&failure.category)
        .bind(&failure.failure_reason)
        .bind(failure.processing_time_ms)
        .bind(at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE packet_sessions
            SET failed_records = failed_records + 1, updated_at = $1
            WHERE activity_id = $2 AND application_date = $3
            "#,
        )
        .bind(at)
        .bind(&key.activity_id)
        .bind(key.application_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_retryable_failed_records(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<PacketRecord>, CoreError> {
        self.list_records_where(key, "AND status = 'FAILED' AND retry_count < max_retries")
            .await
    }

    async fn find_pending_records(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<PacketRecord>, CoreError> {
        self.list_records_where(key, "AND status = 'PENDING'").await
    }

    async fn find_dispatchable_records(
        &self,
        key: &SessionKey,
        max_packet: i64,
    ) -> Result<Vec<PacketRecord>, CoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packet_records \
             WHERE activity_id = $1 AND application_date = $2 \
               AND status IN ('PENDING', 'PROCESSING') AND packet_number <= $3 \
             ORDER BY packet_number, record_index"
        );
        let records = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .bind(max_packet)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn find_failed_records_in_packet(
        &self,
        key: &SessionKey,
        packet_number: i64,
    ) -> Result<Vec<PacketRecord>, CoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packet_records \
             WHERE activity_id = $1 AND application_date = $2 \
               AND status = 'FAILED' AND packet_number = $3 \
             ORDER BY record_index"
        );
        let records = sqlx::query_as::<_, PacketRecord>(&sql)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .bind(packet_number)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn list_records(&self, key: &SessionKey) -> Result<Vec<PacketRecord>, CoreError> {
        self.list_records_where(key, "").await
    }

    async fn reset_records_for_retry(
        &self,
        key: &SessionKey,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE packet_records
            SET status = 'PENDING',
                retry_count = retry_count + 1,
                retry_scheduled_at = $1,
                updated_at = $1
            WHERE activity_id = $2
              AND application_date = $3
              AND status = 'FAILED'
              AND retry_count < max_retries
            "#,
        )
        .bind(at)
        .bind(&key.activity_id)
        .bind(key.application_date)
        .execute(&mut *tx)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            sqlx::query(
                r#"
                UPDATE packet_sessions
                SET failed_records = failed_records - $1, updated_at = $2
                WHERE activity_id = $3 AND application_date = $4
                "#,
            )
            .bind(reset as i64)
            .bind(at)
            .bind(&key.activity_id)
            .bind(key.application_date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reset)
    }

    async fn count_records_by_status(
        &self,
        key: &SessionKey,
    ) -> Result<HashMap<RecordStatus, i64>, CoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM packet_records
            WHERE activity_id = $1 AND application_date = $2
            GROUP BY status
            "#,
        )
        .bind(&key.activity_id)
        .bind(key.application_date)
        .fetch_all(&self.pool)
        .await?;
        parse_status_counts(rows)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
