// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fetch → dispatch → checkpoint loop that drives one ACTIVE session.
//!
//! One loop task runs per session. Each iteration:
//!
//! 1. Reloads the session under its slot lock and exits unless it is ACTIVE.
//! 2. Re-dispatches PENDING/PROCESSING records of already-checkpointed
//!    packets (records reset by a manual retry).
//! 3. Fetches the packet at `current_offset`. A fetch failure marks the
//!    session FAILED; an empty packet marks it COMPLETED.
//! 4. Processes every record of the packet in index order. A record that
//!    already reached a terminal status (replay after a crash) is skipped.
//!    A panicking processor fails only its own record.
//! 5. Advances the checkpoint, then stops with COMPLETED unless more records
//!    are expected.
//!
//! Errors escaping the loop (store failures, panics) are caught by the
//! supervisor task, which marks the session FAILED with `PROCESSING_ERROR`.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use packetflow_http::{FetchFailure, Page};

use crate::error::{CoreError, Result};
use crate::persistence::{
    NewRecord, PacketCheckpoint, PacketRecord, RecordFailure, RecordStatus, SessionFailure,
    SessionKey, SessionRecord, SessionStatus,
};
use crate::processor::{FetchedRecord, ProcessingFailure, extract_record_id};
use crate::session_handlers::SessionHandlerState;
use crate::slots::SlotState;

/// Error category stored when the loop itself fails.
pub const PROCESSING_ERROR_CATEGORY: &str = "PROCESSING_ERROR";

/// Mark the slot as owned and spawn a supervised loop for `key`, unless a
/// loop is already running. Must be called with the slot lock held.
///
/// Returns `true` if a new loop was spawned.
pub(crate) fn spawn_if_idle(
    state: &Arc<SessionHandlerState>,
    key: &SessionKey,
    slot: &mut SlotState,
) -> bool {
    if slot.loop_active {
        debug!(processing_id = %key, "Loop already running, not spawning another");
        return false;
    }
    slot.loop_active = true;
    spawn_supervised(state.clone(), key.clone());
    true
}

fn spawn_supervised(state: Arc<SessionHandlerState>, key: SessionKey) {
    tokio::spawn(async move {
        let worker = tokio::spawn(run_session_loop(state.clone(), key.clone()));

        let reason = match worker.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_error) if join_error.is_panic() => Some(format!(
                "loop task panicked: {}",
                panic_message(join_error.into_panic())
            )),
            Err(join_error) => Some(join_error.to_string()),
        };

        if let Some(reason) = reason {
            record_loop_failure(&state, &key, &reason).await;
        }
        state.slots.prune();
    });
}

async fn record_loop_failure(state: &SessionHandlerState, key: &SessionKey, reason: &str) {
    error!(processing_id = %key, error = %reason, "Packet loop aborted");

    let slot = state.slots.slot(key);
    let mut guard = slot.lock().await;
    guard.loop_active = false;

    let failure = SessionFailure {
        message: format!("Processing error: {}", reason),
        category: PROCESSING_ERROR_CATEGORY.to_string(),
        http_status: None,
    };
    match state
        .persistence
        .fail_session(key, &failure, Utc::now())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(processing_id = %key, "Session no longer ACTIVE, failure not recorded")
        }
        Err(e) => {
            error!(processing_id = %key, error = %e, "Failed to record loop failure")
        }
    }
}

/// Text of a panic payload (`&str` or `String`), if it has one.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

/// Run the loop for one session until it leaves ACTIVE.
async fn run_session_loop(state: Arc<SessionHandlerState>, key: SessionKey) -> Result<()> {
    info!(processing_id = %key, "Packet loop started");
    let slot = state.slots.slot(&key);

    loop {
        // Cooperative yield point: pause/cancel take effect here.
        let session = {
            let mut guard = slot.lock().await;
            match state.persistence.get_session(&key).await? {
                Some(session) if session.status == SessionStatus::Active => session,
                Some(session) => {
                    guard.loop_active = false;
                    info!(
                        processing_id = %key,
                        status = %session.status,
                        "Session no longer active, loop stopping"
                    );
                    return Ok(());
                }
                None => {
                    guard.loop_active = false;
                    warn!(processing_id = %key, "Session disappeared, loop stopping");
                    return Ok(());
                }
            }
        };

        redispatch_pending_records(&state, &session).await?;

        if !process_next_packet(&state, &session).await? {
            return Ok(());
        }
    }
}

/// Process records reset by a retry, from their stored payload.
async fn redispatch_pending_records(
    state: &SessionHandlerState,
    session: &SessionRecord,
) -> Result<()> {
    let key = session.key();
    let records = state
        .persistence
        .find_dispatchable_records(&key, session.packets_processed)
        .await?;
    if records.is_empty() {
        return Ok(());
    }

    info!(
        processing_id = %key,
        count = records.len(),
        "Re-dispatching pending records"
    );

    for record in records {
        let data = serde_json::from_str(&record.record_data).unwrap_or_else(|e| {
            warn!(record_id = %record.record_id, error = %e, "Stored payload is not JSON");
            Value::String(record.record_data.clone())
        });
        dispatch_record(state, &key, &record, data).await?;
    }
    Ok(())
}

/// Fetch and process one packet. Returns `false` when the loop must stop.
async fn process_next_packet(state: &SessionHandlerState, session: &SessionRecord) -> Result<bool> {
    let key = session.key();
    let packet_number = session.packets_processed + 1;
    let offset = u64::try_from(session.current_offset).unwrap_or_default();
    let limit = u32::try_from(session.packet_size).unwrap_or(u32::MAX).max(1);
    let headers = session.headers()?;
    let started = Instant::now();

    debug!(
        processing_id = %key,
        packet_number,
        offset,
        limit,
        "Fetching packet"
    );

    let page = match state
        .page_source
        .fetch_page(&session.endpoint_url, offset, limit, &headers)
        .await
    {
        Ok(page) => page,
        Err(failure) => {
            record_fetch_failure(state, &key, packet_number, &failure).await?;
            return Ok(false);
        }
    };

    if page.is_empty() {
        info!(processing_id = %key, packet_number, "No more records, completing session");
        finish_session(state, &key).await?;
        return Ok(false);
    }

    debug!(
        processing_id = %key,
        packet_number,
        records = page.len(),
        total = page.metadata.total_records,
        has_more = page.metadata.has_more_records,
        next_offset = page.metadata.next_offset,
        server_time_ms = page.metadata.server_processing_time_ms,
        "Packet fetched"
    );

    let (successful, failed) = process_packet_records(state, &key, packet_number, &page).await?;

    let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    let checkpoint = build_checkpoint(session, packet_number, &page, elapsed_ms);
    {
        let slot = state.slots.slot(&key);
        let _guard = slot.lock().await;
        if !state.persistence.checkpoint_session(&key, &checkpoint).await? {
            return Err(CoreError::CheckpointConflict {
                processing_id: key.processing_id(),
                packet_number,
            });
        }
    }

    info!(
        processing_id = %key,
        packet_number,
        records = page.len(),
        successful,
        failed,
        elapsed_ms,
        "Processed packet"
    );

    if !page.has_more_records {
        info!(processing_id = %key, packet_number, "Reached end of data");
        finish_session(state, &key).await?;
        return Ok(false);
    }

    Ok(true)
}

/// Process every record of `page` in index order. Returns (successful, failed)
/// counts for records dispatched in this pass.
async fn process_packet_records(
    state: &SessionHandlerState,
    key: &SessionKey,
    packet_number: i64,
    page: &Page,
) -> Result<(u64, u64)> {
    let mut successful = 0;
    let mut failed = 0;

    for (index, data) in page.records.iter().enumerate() {
        let record_index = i64::try_from(index).unwrap_or(i64::MAX);

        let record = match state
            .persistence
            .get_record_at(key, packet_number, record_index)
            .await?
        {
            Some(existing) if existing.status.is_terminal() => {
                debug!(
                    processing_id = %key,
                    packet_number,
                    record_index,
                    status = %existing.status,
                    "Record already processed, skipping"
                );
                continue;
            }
            Some(existing) => existing,
            None => insert_pending_record(state, key, packet_number, record_index, data).await?,
        };

        match dispatch_record(state, key, &record, data.clone()).await? {
            Some(RecordStatus::Success) => successful += 1,
            Some(RecordStatus::Failed) => failed += 1,
            _ => {}
        }
    }

    Ok((successful, failed))
}

async fn insert_pending_record(
    state: &SessionHandlerState,
    key: &SessionKey,
    packet_number: i64,
    record_index: i64,
    data: &Value,
) -> Result<PacketRecord> {
    let new_record = NewRecord {
        key: key.clone(),
        record_id: extract_record_id(data, key, packet_number, record_index),
        packet_number,
        record_index,
        max_retries: i64::from(state.settings.record_max_retries),
        record_data: serde_json::to_string(data)?,
        created_at: Utc::now(),
    };
    state.persistence.insert_record(&new_record).await?;

    state
        .persistence
        .get_record_at(key, packet_number, record_index)
        .await?
        .ok_or_else(|| CoreError::DatabaseError {
            operation: "insert_record".to_string(),
            details: format!(
                "record {}/{} missing after insert",
                packet_number, record_index
            ),
        })
}

/// Run the processor for one PENDING/PROCESSING record and store the outcome.
///
/// The processor runs in its own task so a panic fails only this record.
/// Returns the stored terminal status, or `None` if the row was no longer
/// PROCESSING and nothing was written.
async fn dispatch_record(
    state: &SessionHandlerState,
    key: &SessionKey,
    record: &PacketRecord,
    data: Value,
) -> Result<Option<RecordStatus>> {
    state
        .persistence
        .mark_record_processing(record.id, Utc::now())
        .await?;

    let fetched = FetchedRecord {
        key: key.clone(),
        record_id: record.record_id.clone(),
        packet_number: record.packet_number,
        record_index: record.record_index,
        data,
    };

    let started = Instant::now();
    let processor = state.processor.clone();
    let outcome = match tokio::spawn(async move { processor.process(&fetched).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) if join_error.is_panic() => Err(ProcessingFailure::new(format!(
            "Record processor panicked: {}",
            panic_message(join_error.into_panic())
        ))),
        Err(join_error) => Err(ProcessingFailure::new(format!(
            "Record processor task failed: {}",
            join_error
        ))),
    };
    let processing_time_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    let slot = state.slots.slot(key);
    let _guard = slot.lock().await;
    let (stored, status) = match outcome {
        Ok(()) => (
            state
                .persistence
                .complete_record_success(key, record.id, processing_time_ms, Utc::now())
                .await?,
            RecordStatus::Success,
        ),
        Err(failure) => {
            let classification = state.classifier.classify(failure.message());
            warn!(
                processing_id = %key,
                record_id = %record.record_id,
                category = classification.category(),
                retryable = classification.retryable,
                error = %failure,
                "Record processing failed"
            );
            let record_failure = RecordFailure {
                message: failure.message().to_string(),
                category: classification.category().to_string(),
                failure_reason: format!("Processing error: {}", failure.message()),
                processing_time_ms,
            };
            (
                state
                    .persistence
                    .complete_record_failure(key, record.id, &record_failure, Utc::now())
                    .await?,
                RecordStatus::Failed,
            )
        }
    };

    if !stored {
        warn!(
            processing_id = %key,
            record_id = %record.record_id,
            outcome = %status,
            "Record was not PROCESSING, outcome not stored"
        );
        return Ok(None);
    }
    Ok(Some(status))
}

fn build_checkpoint(
    session: &SessionRecord,
    packet_number: i64,
    page: &Page,
    elapsed_ms: i64,
) -> PacketCheckpoint {
    let fetched = i64::try_from(page.len()).unwrap_or(i64::MAX);
    let server_total = i64::try_from(page.metadata.total_records).unwrap_or(i64::MAX);
    let total_records = if server_total > 0 {
        session.total_records.max(server_total)
    } else {
        session.total_records + fetched
    };

    let last = page.records.last();
    let last_record_id =
        last.map(|data| extract_record_id(data, &session.key(), packet_number, fetched - 1));
    let last_record_data = last.and_then(|data| serde_json::to_string(data).ok());

    PacketCheckpoint {
        packet_number,
        records_fetched: fetched,
        total_records,
        last_record_id,
        last_record_data,
        packet_processing_time_ms: elapsed_ms,
        processed_at: Utc::now(),
    }
}

async fn record_fetch_failure(
    state: &SessionHandlerState,
    key: &SessionKey,
    packet_number: i64,
    failure: &FetchFailure,
) -> Result<()> {
    error!(
        processing_id = %key,
        packet_number,
        category = failure.category.as_str(),
        http_status = ?failure.http_status,
        attempts = failure.attempts,
        error = %failure,
        "Failed to fetch packet"
    );

    let session_failure = SessionFailure {
        message: failure.message.clone(),
        category: failure.category.as_str().to_string(),
        http_status: failure.http_status.map(i64::from),
    };

    let slot = state.slots.slot(key);
    let mut guard = slot.lock().await;
    guard.loop_active = false;
    if !state
        .persistence
        .fail_session(key, &session_failure, Utc::now())
        .await?
    {
        debug!(processing_id = %key, "Session left ACTIVE during fetch, failure not recorded");
    }
    Ok(())
}

async fn finish_session(state: &SessionHandlerState, key: &SessionKey) -> Result<()> {
    let slot = state.slots.slot(key);
    let mut guard = slot.lock().await;
    guard.loop_active = false;
    let completed = state
        .persistence
        .transition_session(key, &[SessionStatus::Active], SessionStatus::Completed, Utc::now())
        .await?;
    if completed {
        info!(processing_id = %key, "Session completed");
    } else {
        debug!(processing_id = %key, "Session left ACTIVE, not marking completed");
    }
    Ok(())
}
