// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for packetflow-core integration tests.
//!
//! Provides in-memory SQLite handler state, an offset-driven page source with
//! failure injection and gating, and a processor that fails chosen records.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Semaphore;

use packetflow_core::fetcher::PageSource;
use packetflow_core::migrations;
use packetflow_core::persistence::{SessionKey, SessionRecord, SessionStatus, SqlitePersistence};
use packetflow_core::processor::{FetchedRecord, ProcessingFailure, RecordProcessor};
use packetflow_core::session_handlers::{EngineSettings, SessionHandlerState};
use packetflow_http::{FetchFailure, PacketMetadata, Page, PageResult};

/// Skip the test unless a PostgreSQL test database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

pub fn application_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
}

pub fn session_key(activity_id: &str) -> SessionKey {
    SessionKey::new(activity_id, application_date())
}

/// Fresh in-memory SQLite store with migrations applied.
pub async fn sqlite_persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::SQLITE
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

/// Handler state over a fresh SQLite store.
pub async fn test_state(
    source: Arc<dyn PageSource>,
    processor: Arc<dyn RecordProcessor>,
) -> Arc<SessionHandlerState> {
    let state = SessionHandlerState::new(sqlite_persistence().await, source, processor)
        .with_settings(EngineSettings {
            default_packet_size: 10,
            record_max_retries: 2,
        });
    Arc::new(state)
}

/// A fetch observed by [`OffsetSource`].
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub endpoint_url: String,
    pub offset: u64,
    pub limit: u32,
    pub headers: HashMap<String, String>,
}

/// Serves `total` records `{"id": "rec-N", "n": N}` by offset.
///
/// Queued failures are returned (one per call) before any page is served.
/// A gated source waits for a semaphore permit before every fetch. An
/// overfilling source returns `extra` rows beyond the requested limit.
pub struct OffsetSource {
    total: u64,
    extra: u64,
    panic_next: AtomicBool,
    requested: AtomicU64,
    calls: Mutex<Vec<FetchCall>>,
    failures: Mutex<VecDeque<FetchFailure>>,
    gate: Option<Arc<Semaphore>>,
}

impl OffsetSource {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            extra: 0,
            panic_next: AtomicBool::new(false),
            requested: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
        }
    }

    /// Source whose fetches each need a permit from the returned semaphore.
    pub fn gated(total: u64) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut source = Self::new(total);
        source.gate = Some(gate.clone());
        (source, gate)
    }

    /// Source that ignores the limit and sends `extra` more rows per page.
    pub fn overfilling(total: u64, extra: u64) -> Self {
        let mut source = Self::new(total);
        source.extra = extra;
        source
    }

    /// Make the next fetch panic.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn fail_next(&self, failure: FetchFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.calls().into_iter().map(|c| c.offset).collect()
    }

    /// Fetches entered so far, including ones still waiting on the gate.
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait until `n` fetches have been entered.
    pub async fn wait_for_requests(&self, n: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.requested() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!("only {} of {} fetches requested", self.requested(), n);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PageSource for OffsetSource {
    async fn fetch_page(
        &self,
        endpoint_url: &str,
        offset: u64,
        limit: u32,
        headers: &HashMap<String, String>,
    ) -> PageResult {
        self.requested.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.calls.lock().unwrap().push(FetchCall {
            endpoint_url: endpoint_url.to_string(),
            offset,
            limit,
            headers: headers.clone(),
        });

        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("page source exploded at offset {offset}");
        }

        let end = (offset + u64::from(limit) + self.extra).min(self.total);
        let records = (offset..end)
            .map(|n| json!({"id": format!("rec-{n}"), "n": n}))
            .collect();
        Ok(Page::new(records, PacketMetadata::default(), offset, limit, 200))
    }
}

/// Processor failing records whose id is in a configurable set.
pub struct SelectiveProcessor {
    failing: Mutex<HashSet<String>>,
    message: String,
    seen: Mutex<Vec<String>>,
}

impl SelectiveProcessor {
    pub fn accepting() -> Self {
        Self::failing(&[], "")
    }

    pub fn failing(ids: &[&str], message: &str) -> Self {
        Self {
            failing: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            message: message.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Stop failing any record.
    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Record ids in the order they were processed.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

/// Processor that panics on one record id and accepts the rest.
pub struct PanickingProcessor {
    record_id: String,
}

impl PanickingProcessor {
    pub fn on(record_id: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
        }
    }
}

#[async_trait]
impl RecordProcessor for PanickingProcessor {
    async fn process(&self, record: &FetchedRecord) -> Result<(), ProcessingFailure> {
        if record.record_id == self.record_id {
            panic!("boom on {}", record.record_id);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordProcessor for SelectiveProcessor {
    async fn process(&self, record: &FetchedRecord) -> Result<(), ProcessingFailure> {
        self.seen.lock().unwrap().push(record.record_id.clone());
        if self.failing.lock().unwrap().contains(&record.record_id) {
            return Err(ProcessingFailure::new(self.message.clone()));
        }
        Ok(())
    }
}

/// Poll until the session has `status` and no loop owns it.
pub async fn wait_for_settled(
    state: &SessionHandlerState,
    key: &SessionKey,
    status: SessionStatus,
) -> SessionRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let session = state
            .persistence
            .get_session(key)
            .await
            .expect("get_session failed")
            .expect("session missing");
        if session.status == status && !state.is_loop_active(key).await {
            return session;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "session {} stuck in {} (wanted {})",
                key, session.status, status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds for the session.
pub async fn wait_until<F>(state: &SessionHandlerState, key: &SessionKey, check: F) -> SessionRecord
where
    F: Fn(&SessionRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let session = state
            .persistence
            .get_session(key)
            .await
            .expect("get_session failed")
            .expect("session missing");
        if check(&session) {
            return session;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition never met for session {}", key);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
