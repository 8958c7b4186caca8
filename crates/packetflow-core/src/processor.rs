// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record processing collaborator.
//!
//! The engine does not know what a record means. Embedders implement
//! [`RecordProcessor`] with their validation/transformation logic; the packet
//! loop calls it once per record, strictly in index order.

use async_trait::async_trait;
use serde_json::Value;

use crate::persistence::SessionKey;

/// A fetched record handed to the processor.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub key: SessionKey,
    /// Identifier extracted from the payload, or a positional fallback.
    pub record_id: String,
    pub packet_number: i64,
    pub record_index: i64,
    pub data: Value,
}

/// Reason a record could not be processed. The message is classified and
/// stored on the record row.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ProcessingFailure(pub String);

impl ProcessingFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Per-record work performed by the embedding application.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Process one record. A failure is recorded on the record and never
    /// aborts the packet.
    async fn process(&self, record: &FetchedRecord) -> Result<(), ProcessingFailure>;
}

/// Processor that accepts every record.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AcceptAllProcessor;

#[cfg(test)]
#[async_trait]
impl RecordProcessor for AcceptAllProcessor {
    async fn process(&self, _record: &FetchedRecord) -> Result<(), ProcessingFailure> {
        Ok(())
    }
}

/// Identifier for a record payload: the first of `id`, `recordId`, `key`
/// present on an object, otherwise `{activity}-{date}-{packet}-{index}`.
pub fn extract_record_id(
    data: &Value,
    key: &SessionKey,
    packet_number: i64,
    record_index: i64,
) -> String {
    if let Value::Object(map) = data {
        for field in ["id", "recordId", "key"] {
            match map.get(field) {
                Some(Value::String(s)) => return s.clone(),
                Some(Value::Null) | None => continue,
                Some(other) => return other.to_string(),
            }
        }
    }
    format!("{}-{}-{}", key.processing_id(), packet_number, record_index)
}
