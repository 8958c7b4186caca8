// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetched page and pagination metadata.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub(crate) const HEADER_TOTAL_RECORDS: &str = "X-Total-Records";
pub(crate) const HEADER_HAS_MORE_RECORDS: &str = "X-Has-More-Records";
pub(crate) const HEADER_NEXT_OFFSET: &str = "X-Next-Offset";
pub(crate) const HEADER_CURRENT_OFFSET: &str = "X-Current-Offset";
pub(crate) const HEADER_PACKET_SIZE: &str = "X-Packet-Size";
pub(crate) const HEADER_SERVER_PROCESSING_TIME: &str = "X-Server-Processing-Time";
pub(crate) const HEADER_SERVER_TIMESTAMP: &str = "X-Server-Timestamp";

/// Wrapper fields recognized when the body is an object.
const WRAPPER_FIELDS: [&str; 3] = ["data", "records", "items"];

/// Pagination metadata as reported by the server.
///
/// Missing or unparseable headers leave the field at zero/false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMetadata {
    pub total_records: u64,
    pub has_more_records: bool,
    pub next_offset: u64,
    pub current_offset: u64,
    pub packet_size: u64,
    pub server_processing_time_ms: u64,
    pub server_timestamp: Option<String>,
}

impl PacketMetadata {
    /// Extract metadata from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            total_records: numeric_header(headers, HEADER_TOTAL_RECORDS),
            has_more_records: header_str(headers, HEADER_HAS_MORE_RECORDS)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            next_offset: numeric_header(headers, HEADER_NEXT_OFFSET),
            current_offset: numeric_header(headers, HEADER_CURRENT_OFFSET),
            packet_size: numeric_header(headers, HEADER_PACKET_SIZE),
            server_processing_time_ms: numeric_header(headers, HEADER_SERVER_PROCESSING_TIME),
            server_timestamp: header_str(headers, HEADER_SERVER_TIMESTAMP)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

fn numeric_header(headers: &HeaderMap, name: &str) -> u64 {
    match header_str(headers, name) {
        None | Some("") => 0,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(header = name, value = raw, "Ignoring unparseable pagination header");
            0
        }),
    }
}

/// One successfully fetched page of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Decoded records, in server order.
    pub records: Vec<Value>,
    /// Raw server-reported metadata.
    pub metadata: PacketMetadata,
    /// Requested offset.
    pub offset: u64,
    /// Requested limit.
    pub limit: u32,
    /// Server flag OR'd with "page was full" (at least `limit` records).
    pub has_more_records: bool,
    /// Server next offset if reported, else `offset + records.len()`.
    pub next_offset: u64,
    /// HTTP status of the successful response.
    pub http_status: u16,
    /// When the response was received.
    pub fetched_at: DateTime<Utc>,
}

impl Page {
    /// Build a page, resolving continuation fields from metadata and
    /// the fetched count.
    pub fn new(
        records: Vec<Value>,
        metadata: PacketMetadata,
        offset: u64,
        limit: u32,
        http_status: u16,
    ) -> Self {
        let fetched = records.len() as u64;
        let has_more_records = metadata.has_more_records || fetched >= u64::from(limit);
        let next_offset = if metadata.next_offset > 0 {
            metadata.next_offset
        } else {
            offset + fetched
        };

        Self {
            records,
            metadata,
            offset,
            limit,
            has_more_records,
            next_offset,
            http_status,
            fetched_at: Utc::now(),
        }
    }

    /// Number of records in the page.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the server returned no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decode a response body into a record list.
///
/// Accepted shapes: a top-level array; an object whose first present
/// `data`/`records`/`items` field is an array; anything else becomes a
/// single record. An empty body yields no records.
pub fn parse_records(body: &str) -> Result<Vec<Value>, serde_json::Error> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(body)?;
    let records = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let wrapper = WRAPPER_FIELDS.iter().find(|field| map.contains_key(**field));
            match wrapper {
                Some(field) if map.get(*field).is_some_and(Value::is_array) => {
                    match map.remove(*field) {
                        Some(Value::Array(items)) => items,
                        _ => Vec::new(),
                    }
                }
                _ => vec![Value::Object(map)],
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    };
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_parse_top_level_array() {
        let records = parse_records(r#"[{"id":1},{"id":2}]"#).unwrap();
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[test]
    fn test_parse_wrapper_fields() {
        for field in ["data", "records", "items"] {
            let body = format!(r#"{{"{field}":[{{"id":"a"}}],"meta":{{}}}}"#);
            let records = parse_records(&body).unwrap();
            assert_eq!(records, vec![json!({"id": "a"})], "field {field}");
        }
    }

    #[test]
    fn test_parse_wrapper_priority() {
        let records = parse_records(r#"{"items":[3],"data":[1,2]}"#).unwrap();
        assert_eq!(records, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_parse_non_array_wrapper_is_single_record() {
        let records = parse_records(r#"{"data":{"id":7}}"#).unwrap();
        assert_eq!(records, vec![json!({"data": {"id": 7}})]);
    }

    #[test]
    fn test_parse_plain_object_is_single_record() {
        let records = parse_records(r#"{"id":"only"}"#).unwrap();
        assert_eq!(records, vec![json!({"id": "only"})]);
    }

    #[test]
    fn test_parse_empty_body() {
        assert!(parse_records("").unwrap().is_empty());
        assert!(parse_records("  \n").unwrap().is_empty());
        assert!(parse_records("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_records("{not json").is_err());
    }

    #[test]
    fn test_metadata_from_headers() {
        let map = headers(&[
            ("X-Total-Records", "123"),
            ("X-Has-More-Records", "TRUE"),
            ("X-Next-Offset", "20"),
            ("X-Current-Offset", "10"),
            ("X-Packet-Size", "10"),
            ("X-Server-Processing-Time", "42"),
            ("X-Server-Timestamp", "2025-01-01T00:00:00Z"),
        ]);
        let meta = PacketMetadata::from_headers(&map);
        assert_eq!(meta.total_records, 123);
        assert!(meta.has_more_records);
        assert_eq!(meta.next_offset, 20);
        assert_eq!(meta.current_offset, 10);
        assert_eq!(meta.packet_size, 10);
        assert_eq!(meta.server_processing_time_ms, 42);
        assert_eq!(meta.server_timestamp.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_metadata_has_more_accepts_one() {
        let meta = PacketMetadata::from_headers(&headers(&[("X-Has-More-Records", "1")]));
        assert!(meta.has_more_records);

        let meta = PacketMetadata::from_headers(&headers(&[("X-Has-More-Records", "yes")]));
        assert!(!meta.has_more_records);
    }

    #[test]
    fn test_metadata_unparseable_defaults_to_zero() {
        let map = headers(&[("X-Total-Records", "lots"), ("X-Next-Offset", "-5")]);
        let meta = PacketMetadata::from_headers(&map);
        assert_eq!(meta, PacketMetadata::default());
    }

    #[test]
    fn test_page_fallback_without_headers() {
        let full = Page::new(vec![json!(1); 10], PacketMetadata::default(), 20, 10, 200);
        assert!(full.has_more_records);
        assert_eq!(full.next_offset, 30);

        let short = Page::new(vec![json!(1); 3], PacketMetadata::default(), 20, 10, 200);
        assert!(!short.has_more_records);
        assert_eq!(short.next_offset, 23);
    }

    #[test]
    fn test_overfull_page_has_more() {
        // Servers that ignore the limit and send more rows still continue
        let page = Page::new(vec![json!(1); 12], PacketMetadata::default(), 0, 10, 200);
        assert!(page.has_more_records);
        assert_eq!(page.next_offset, 12);
    }

    #[test]
    fn test_page_prefers_header_values() {
        let meta = PacketMetadata {
            total_records: 500,
            has_more_records: true,
            next_offset: 100,
            ..Default::default()
        };
        let page = Page::new(vec![json!(1); 3], meta, 0, 10, 200);
        assert!(page.has_more_records);
        assert_eq!(page.next_offset, 100);
        assert_eq!(page.metadata.total_records, 500);
        assert_eq!(page.len(), 3);
    }
}
