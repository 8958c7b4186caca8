// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Paginated HTTP fetch client for packetflow.
//!
//! This crate fetches one bounded page ("packet") of records at a time from an
//! offset/limit HTTP endpoint:
//!
//! - `GET {endpoint}?offset={offset}&limit={limit}` with packet tracking headers
//! - Retries transport failures and 5xx responses with capped exponential backoff
//! - Never retries 4xx responses or unparseable bodies
//! - Extracts pagination metadata from `X-*` response headers, falling back to
//!   body-derived heuristics when the server sends none
//!
//! # Example
//!
//! ```ignore
//! use std::collections::HashMap;
//! use packetflow_http::{PaginationClient, PaginationClientConfig};
//!
//! let client = PaginationClient::new(PaginationClientConfig::default())?;
//! let page = client
//!     .fetch_page("https://api.example.com/records", 0, 10, &HashMap::new())
//!     .await?;
//! println!("{} records, more: {}", page.len(), page.has_more_records);
//! ```

mod client;
mod error;
mod page;
mod retry;

pub use client::{PACKET_PROTOCOL_VERSION, PaginationClient, PaginationClientConfig};
pub use error::{ClientBuildError, FetchErrorCategory, FetchFailure};
pub use page::{PacketMetadata, Page, parse_records};
pub use retry::RetryPolicy;

/// Result of a single page fetch.
pub type PageResult = Result<Page, FetchFailure>;
