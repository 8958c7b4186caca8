// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Offset/limit pagination client.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::PageResult;
use crate::error::{ClientBuildError, FetchErrorCategory, FetchFailure};
use crate::page::{PacketMetadata, Page, parse_records};
use crate::retry::RetryPolicy;

/// Value of the `X-Packet-Version` request header.
pub const PACKET_PROTOCOL_VERSION: &str = "1.0";

// Lowercase for `HeaderName::from_static`.
const HEADER_OFFSET: &str = "x-packet-offset";
const HEADER_LIMIT: &str = "x-packet-limit";
const HEADER_REQUEST_TIME: &str = "x-packet-request-time";
const HEADER_REQUEST_ID: &str = "x-packet-request-id";
const HEADER_CLIENT: &str = "x-packet-client";
const HEADER_VERSION: &str = "x-packet-version";

/// Pagination client configuration.
#[derive(Debug, Clone)]
pub struct PaginationClientConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout (connect + headers + body).
    pub request_timeout: Duration,
    /// Retry policy for retryable failures.
    pub retry: RetryPolicy,
    /// Sent as `X-Packet-Client`.
    pub client_id: String,
}

impl Default for PaginationClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(30000),
            retry: RetryPolicy::packet_processing(),
            client_id: "packetflow".to_string(),
        }
    }
}

/// HTTP client that fetches one page of records per call.
#[derive(Debug, Clone)]
pub struct PaginationClient {
    client: reqwest::Client,
    retry: RetryPolicy,
    client_id: String,
}

impl PaginationClient {
    /// Build a client from configuration.
    pub fn new(config: PaginationClientConfig) -> Result<Self, ClientBuildError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            retry: config.retry,
            client_id: config.client_id,
        })
    }

    /// Fetch the page at `offset` holding at most `limit` records.
    ///
    /// Retryable failures (5xx, connect/timeout, unexpected transport errors)
    /// are retried according to the retry policy. 4xx responses and
    /// undecodable bodies fail immediately.
    pub async fn fetch_page(
        &self,
        endpoint_url: &str,
        offset: u64,
        limit: u32,
        headers: &HashMap<String, String>,
    ) -> PageResult {
        let url = page_url(endpoint_url, offset, limit);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request_id = Uuid::new_v4().to_string();
            debug!(
                url = %url,
                offset,
                limit,
                attempt,
                request_id = %request_id,
                "Fetching packet"
            );

            match self.fetch_once(&url, offset, limit, headers, &request_id).await {
                Ok(page) => {
                    debug!(
                        offset,
                        records = page.len(),
                        has_more = page.has_more_records,
                        next_offset = page.next_offset,
                        attempt,
                        "Packet fetched"
                    );
                    return Ok(page);
                }
                Err(mut failure) => {
                    failure.attempts = attempt;
                    if !failure.category.is_retryable() || attempt >= max_attempts {
                        warn!(
                            url = %url,
                            offset,
                            attempt,
                            category = %failure.category,
                            http_status = ?failure.http_status,
                            error = %failure.message,
                            "Packet fetch failed"
                        );
                        return Err(failure);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        url = %url,
                        offset,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        category = %failure.category,
                        error = %failure.message,
                        "Retrying packet fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        offset: u64,
        limit: u32,
        caller_headers: &HashMap<String, String>,
        request_id: &str,
    ) -> PageResult {
        let headers = self.request_headers(offset, limit, caller_headers, request_id)?;

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchFailure::new(
                format!("Client error: {status} - {body}"),
                FetchErrorCategory::ClientError,
                Some(status.as_u16()),
            ));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchFailure::new(
                format!("Server error: {status} - {body}"),
                FetchErrorCategory::ServerError,
                Some(status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(FetchFailure::new(
                format!("Unexpected error: unexpected status {status}"),
                FetchErrorCategory::UnknownError,
                Some(status.as_u16()),
            ));
        }

        let metadata = PacketMetadata::from_headers(response.headers());
        let body = response.text().await.map_err(|e| {
            FetchFailure::new(
                format!("Response processing error: {e}"),
                FetchErrorCategory::ResponseProcessingError,
                Some(status.as_u16()),
            )
        })?;
        let records = parse_records(&body).map_err(|e| {
            FetchFailure::new(
                format!("Response processing error: {e}"),
                FetchErrorCategory::ResponseProcessingError,
                Some(status.as_u16()),
            )
        })?;

        Ok(Page::new(records, metadata, offset, limit, status.as_u16()))
    }

    /// Caller headers first, then the packet tracking headers.
    fn request_headers(
        &self,
        offset: u64,
        limit: u32,
        caller_headers: &HashMap<String, String>,
        request_id: &str,
    ) -> Result<HeaderMap, FetchFailure> {
        let mut headers = HeaderMap::new();
        for (name, value) in caller_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                FetchFailure::new(
                    format!("Client error: invalid header name '{name}': {e}"),
                    FetchErrorCategory::ClientError,
                    None,
                )
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                FetchFailure::new(
                    format!("Client error: invalid value for header '{name}': {e}"),
                    FetchErrorCategory::ClientError,
                    None,
                )
            })?;
            headers.insert(name, value);
        }

        let tracking = [
            (HEADER_OFFSET, offset.to_string()),
            (HEADER_LIMIT, limit.to_string()),
            (HEADER_REQUEST_TIME, Utc::now().timestamp_millis().to_string()),
            (HEADER_REQUEST_ID, request_id.to_string()),
            (HEADER_CLIENT, self.client_id.clone()),
            (HEADER_VERSION, PACKET_PROTOCOL_VERSION.to_string()),
        ];
        for (name, value) in tracking {
            let value = HeaderValue::from_str(&value).map_err(|e| {
                FetchFailure::new(
                    format!("Client error: invalid value for header '{name}': {e}"),
                    FetchErrorCategory::ClientError,
                    None,
                )
            })?;
            headers.insert(HeaderName::from_static(name), value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }
}

fn page_url(endpoint_url: &str, offset: u64, limit: u32) -> String {
    let separator = if endpoint_url.contains('?') { '&' } else { '?' };
    format!("{endpoint_url}{separator}offset={offset}&limit={limit}")
}

fn transport_failure(e: reqwest::Error) -> FetchFailure {
    if e.is_builder() {
        FetchFailure::new(
            format!("Client error: {e}"),
            FetchErrorCategory::ClientError,
            None,
        )
    } else if e.is_connect() || e.is_timeout() {
        FetchFailure::new(
            format!("Connection error: {e}"),
            FetchErrorCategory::ConnectionError,
            None,
        )
    } else {
        FetchFailure::new(
            format!("Unexpected error: {e}"),
            FetchErrorCategory::UnknownError,
            None,
        )
    }
}
