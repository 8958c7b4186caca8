// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetch failure types.

use std::fmt;

/// Category of a failed page fetch.
///
/// The string forms are persisted on the session row as `error_category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorCategory {
    /// 4xx response, or a request that could not be built. Never retried.
    ClientError,
    /// 5xx response.
    ServerError,
    /// Connect failure or timeout.
    ConnectionError,
    /// The response body could not be read or decoded. Never retried.
    ResponseProcessingError,
    /// Anything else (unexpected status, broken transfer).
    UnknownError,
}

impl FetchErrorCategory {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "CLIENT_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ResponseProcessingError => "RESPONSE_PROCESSING_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether the client retries a failure of this category.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError | Self::ConnectionError | Self::UnknownError
        )
    }
}

impl fmt::Display for FetchErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A page fetch that failed after the client gave up.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FetchFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Failure category.
    pub category: FetchErrorCategory,
    /// HTTP status code, when a response was received.
    pub http_status: Option<u16>,
    /// Number of attempts made before giving up.
    pub attempts: u32,
}

impl FetchFailure {
    /// Create a failure for a single attempt.
    pub fn new(
        message: impl Into<String>,
        category: FetchErrorCategory,
        http_status: Option<u16>,
    ) -> Self {
        Self {
            message: message.into(),
            category,
            http_status,
            attempts: 1,
        }
    }
}

/// Error building the underlying HTTP client.
#[derive(Debug, thiserror::Error)]
#[error("failed to build HTTP client: {0}")]
pub struct ClientBuildError(#[from] reqwest::Error);
