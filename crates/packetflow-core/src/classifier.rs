// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Classification of per-record failure messages.
//!
//! The packet loop records the category of every failed record so operators
//! can tell transient failures (worth a manual retry) from permanent ones.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

/// Failure bucket assigned to a record error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorBucket {
    /// Network, timeout, temporary unavailability.
    Transient,
    /// Data format or business rule violations.
    Validation,
    /// Database, resource exhaustion, external service failures.
    System,
    /// Invalid data, unsupported operations.
    Permanent,
}

impl ErrorBucket {
    /// Persisted category string.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::System => "system",
            Self::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::System)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Network, timeout, temporary service unavailability",
            Self::Validation => "Data format, business rule violations",
            Self::System => "Database connection, external service failures",
            Self::Permanent => "Invalid data, unsupported operations",
        }
    }

    /// Backoff scaling for retries of this bucket; 0 means do not retry.
    pub fn retry_delay_multiplier(&self) -> f64 {
        match self {
            Self::Transient => 1.0,
            Self::System => 1.5,
            Self::Validation | Self::Permanent => 0.0,
        }
    }
}

impl fmt::Display for ErrorBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

/// Result of classifying an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub bucket: ErrorBucket,
    pub retryable: bool,
}

impl Classification {
    pub fn category(&self) -> &'static str {
        self.bucket.category()
    }
}

impl From<ErrorBucket> for Classification {
    fn from(bucket: ErrorBucket) -> Self {
        Self {
            bucket,
            retryable: bucket.is_retryable(),
        }
    }
}

/// Maps an error message to a category. Must be pure and deterministic.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error_message: &str) -> Classification;

    fn should_retry(&self, error_message: &str) -> bool {
        self.classify(error_message).retryable
    }
}

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)timeout|connection.*refused|service.*unavailable|network.*error|temporary.*failure|retry.*later",
    )
    .unwrap()
});

static VALIDATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)validation|invalid.*format|missing.*field|constraint.*violation|business.*rule",
    )
    .unwrap()
});

static SYSTEM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)database.*error|connection.*pool|out.*of.*memory|disk.*space|system.*overload",
    )
    .unwrap()
});

static PERMANENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not.*found|unauthorized|forbidden|unsupported.*operation|malformed.*data")
        .unwrap()
});

/// Keyword classifier: buckets are tried in priority order transient,
/// validation, system, permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternErrorClassifier;

impl PatternErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Bucket for a message.
    pub fn bucket(&self, error_message: &str) -> ErrorBucket {
        let message = error_message.trim();
        if message.is_empty() {
            warn!("Empty error message, classifying as permanent");
            return ErrorBucket::Permanent;
        }

        let bucket = if TRANSIENT_PATTERN.is_match(message) {
            ErrorBucket::Transient
        } else if VALIDATION_PATTERN.is_match(message) {
            ErrorBucket::Validation
        } else if SYSTEM_PATTERN.is_match(message) {
            ErrorBucket::System
        } else if PERMANENT_PATTERN.is_match(message) {
            ErrorBucket::Permanent
        } else {
            let lower = message.to_lowercase();
            if lower.contains("exception") || lower.contains("error") {
                ErrorBucket::System
            } else {
                ErrorBucket::Permanent
            }
        };

        debug!(bucket = %bucket, message, "Classified error");
        bucket
    }
}

impl ErrorClassifier for PatternErrorClassifier {
    fn classify(&self, error_message: &str) -> Classification {
        self.bucket(error_message).into()
    }
}
