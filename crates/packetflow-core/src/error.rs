// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for packetflow-core.
//!
//! Provides a unified error type with stable string codes for callers that
//! surface errors over an API.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during session processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Session was not found in the store.
    SessionNotFound {
        /// Processing id (`{activity_id}-{application_date}`).
        processing_id: String,
    },

    /// A session already exists for the identity key and cannot be restarted.
    SessionAlreadyExists {
        /// Processing id of the existing session.
        processing_id: String,
        /// Status of the existing session.
        status: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A checkpoint write lost a race with another writer.
    CheckpointConflict {
        /// Processing id.
        processing_id: String,
        /// Packet number that was being checkpointed.
        packet_number: i64,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::SessionAlreadyExists { .. } => "SESSION_ALREADY_EXISTS",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::CheckpointConflict { .. } => "CHECKPOINT_CONFLICT",
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound { processing_id } => {
                write!(f, "Session '{}' not found", processing_id)
            }
            Self::SessionAlreadyExists {
                processing_id,
                status,
            } => {
                write!(
                    f,
                    "Session '{}' already exists with status '{}'",
                    processing_id, status
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::CheckpointConflict {
                processing_id,
                packet_number,
            } => {
                write!(
                    f,
                    "Checkpoint conflict for session '{}' at packet {}",
                    processing_id, packet_number
                )
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::SessionNotFound {
                    processing_id: "act-2025-01-15".to_string(),
                },
                "SESSION_NOT_FOUND",
            ),
            (
                CoreError::SessionAlreadyExists {
                    processing_id: "act-2025-01-15".to_string(),
                    status: "COMPLETED".to_string(),
                },
                "SESSION_ALREADY_EXISTS",
            ),
            (
                CoreError::validation("endpoint_url", "must not be empty"),
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CoreError::CheckpointConflict {
                    processing_id: "act-2025-01-15".to_string(),
                    packet_number: 3,
                },
                "CHECKPOINT_CONFLICT",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::SessionNotFound {
            processing_id: "act-2025-01-15".to_string(),
        };
        assert_eq!(err.to_string(), "Session 'act-2025-01-15' not found");

        let err = CoreError::SessionAlreadyExists {
            processing_id: "act-2025-01-15".to_string(),
            status: "CANCELLED".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Session 'act-2025-01-15' already exists with status 'CANCELLED'"
        );

        let err = CoreError::ValidationError {
            field: "packet_size".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Validation error for 'packet_size': must be positive"
        );

        let err = CoreError::DatabaseError {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );
    }
}
