// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-wide error type.
//!
//! Every service surfaces [`SyncError`]. Backend failures keep their
//! structured [`StoreError`] so callers can tell a missing procedure (a
//! recoverable skip) from a dead backend.

use thiserror::Error;

use crate::compression::CompressionError;
use crate::storage::traits::StoreError;
use crate::validation::RuleSeverity;

/// Result alias used throughout the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection pool has no free slot
    #[error("connection pool exhausted ({active}/{max} active)")]
    PoolExhausted { active: usize, max: usize },

    /// Circuit breaker rejected the call without invoking it
    #[error("circuit '{circuit}' is open, request rejected")]
    CircuitOpen { circuit: String },

    /// Operation did not complete within its deadline
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Record rejected (or flagged) by the integrity validator
    #[error("validation failed ({severity}): {message}")]
    ValidationFailed { severity: RuleSeverity, message: String },

    /// Cross-table consistency check failed
    #[error("consistency violation in '{check}': {message}")]
    ConsistencyViolation { check: String, message: String },

    /// Backup payload does not match its recorded checksum
    #[error("backup '{backup_id}' is corrupt: expected checksum {expected}, got {actual}")]
    BackupCorrupt {
        backup_id: String,
        expected: String,
        actual: String,
    },

    /// Every recovery strategy in the escalation path failed
    #[error("recovery exhausted for failure '{failure_id}'")]
    RecoveryExhausted { failure_id: String },

    /// Named sync configuration (or failure record, plan, backup) does not exist
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),

    /// Operation shape the core refuses to run
    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),

    /// Malformed operation rejected at the queue boundary
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A dependency of a queued operation terminated unsuccessfully
    #[error("dependency '{dependency}' of operation '{operation}' failed")]
    DependencyFailed { operation: String, dependency: String },

    /// Service is shutting down and no longer accepts work
    #[error("service is shutting down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether a local retry with backoff may succeed.
    ///
    /// Breaker rejections and validation failures are final: they surface to
    /// the caller immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::Timeout { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short, stable label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::BackupCorrupt { .. } => "backup_corrupt",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::ConfigurationNotFound(_) => "configuration_not_found",
            Self::OperationUnsupported(_) => "operation_unsupported",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::Shutdown => "shutdown",
            Self::Store(_) => "store",
            Self::Compression(_) => "compression",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::PoolExhausted { active: 5, max: 5 }.is_transient());
        assert!(SyncError::Timeout { operation: "x".into(), timeout_ms: 10 }.is_transient());
        assert!(SyncError::Store(StoreError::Backend("down".into())).is_transient());

        assert!(!SyncError::CircuitOpen { circuit: "products".into() }.is_transient());
        assert!(!SyncError::ValidationFailed {
            severity: RuleSeverity::Error,
            message: "name required".into(),
        }
        .is_transient());
        assert!(!SyncError::Store(StoreError::ProcedureNotFound("p".into())).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::CircuitOpen { circuit: "products".into() };
        assert_eq!(err.to_string(), "circuit 'products' is open, request rejected");

        let err = SyncError::PoolExhausted { active: 10, max: 10 };
        assert!(err.to_string().contains("10/10"));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(SyncError::Shutdown.kind(), "shutdown");
        assert_eq!(
            SyncError::RecoveryExhausted { failure_id: "f".into() }.kind(),
            "recovery_exhausted"
        );
    }
}
