//! # Queue Error Types
//!
//! Error types for the fiscal queue runtime.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Queue Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Provider     │  │      Domain             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Provider       │  │  ShiftNotOpen           │ │
//! │  │  ConfigLoad     │  │  ProviderTimeout│  │  PendingOperations      │ │
//! │  │  ConfigSave     │  │                 │  │  MissingTaxCode, ...    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │    Runtime      │                              │
//! │  │                 │  │                 │                              │
//! │  │  Database(..)   │  │  ShuttingDown   │                              │
//! │  │  Serialization  │  │  Internal       │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Domain errors surfacing from the database layer are unwrapped into
//! [`QueueError::Domain`] so callers can match on the fiscal rule that failed.

use thiserror::Error;
use vendfisc_core::{CoreError, FailureClass};
use vendfisc_db::DbError;

use crate::provider::ProviderError;

/// Result type alias for queue runtime operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors of the queue runtime.
#[derive(Debug, Error)]
pub enum QueueError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Repository operation failed.
    #[error("Database error: {0}")]
    Database(DbError),

    /// Payload or result could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Fiscal Errors
    // =========================================================================
    /// A fiscal rule refused the operation.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// The provider rejected or failed the call.
    #[error("Provider error ({class}): {message}")]
    Provider { class: FailureClass, message: String },

    /// The provider did not answer in time.
    #[error("Provider timeout after {0} ms")]
    ProviderTimeout(u64),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The worker pool is shutting down.
    #[error("Queue runtime is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Domain(core) => QueueError::Domain(core),
            other => QueueError::Database(other),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for QueueError {
    fn from(err: toml::de::Error) -> Self {
        QueueError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for QueueError {
    fn from(err: toml::ser::Error) -> Self {
        QueueError::ConfigSaveFailed(err.to_string())
    }
}

impl From<ProviderError> for QueueError {
    fn from(err: ProviderError) -> Self {
        QueueError::Provider {
            class: err.class,
            message: err.message,
        }
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl QueueError {
    /// Returns true if the operation may succeed when tried again later.
    ///
    /// ## Retryable Errors
    /// - Transient database failures (pool exhausted, locked)
    /// - Provider timeouts and transient provider failures
    /// - Precondition failures (no open shift yet, pending operations)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Permanent provider rejections
    /// - Validation and invariant violations
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Database(e) => e.is_transient(),
            QueueError::ProviderTimeout(_) => true,
            QueueError::Provider { class, .. } => class.is_retryable(),
            QueueError::Domain(e) => e.failure_class().is_retryable(),
            _ => false,
        }
    }

    /// How a queue item failing with this error is treated.
    ///
    /// Anything the worker cannot classify is treated as transient so the
    /// item is retried rather than lost.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            QueueError::Domain(e) => e.failure_class(),
            QueueError::Provider { class, .. } => *class,
            QueueError::Serialization(_) => FailureClass::Permanent,
            _ => FailureClass::Transient,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidConfig(_)
                | QueueError::ConfigLoadFailed(_)
                | QueueError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_domain_errors_are_unwrapped() {
        let err: QueueError = DbError::Domain(CoreError::NoOpenShift {
            device_id: "D1".to_string(),
        })
        .into();
        assert!(matches!(err, QueueError::Domain(CoreError::NoOpenShift { .. })));
        assert_eq!(err.failure_class(), FailureClass::Precondition);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_categorization() {
        assert!(QueueError::ProviderTimeout(30_000).is_retryable());
        assert!(!QueueError::Provider {
            class: FailureClass::Permanent,
            message: "rejected".to_string(),
        }
        .is_retryable());
        assert!(!QueueError::InvalidConfig("x".to_string()).is_retryable());
        assert!(QueueError::InvalidConfig("x".to_string()).is_config_error());
        assert_eq!(
            QueueError::Internal("boom".to_string()).failure_class(),
            FailureClass::Transient
        );
    }
}
