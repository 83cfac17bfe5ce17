//! Error types for the swap engine
//!
//! Every failure surfaced by the coordinator is a [`SwapError`]. Callers that
//! need a machine-readable tag use [`SwapError::kind`]; the HTTP layer maps
//! the kind to a status code and emits `{ "kind", "message" }`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::SwapStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwapError {
    // ========================================================================
    // Caller Errors
    // ========================================================================

    #[error("Invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("Unauthorized: {member} is not an emergency council member")]
    Unauthorized { member: String },

    #[error(
        "Rate limit exceeded: {limit} initiations per {window_seconds}s, retry in {retry_after_seconds}s"
    )]
    RateLimitExceeded {
        limit: u32,
        window_seconds: u64,
        retry_after_seconds: u64,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================

    #[error("Unknown swap: {swap_id}")]
    UnknownSwap { swap_id: String },

    #[error("Unknown operation: {operation_id}")]
    UnknownOperation { operation_id: String },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================

    #[error("Not ready: {reason}")]
    NotReady { reason: String },

    #[error("Invalid preimage: hash does not match hash lock")]
    InvalidPreimage,

    #[error("Timelock not expired: {remaining_seconds} seconds remaining")]
    TimelockNotExpired { remaining_seconds: u64 },

    #[error("Timelock expired at {deadline}: refund is the only valid path")]
    TimelockExpired { deadline: DateTime<Utc> },

    #[error("Swap already {status}")]
    StateConflict { status: SwapStatus },

    // ========================================================================
    // Safety Errors
    // ========================================================================

    #[error("Operation paused: {reason}")]
    OperationPaused { reason: String },

    // ========================================================================
    // Infrastructure Errors
    // ========================================================================

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl SwapError {
    /// Shorthand for [`SwapError::InvalidParameters`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        SwapError::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SwapError::Storage`]
    pub fn storage(reason: impl fmt::Display) -> Self {
        SwapError::Storage {
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapError::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            SwapError::Unauthorized { .. } => ErrorKind::Unauthorized,
            SwapError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            SwapError::UnknownSwap { .. } => ErrorKind::UnknownSwap,
            SwapError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            SwapError::NotReady { .. } => ErrorKind::NotReady,
            SwapError::InvalidPreimage => ErrorKind::InvalidPreimage,
            SwapError::TimelockNotExpired { .. } => ErrorKind::TimelockNotExpired,
            SwapError::TimelockExpired { .. } => ErrorKind::TimelockExpired,
            SwapError::StateConflict { .. } => ErrorKind::StateConflict,
            SwapError::OperationPaused { .. } => ErrorKind::OperationPaused,
            SwapError::Storage { .. } => ErrorKind::Storage,
        }
    }
}

/// Machine-readable error tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameters,
    Unauthorized,
    RateLimitExceeded,
    UnknownSwap,
    UnknownOperation,
    NotReady,
    InvalidPreimage,
    TimelockNotExpired,
    TimelockExpired,
    StateConflict,
    OperationPaused,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::UnknownSwap => "unknown_swap",
            ErrorKind::UnknownOperation => "unknown_operation",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::InvalidPreimage => "invalid_preimage",
            ErrorKind::TimelockNotExpired => "timelock_not_expired",
            ErrorKind::TimelockExpired => "timelock_expired",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::OperationPaused => "operation_paused",
            ErrorKind::Storage => "storage",
        }
    }

    /// Whether the same request may succeed later without changes
    ///
    /// `TimelockExpired` is not retryable: the caller has to switch to refund.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::NotReady
                | ErrorKind::TimelockNotExpired
                | ErrorKind::OperationPaused
                | ErrorKind::Storage
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
