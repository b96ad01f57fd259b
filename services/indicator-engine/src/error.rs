//! Error taxonomy for the indicator engine
//!
//! Failures are isolated per session or per indicator key. Lease contention
//! is deliberately absent: losing a lease race is an expected outcome and is
//! reported as a cycle outcome, not an error.

use thiserror::Error;
use types::errors::IdError;
use types::ids::SessionId;

use crate::key::IndicatorKey;

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Rejected at subscribe time; nothing was changed.
    #[error("invalid indicator spec {indicator}: {reason}")]
    InvalidIndicatorSpec { indicator: String, reason: String },

    /// The session was expired or removed; the client must resubscribe.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("session {session_id} would exceed {limit} subscribed indicators")]
    SubscriptionLimit { session_id: SessionId, limit: usize },

    /// Compute function error, panic, or data fetch timeout.
    #[error("computation failed for {key}: {reason}")]
    ComputationFailure { key: IndicatorKey, reason: String },

    /// Not enough history to fill the indicator's window.
    #[error("data gap for {key}: need {required} bars, have {available}")]
    DataGap {
        key: IndicatorKey,
        required: usize,
        available: usize,
    },

    #[error("send to session {session_id} failed: {reason}")]
    TransportSendFailure { session_id: SessionId, reason: String },

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl EngineError {
    /// Stable machine-readable code for client-facing errors.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidIndicatorSpec { .. } => "INVALID_INDICATOR_SPEC",
            EngineError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            EngineError::SubscriptionLimit { .. } => "SUBSCRIPTION_LIMIT",
            EngineError::ComputationFailure { .. } => "COMPUTATION_FAILURE",
            EngineError::DataGap { .. } => "DATA_GAP",
            EngineError::TransportSendFailure { .. } => "TRANSPORT_SEND_FAILURE",
            EngineError::InvalidId(_) => "BAD_REQUEST",
        }
    }

    pub(crate) fn invalid_spec(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidIndicatorSpec {
            indicator: indicator.into(),
            reason: reason.into(),
        }
    }
}
