//! Error types for the swap coordinator

use crate::swap::{Phase, Side, SwapId};

use serde::Serialize;
use thiserror::Error;

/// Main error type for swap coordination
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwapError {
    #[error("Transient ledger error on {ledger}: {message}")]
    TransientLedger { ledger: String, message: String },

    #[error("Expiry violation on {side} ledger of swap {swap_id}: {message}")]
    ExpiryViolation {
        swap_id: SwapId,
        side: Side,
        message: String,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Swap {0} not found")]
    SwapNotFound(SwapId),

    #[error("Abort rejected for swap {swap_id} in phase {phase}")]
    AbortRejected { swap_id: SwapId, phase: Phase },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: Phase, to: Phase },

    #[error("Insufficient balance for {identity} on {ledger}: have {have}, need {need}")]
    InsufficientBalance {
        ledger: String,
        identity: String,
        have: u128,
        need: u128,
    },

    #[error("Contract rejected action on {ledger}: {message}")]
    ContractRejected { ledger: String, message: String },

    #[error("No ledger adapter configured for {0}")]
    LedgerNotConfigured(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapError::TransientLedger { .. })
    }

    /// Classification surfaced through swap status
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapError::TransientLedger { .. } => ErrorKind::TransientLedger,
            SwapError::ExpiryViolation { .. } => ErrorKind::ExpiryViolation,
            SwapError::Negotiation(_) => ErrorKind::Negotiation,
            SwapError::InvariantViolation(_)
            | SwapError::InvalidStateTransition { .. }
            | SwapError::ContractRejected { .. }
            | SwapError::InsufficientBalance { .. } => ErrorKind::InvariantViolation,
            SwapError::SwapNotFound(_)
            | SwapError::AbortRejected { .. }
            | SwapError::LedgerNotConfigured(_)
            | SwapError::Config(_)
            | SwapError::Internal(_) => ErrorKind::Operational,
        }
    }
}

/// Error classes as seen by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientLedger,
    ExpiryViolation,
    InvariantViolation,
    Negotiation,
    Operational,
}

/// Result type for swap operations
pub type SwapResult<T> = Result<T, SwapError>;
