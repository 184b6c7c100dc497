//! Error types for balance and withdrawal operations.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::WithdrawalStatus;

/// Every failure the ledger and the withdrawal workflow can report.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount")]
    InvalidAmount,

    #[error("withdrawal of {requested} is below the minimum of {minimum}")]
    BelowMinimumWithdrawal { minimum: Decimal, requested: Decimal },

    #[error("admin fee {fee} exceeds requested amount {requested}")]
    FeeExceedsAmount { fee: Decimal, requested: Decimal },

    #[error("user {0} has no verified bank account")]
    NoVerifiedAccount(Uuid),

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientFunds { available: Decimal, requested: Decimal },

    #[error("withdrawal request {0} not found")]
    NotFound(Uuid),

    #[error("withdrawal request {id} is already {status}")]
    AlreadyProcessed { id: Uuid, status: WithdrawalStatus },

    #[error("caller is not allowed to perform this operation")]
    Forbidden,

    #[error("duplicate idempotency key, already recorded as entry {0}")]
    DuplicateIdempotencyKey(Uuid),

    #[error("timed out waiting for balance lock")]
    LockTimeout,

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-correctable input problem; nothing was persisted.
    Validation,
    /// Expected business outcome; reported verbatim, never retried.
    Precondition,
    /// Transient; the whole operation may be retried from scratch.
    Concurrency,
    /// Needs operator attention.
    Internal,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount
            | Self::BelowMinimumWithdrawal { .. }
            | Self::FeeExceedsAmount { .. } => ErrorKind::Validation,
            Self::NoVerifiedAccount(_)
            | Self::InsufficientFunds { .. }
            | Self::NotFound(_)
            | Self::AlreadyProcessed { .. }
            | Self::Forbidden
            | Self::DuplicateIdempotencyKey(_) => ErrorKind::Precondition,
            Self::LockTimeout => ErrorKind::Concurrency,
            Self::InvariantViolation(_) | Self::Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    /// Message safe to show an end user. Internal failures are not described.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
