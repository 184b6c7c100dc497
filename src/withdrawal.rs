use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BankAccount, LedgerError};

/// State of a WithdrawalRequest.
/// State transitions are one-way: pending → completed | rejected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Funds are held, waiting for an admin decision
    Pending,
    /// Transfer was made; held funds are gone for good
    Completed,
    /// Held funds were returned to the balance
    Rejected,
}

impl WithdrawalStatus {
    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: WithdrawalStatus) -> bool {
        match (self, target) {
            (WithdrawalStatus::Pending, WithdrawalStatus::Completed) => true,
            (WithdrawalStatus::Pending, WithdrawalStatus::Rejected) => true,
            // Completed and rejected are terminal
            (WithdrawalStatus::Pending, WithdrawalStatus::Pending) => false,
            (WithdrawalStatus::Completed, _) => false,
            (WithdrawalStatus::Rejected, _) => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, WithdrawalStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "completed" => Ok(WithdrawalStatus::Completed),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            other => Err(LedgerError::Storage(format!(
                "unknown withdrawal status: {other}"
            ))),
        }
    }
}

/// Admin input for resolving a pending request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub admin_notes: Option<String>,
    pub transfer_proof: Option<String>,
    pub bank_reference: Option<String>,
}

impl Resolution {
    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            admin_notes: Some(notes.into()),
            ..Self::default()
        }
    }
}

/// A user's request to move funds out to a bank account.
///
/// Invariants:
/// - `amount_payable == amount_requested - admin_fee` and is never negative
/// - the full `amount_requested` is held from the balance while pending
/// - `processed_at` is set exactly when the status becomes terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bank_account_id: Uuid,
    /// Account details as they were when the request was made
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
    pub amount_requested: Decimal,
    pub admin_fee: Decimal,
    pub amount_payable: Decimal,
    pub status: WithdrawalStatus,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<Uuid>,
    pub admin_notes: Option<String>,
    pub transfer_proof: Option<String>,
    pub bank_reference: Option<String>,
}

impl WithdrawalRequest {
    /// Create a new pending request
    pub fn new_pending(
        id: Uuid,
        user_id: Uuid,
        account: &BankAccount,
        amount_requested: Decimal,
        admin_fee: Decimal,
    ) -> Self {
        Self {
            id,
            user_id,
            bank_account_id: account.id,
            bank_name: account.bank_name.clone(),
            account_number: account.account_number.clone(),
            account_holder: account.account_holder.clone(),
            amount_requested,
            admin_fee,
            amount_payable: amount_requested - admin_fee,
            status: WithdrawalStatus::Pending,
            requested_at: Utc::now(),
            processed_at: None,
            processed_by: None,
            admin_notes: None,
            transfer_proof: None,
            bank_reference: None,
        }
    }

    /// Move to a terminal status, recording who did it and why.
    pub fn resolve(
        &mut self,
        target: WithdrawalStatus,
        admin: Uuid,
        resolution: Resolution,
    ) -> Result<(), LedgerError> {
        if !self.status.can_transition_to(target) {
            return Err(LedgerError::AlreadyProcessed {
                id: self.id,
                status: self.status,
            });
        }

        self.status = target;
        self.processed_at = Some(Utc::now());
        self.processed_by = Some(admin);
        self.admin_notes = resolution.admin_notes;
        self.transfer_proof = resolution.transfer_proof;
        self.bank_reference = resolution.bank_reference;
        Ok(())
    }
}
