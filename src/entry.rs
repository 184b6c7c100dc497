use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LedgerError;

/// Amounts are kept to two fractional digits end to end.
pub const AMOUNT_SCALE: u32 = 2;

/// Largest value a `NUMERIC(20,2)` column holds. Applies to single amounts
/// and to resulting balances.
pub const MAX_AMOUNT: Decimal = dec!(999999999999999999.99);

/// Rejects non-positive amounts, amounts above [`MAX_AMOUNT`] and amounts
/// finer than [`AMOUNT_SCALE`].
pub fn validate_amount(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO
        || amount > MAX_AMOUNT
        || amount.normalize().scale() > AMOUNT_SCALE
    {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(())
}

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    OrderRevenue,
    OrderCommission,
    WithdrawalHold,
    WithdrawalCompleted,
    WithdrawalReversed,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderRevenue => "order_revenue",
            Self::OrderCommission => "order_commission",
            Self::WithdrawalHold => "withdrawal_hold",
            Self::WithdrawalCompleted => "withdrawal_completed",
            Self::WithdrawalReversed => "withdrawal_reversed",
            Self::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order_revenue" => Ok(Self::OrderRevenue),
            "order_commission" => Ok(Self::OrderCommission),
            "withdrawal_hold" => Ok(Self::WithdrawalHold),
            "withdrawal_completed" => Ok(Self::WithdrawalCompleted),
            "withdrawal_reversed" => Ok(Self::WithdrawalReversed),
            "adjustment" => Ok(Self::Adjustment),
            other => Err(LedgerError::Storage(format!(
                "unknown transaction type: {other}"
            ))),
        }
    }
}

/// The entity that caused a balance change, e.g. a withdrawal request or an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub table: String,
    pub id: Uuid,
}

impl Reference {
    pub fn new(table: impl Into<String>, id: Uuid) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }

    pub fn withdrawal(id: Uuid) -> Self {
        Self::new("withdrawal_requests", id)
    }
}

/// A requested balance change, handed to [`Ledger::credit`](crate::Ledger::credit)
/// or [`Ledger::debit`](crate::Ledger::debit).
#[derive(Debug, Clone)]
pub struct Posting {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub kind: TransactionType,
    pub reference: Option<Reference>,
    pub note: String,
    pub idempotency_key: Option<String>,
}

impl Posting {
    pub fn new(user_id: Uuid, amount: Decimal, kind: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            kind,
            reference: None,
            note: String::new(),
            idempotency_key: None,
        }
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// A second posting carrying the same key is refused.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Immutable record of one balance change.
///
/// Invariants:
/// - `balance_after == balance_before + amount`
/// - `sequence` is contiguous per user starting at 1
/// - entries are never updated or deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub sequence: i64,
    pub transaction_type: TransactionType,
    /// Positive for credits, negative for debits, zero for audit markers.
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference: Option<Reference>,
    pub note: String,
    /// blake3 digest of the caller-supplied key, never the key itself.
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_consistent(&self) -> bool {
        self.balance_before + self.amount == self.balance_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(dec!(0.01)).is_ok());
        assert!(validate_amount(dec!(100.50)).is_ok());
        assert!(validate_amount(dec!(100.500)).is_ok());

        assert!(matches!(
            validate_amount(Decimal::ZERO),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            validate_amount(dec!(-5)),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            validate_amount(dec!(1.005)),
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[test]
    fn test_validate_amount_upper_bound() {
        assert!(validate_amount(MAX_AMOUNT).is_ok());
        assert!(matches!(
            validate_amount(MAX_AMOUNT + dec!(0.01)),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            validate_amount(Decimal::MAX),
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[test]
    fn test_transaction_type_text_form() {
        for kind in [
            TransactionType::OrderRevenue,
            TransactionType::OrderCommission,
            TransactionType::WithdrawalHold,
            TransactionType::WithdrawalCompleted,
            TransactionType::WithdrawalReversed,
            TransactionType::Adjustment,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionType>().unwrap(), kind);
        }
        assert!("refund".parse::<TransactionType>().is_err());
    }

    #[test]
    fn test_transaction_type_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionType::WithdrawalHold).unwrap();
        assert_eq!(json, "\"withdrawal_hold\"");
    }
}
