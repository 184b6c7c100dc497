// src/lib.rs
pub mod adapters;
pub mod audit;
pub mod balance;
pub mod bank_account;
pub mod caller;
pub mod config;
pub mod entry;
pub mod error;
pub mod ledger;
pub mod page;
pub mod withdrawal;
pub mod workflow;

pub use audit::{AuditAction, AuditEvent, AuditObserver, TracingAudit};
pub use balance::BalanceRecord;
pub use bank_account::{BankAccount, BankAccountRegistry, StaticBankAccounts};
pub use caller::{Caller, Role};
pub use config::{ConfigError, LedgerConfig, WithdrawalPolicy};
pub use entry::{LedgerEntry, MAX_AMOUNT, Posting, Reference, TransactionType};
pub use error::{ErrorKind, LedgerError};
pub use ledger::Ledger;
pub use page::{Page, Pagination};
pub use withdrawal::{Resolution, WithdrawalRequest, WithdrawalStatus};
pub use workflow::Withdrawals;

use async_trait::async_trait;
use uuid::Uuid;

pub(crate) fn hash_idempotency_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Which withdrawal requests a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WithdrawalFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<WithdrawalStatus>,
}

impl WithdrawalFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            status: None,
        }
    }

    pub fn with_status(status: Option<WithdrawalStatus>) -> Self {
        Self {
            user_id: None,
            status,
        }
    }

    pub fn matches(&self, request: &WithdrawalRequest) -> bool {
        self.user_id.is_none_or(|u| u == request.user_id)
            && self.status.is_none_or(|s| s == request.status)
    }
}

/// Storage backend for balances, ledger entries and withdrawal requests.
///
/// Writes only happen through a [`LedgerTransaction`] obtained from
/// [`begin`](LedgerAdapter::begin); everything else here is a read.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Open a transaction. Its writes become visible only on commit.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError>;

    /// Return the user's balance, inserting a zero balance if none exists.
    /// Safe to race: concurrent callers all observe the same single record.
    async fn get_or_create_balance(&self, user_id: Uuid) -> Result<BalanceRecord, LedgerError>;

    async fn get_balance(&self, user_id: Uuid) -> Result<Option<BalanceRecord>, LedgerError>;

    /// Newest first.
    async fn list_entries(
        &self,
        user_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<LedgerEntry>, LedgerError>;

    /// Every entry of a user, oldest first.
    async fn replay_entries(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, LedgerError>;

    /// Newest first.
    async fn list_withdrawals(
        &self,
        filter: WithdrawalFilter,
        pagination: Pagination,
    ) -> Result<Page<WithdrawalRequest>, LedgerError>;
}

/// An open unit of work.
///
/// Implementors MUST:
/// 1. Hold every lock taken through `lock_*` until commit, rollback or drop
/// 2. Give up on a lock after the adapter's lock timeout with `LockTimeout`
/// 3. Treat locks as re-entrant within the same transaction
/// 4. Discard all staged writes when dropped without `commit`
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Exclusively lock the user's balance, creating it at zero if absent.
    async fn lock_balance(&mut self, user_id: Uuid) -> Result<BalanceRecord, LedgerError>;

    async fn save_balance(&mut self, balance: &BalanceRecord) -> Result<(), LedgerError>;

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    /// Looks up by hashed key, including entries staged in this transaction.
    async fn find_entry_by_idempotency_key(
        &mut self,
        key_hash: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Exclusively lock a withdrawal request row.
    async fn lock_withdrawal(&mut self, id: Uuid)
    -> Result<Option<WithdrawalRequest>, LedgerError>;

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError>;

    async fn update_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_hashed() {
        let hash = hash_idempotency_key("order-42");
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, "order-42");
        assert_eq!(hash, hash_idempotency_key("order-42"));
        assert_ne!(hash, hash_idempotency_key("order-43"));
    }
}
