// src/ledger.rs
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entry::{MAX_AMOUNT, validate_amount};
use crate::{
    BalanceRecord, LedgerAdapter, LedgerEntry, LedgerError, LedgerTransaction, Page, Pagination,
    Posting, Reference, TransactionType, hash_idempotency_key,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Credit,
    Debit,
}

/// The only component that changes a balance.
///
/// Every change locks the user's balance row, writes the new balance and
/// exactly one ledger entry in the same transaction. Operations that take
/// `tx: Option<&mut Box<dyn LedgerTransaction>>` join the caller's transaction when
/// one is given and otherwise open, commit or roll back their own.
#[derive(Clone)]
pub struct Ledger {
    adapter: Arc<dyn LedgerAdapter>,
}

impl Ledger {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    /// Get adapter reference
    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    /// Open a transaction to compose several ledger operations atomically.
    pub async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        self.adapter.begin().await
    }

    pub async fn get_or_create_balance(&self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        self.adapter.get_or_create_balance(user_id).await
    }

    pub async fn credit(
        &self,
        posting: Posting,
        tx: Option<&mut Box<dyn LedgerTransaction>>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.post(posting, Direction::Credit, tx).await
    }

    /// Fails with `InsufficientFunds` when the locked balance is below the amount.
    pub async fn debit(
        &self,
        posting: Posting,
        tx: Option<&mut Box<dyn LedgerTransaction>>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.post(posting, Direction::Debit, tx).await
    }

    /// Append a zero-amount entry. The balance is locked and its version
    /// advanced so the entry takes its place in the chain.
    pub async fn record_confirmation(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        reference: Reference,
        note: String,
        tx: &mut dyn LedgerTransaction,
    ) -> Result<LedgerEntry, LedgerError> {
        let balance = lock_balance(tx, user_id).await?;
        write_entry(tx, balance, Decimal::ZERO, kind, Some(reference), note, None).await
    }

    pub async fn list_entries(
        &self,
        user_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        self.adapter.list_entries(user_id, pagination).await
    }

    /// Replay the user's entries and compare against the stored balance.
    ///
    /// Holds the balance lock while reading so no posting lands in between.
    /// A mismatch is reported, never repaired.
    pub async fn verify_chain(&self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        let mut tx = self.adapter.begin().await?;
        let result = self.verify_locked(tx.as_mut(), user_id).await;
        abort(tx).await;

        if let Err(LedgerError::InvariantViolation(detail)) = &result {
            error!(%user_id, %detail, "ledger chain does not reconcile");
            counter!("saldo.invariant_violations.total").increment(1);
        }
        result
    }

    async fn verify_locked(
        &self,
        tx: &mut dyn LedgerTransaction,
        user_id: Uuid,
    ) -> Result<BalanceRecord, LedgerError> {
        let balance = tx.lock_balance(user_id).await?;
        let entries = self.adapter.replay_entries(user_id).await?;

        let mut running = Decimal::ZERO;
        for (expected_sequence, entry) in (1_i64..).zip(&entries) {
            if entry.sequence != expected_sequence {
                return Err(LedgerError::InvariantViolation(format!(
                    "entry {} has sequence {}, expected {}",
                    entry.id, entry.sequence, expected_sequence
                )));
            }
            if entry.balance_before != running {
                return Err(LedgerError::InvariantViolation(format!(
                    "entry {} starts at {}, previous entry ended at {}",
                    entry.id, entry.balance_before, running
                )));
            }
            if !entry.is_consistent() {
                return Err(LedgerError::InvariantViolation(format!(
                    "entry {}: {} + {} != {}",
                    entry.id, entry.balance_before, entry.amount, entry.balance_after
                )));
            }
            if entry.balance_after < Decimal::ZERO {
                return Err(LedgerError::InvariantViolation(format!(
                    "entry {} leaves a negative balance {}",
                    entry.id, entry.balance_after
                )));
            }
            running = entry.balance_after;
        }

        if balance.available_balance != running || balance.version != entries.len() as i64 {
            return Err(LedgerError::InvariantViolation(format!(
                "balance is {} at version {}, entries replay to {} over {} entries",
                balance.available_balance,
                balance.version,
                running,
                entries.len()
            )));
        }

        Ok(balance)
    }

    async fn post(
        &self,
        posting: Posting,
        direction: Direction,
        tx: Option<&mut Box<dyn LedgerTransaction>>,
    ) -> Result<LedgerEntry, LedgerError> {
        validate_amount(posting.amount)?;
        let kind = posting.kind;
        let joined = tx.is_some();

        let result = match tx {
            Some(tx) => apply(tx.as_mut(), posting, direction).await,
            None => {
                let mut tx = self.adapter.begin().await?;
                match apply(tx.as_mut(), posting, direction).await {
                    Ok(entry) => tx.commit().await.map(|()| entry),
                    Err(e) => {
                        abort(tx).await;
                        Err(e)
                    }
                }
            }
        };

        counter!("saldo.postings.total",
            "type" => kind.as_str(),
            "status" => posting_status(joined, result.is_ok())
        )
        .increment(1);

        result
    }
}

/// A posting made inside the caller's transaction is only `staged`: whether
/// it lands is decided by the caller's commit.
fn posting_status(joined: bool, succeeded: bool) -> &'static str {
    match (joined, succeeded) {
        (_, false) => "failed",
        (true, true) => "staged",
        (false, true) => "success",
    }
}

/// Roll back, logging rather than returning a rollback failure so the
/// original error reaches the caller.
pub(crate) async fn abort(tx: Box<dyn LedgerTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

async fn lock_balance(
    tx: &mut dyn LedgerTransaction,
    user_id: Uuid,
) -> Result<BalanceRecord, LedgerError> {
    let start = Instant::now();
    let result = tx.lock_balance(user_id).await;
    histogram!("saldo.lock.wait_ms").record(start.elapsed().as_millis() as f64);

    if matches!(result, Err(LedgerError::LockTimeout)) {
        warn!(%user_id, "gave up waiting for balance lock");
    }
    result
}

async fn apply(
    tx: &mut dyn LedgerTransaction,
    posting: Posting,
    direction: Direction,
) -> Result<LedgerEntry, LedgerError> {
    let balance = lock_balance(tx, posting.user_id).await?;

    // Catches duplicates for this user. A race across users is left to the
    // adapter's unique check, which reports the same error.
    let key_hash = posting.idempotency_key.as_deref().map(hash_idempotency_key);
    if let Some(hash) = &key_hash {
        if let Some(existing) = tx.find_entry_by_idempotency_key(hash).await? {
            return Err(LedgerError::DuplicateIdempotencyKey(existing.id));
        }
    }

    let amount = match direction {
        Direction::Credit => posting.amount,
        Direction::Debit => {
            if balance.available_balance < posting.amount {
                debug!(
                    user_id = %posting.user_id,
                    available = %balance.available_balance,
                    requested = %posting.amount,
                    "debit refused"
                );
                return Err(LedgerError::InsufficientFunds {
                    available: balance.available_balance,
                    requested: posting.amount,
                });
            }
            -posting.amount
        }
    };

    histogram!("saldo.posting.amount", "type" => posting.kind.as_str())
        .record(posting.amount.to_f64().unwrap_or_default());

    write_entry(
        tx,
        balance,
        amount,
        posting.kind,
        posting.reference,
        posting.note,
        key_hash,
    )
    .await
}

async fn write_entry(
    tx: &mut dyn LedgerTransaction,
    mut balance: BalanceRecord,
    amount: Decimal,
    kind: TransactionType,
    reference: Option<Reference>,
    note: String,
    idempotency_key: Option<String>,
) -> Result<LedgerEntry, LedgerError> {
    let now = Utc::now();
    let balance_before = balance.available_balance;
    let balance_after = balance_before
        .checked_add(amount)
        .filter(|after| *after <= MAX_AMOUNT)
        .ok_or(LedgerError::InvalidAmount)?;

    balance.available_balance = balance_after;
    balance.version += 1;
    balance.updated_at = now;

    let entry = LedgerEntry {
        id: Uuid::now_v7(),
        user_id: balance.user_id,
        sequence: balance.version,
        transaction_type: kind,
        amount,
        balance_before,
        balance_after,
        reference,
        note,
        idempotency_key,
        created_at: now,
    };

    tx.save_balance(&balance).await?;
    tx.append_entry(&entry).await?;

    info!(
        user_id = %entry.user_id,
        entry_id = %entry.id,
        kind = %kind,
        %amount,
        %balance_before,
        %balance_after,
        "balance changed"
    );

    Ok(entry)
}
