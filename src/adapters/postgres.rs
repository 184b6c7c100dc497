// src/adapters/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::{
    BalanceRecord, BankAccount, BankAccountRegistry, LedgerAdapter, LedgerEntry, LedgerError,
    LedgerTransaction, Page, Pagination, Reference, WithdrawalFilter, WithdrawalRequest,
};

use super::DEFAULT_LOCK_TIMEOUT;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const UNIQUE_VIOLATION: &str = "23505";

const IDEMPOTENCY_CONSTRAINT: &str = "uq_ledger_entries_idempotency_key";

const BALANCE_COLUMNS: &str = "user_id, available_balance, version, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, user_id, sequence, transaction_type, amount, balance_before, \
     balance_after, reference_table, reference_id, note, idempotency_key, created_at";

const WITHDRAWAL_COLUMNS: &str = "id, user_id, bank_account_id, bank_name, account_number, \
     account_holder, amount_requested, admin_fee, amount_payable, status, requested_at, \
     processed_at, processed_by, admin_notes, transfer_proof, bank_reference";

fn db_err(e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return LedgerError::LockTimeout;
        }
    }
    LedgerError::Storage(e.to_string())
}

fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(UNIQUE_VIOLATION) && db.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// PostgreSQL adapter.
///
/// Schema (created by [`init_schema`](PostgresAdapter::init_schema)):
/// ```sql
/// CREATE TABLE user_balances (
///     user_id UUID PRIMARY KEY,
///     available_balance NUMERIC(20,2) NOT NULL CHECK (available_balance >= 0),
///     version BIGINT NOT NULL,
///     ...
/// );
/// CREATE TABLE balance_ledger_entries (..., UNIQUE (user_id, sequence));
/// CREATE TABLE withdrawal_requests (...);
/// ```
///
/// Bank accounts are read from an existing `bank_accounts` table
/// (`id, user_id, bank_name, account_number, account_holder, is_verified`)
/// that this adapter never writes.
#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Balances
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_balances (
                user_id UUID PRIMARY KEY,
                available_balance NUMERIC(20,2) NOT NULL DEFAULT 0
                    CHECK (available_balance >= 0),
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Ledger entries, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_ledger_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL REFERENCES user_balances(user_id),
                sequence BIGINT NOT NULL,
                transaction_type TEXT NOT NULL CHECK (transaction_type IN (
                    'order_revenue', 'order_commission', 'withdrawal_hold',
                    'withdrawal_completed', 'withdrawal_reversed', 'adjustment'
                )),
                amount NUMERIC(20,2) NOT NULL,
                balance_before NUMERIC(20,2) NOT NULL,
                balance_after NUMERIC(20,2) NOT NULL CHECK (balance_after >= 0),
                reference_table TEXT,
                reference_id UUID,
                note TEXT NOT NULL DEFAULT '',
                idempotency_key TEXT CONSTRAINT uq_ledger_entries_idempotency_key UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (user_id, sequence),
                CHECK (balance_after = balance_before + amount)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_reference
            ON balance_ledger_entries(reference_table, reference_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Withdrawal requests
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS withdrawal_requests (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                bank_account_id UUID NOT NULL,
                bank_name TEXT NOT NULL,
                account_number TEXT NOT NULL,
                account_holder TEXT NOT NULL,
                amount_requested NUMERIC(20,2) NOT NULL CHECK (amount_requested > 0),
                admin_fee NUMERIC(20,2) NOT NULL CHECK (admin_fee >= 0),
                amount_payable NUMERIC(20,2) NOT NULL CHECK (amount_payable >= 0),
                status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'rejected')),
                requested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                processed_at TIMESTAMPTZ,
                processed_by UUID,
                admin_notes TEXT,
                transfer_proof TEXT,
                bank_reference TEXT
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_withdrawal_requests_user
            ON withdrawal_requests(user_id, requested_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_withdrawal_requests_status
            ON withdrawal_requests(status, requested_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(())
    }
}

fn balance_from_row(row: &PgRow) -> Result<BalanceRecord, LedgerError> {
    Ok(BalanceRecord {
        user_id: row.try_get("user_id").map_err(db_err)?,
        available_balance: row.try_get("available_balance").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let reference_table: Option<String> = row.try_get("reference_table").map_err(db_err)?;
    let reference_id: Option<Uuid> = row.try_get("reference_id").map_err(db_err)?;
    let transaction_type: String = row.try_get("transaction_type").map_err(db_err)?;

    Ok(LedgerEntry {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        sequence: row.try_get("sequence").map_err(db_err)?,
        transaction_type: transaction_type.parse()?,
        amount: row.try_get("amount").map_err(db_err)?,
        balance_before: row.try_get("balance_before").map_err(db_err)?,
        balance_after: row.try_get("balance_after").map_err(db_err)?,
        reference: match (reference_table, reference_id) {
            (Some(table), Some(id)) => Some(Reference { table, id }),
            _ => None,
        },
        note: row.try_get("note").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn bank_account_from_row(row: &PgRow) -> Result<BankAccount, LedgerError> {
    Ok(BankAccount {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        bank_name: row.try_get("bank_name").map_err(db_err)?,
        account_number: row.try_get("account_number").map_err(db_err)?,
        account_holder: row.try_get("account_holder").map_err(db_err)?,
        verified: row.try_get("is_verified").map_err(db_err)?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<WithdrawalRequest, LedgerError> {
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(WithdrawalRequest {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        bank_account_id: row.try_get("bank_account_id").map_err(db_err)?,
        bank_name: row.try_get("bank_name").map_err(db_err)?,
        account_number: row.try_get("account_number").map_err(db_err)?,
        account_holder: row.try_get("account_holder").map_err(db_err)?,
        amount_requested: row.try_get("amount_requested").map_err(db_err)?,
        admin_fee: row.try_get("admin_fee").map_err(db_err)?,
        amount_payable: row.try_get("amount_payable").map_err(db_err)?,
        status: status.parse()?,
        requested_at: row.try_get("requested_at").map_err(db_err)?,
        processed_at: row.try_get("processed_at").map_err(db_err)?,
        processed_by: row.try_get("processed_by").map_err(db_err)?,
        admin_notes: row.try_get("admin_notes").map_err(db_err)?,
        transfer_proof: row.try_get("transfer_proof").map_err(db_err)?,
        bank_reference: row.try_get("bank_reference").map_err(db_err)?,
    })
}

#[async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Scoped to this transaction only
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        Ok(Box::new(PostgresTransaction {
            tx,
            pool: self.pool.clone(),
        }))
    }

    async fn get_or_create_balance(&self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, available_balance, version, created_at, updated_at)
            VALUES ($1, 0, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        balance_from_row(&row)
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Option<BalanceRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(balance_from_row).transpose()
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM balance_ledger_entries WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM balance_ledger_entries
            WHERE user_id = $1
            ORDER BY sequence DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(user_id)
        .bind(i64::from(pagination.limit))
        .bind(pagination.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, pagination, total as u64))
    }

    async fn replay_entries(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM balance_ledger_entries
            WHERE user_id = $1
            ORDER BY sequence ASC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(withdrawal_from_row).transpose()
    }

    async fn list_withdrawals(
        &self,
        filter: WithdrawalFilter,
        pagination: Pagination,
    ) -> Result<Page<WithdrawalRequest>, LedgerError> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM withdrawal_requests
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {WITHDRAWAL_COLUMNS}
            FROM withdrawal_requests
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY requested_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.user_id)
        .bind(status)
        .bind(i64::from(pagination.limit))
        .bind(pagination.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(withdrawal_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, pagination, total as u64))
    }
}

#[async_trait]
impl BankAccountRegistry for PostgresAdapter {
    async fn verified_account(&self, user_id: Uuid) -> Result<Option<BankAccount>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, bank_name, account_number, account_holder, is_verified
            FROM bank_accounts
            WHERE user_id = $1 AND is_verified
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(bank_account_from_row).transpose()
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    /// For reads outside `tx` once it has failed.
    pool: PgPool,
}

impl PostgresTransaction {
    /// Id of the committed entry that already owns `key_hash`. Read through
    /// the pool: after a constraint violation `tx` rejects every statement.
    async fn committed_entry_id(&self, key_hash: &str) -> Result<Option<Uuid>, LedgerError> {
        sqlx::query_scalar("SELECT id FROM balance_ledger_entries WHERE idempotency_key = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn lock_balance(&mut self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, available_balance, version, created_at, updated_at)
            VALUES ($1, 0, 0, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        // Held until commit/rollback: this is the double-spend guard
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        balance_from_row(&row)
    }

    async fn save_balance(&mut self, balance: &BalanceRecord) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE user_balances
            SET available_balance = $2, version = $3, updated_at = $4
            WHERE user_id = $1
            "#,
        )
        .bind(balance.user_id)
        .bind(balance.available_balance)
        .bind(balance.version)
        .bind(balance.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::Storage(format!(
                "balance for user {} does not exist",
                balance.user_id
            )));
        }
        Ok(())
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO balance_ledger_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#
        ))
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.sequence)
        .bind(entry.transaction_type.as_str())
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.reference.as_ref().map(|r| r.table.as_str()))
        .bind(entry.reference.as_ref().map(|r| r.id))
        .bind(&entry.note)
        .bind(entry.idempotency_key.as_deref())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await;

        match (inserted, entry.idempotency_key.as_deref()) {
            (Ok(_), _) => Ok(()),
            (Err(e), Some(key_hash)) if violates(&e, IDEMPOTENCY_CONSTRAINT) => {
                match self.committed_entry_id(key_hash).await? {
                    Some(existing) => Err(LedgerError::DuplicateIdempotencyKey(existing)),
                    None => Err(db_err(e)),
                }
            }
            (Err(e), _) => Err(db_err(e)),
        }
    }

    async fn find_entry_by_idempotency_key(
        &mut self,
        key_hash: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM balance_ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(key_hash)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn lock_withdrawal(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WithdrawalRequest>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.as_ref().map(withdrawal_from_row).transpose()
    }

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO withdrawal_requests ({WITHDRAWAL_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.bank_account_id)
        .bind(&request.bank_name)
        .bind(&request.account_number)
        .bind(&request.account_holder)
        .bind(request.amount_requested)
        .bind(request.admin_fee)
        .bind(request.amount_payable)
        .bind(request.status.as_str())
        .bind(request.requested_at)
        .bind(request.processed_at)
        .bind(request.processed_by)
        .bind(request.admin_notes.as_deref())
        .bind(request.transfer_proof.as_deref())
        .bind(request.bank_reference.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawal_requests
            SET status = $2,
                processed_at = $3,
                processed_by = $4,
                admin_notes = $5,
                transfer_proof = $6,
                bank_reference = $7
            WHERE id = $1
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(request.processed_at)
        .bind(request.processed_by)
        .bind(request.admin_notes.as_deref())
        .bind(request.transfer_proof.as_deref())
        .bind(request.bank_reference.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(request.id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.rollback().await.map_err(db_err)
    }
}
