// src/adapters/memory.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{
    BalanceRecord, LedgerAdapter, LedgerEntry, LedgerError, LedgerTransaction, Page, Pagination,
    WithdrawalFilter, WithdrawalRequest,
};

use super::DEFAULT_LOCK_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Balance(Uuid),
    Withdrawal(Uuid),
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<Uuid, BalanceRecord>,
    /// Commit order
    entries: Vec<LedgerEntry>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
}

type RowLocks = Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone, Default)]
struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    /// One async mutex per row; stands in for `SELECT ... FOR UPDATE`.
    /// Only rows that are locked or waited on have an entry.
    locks: RowLocks,
}

impl MemoryStore {
    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn row_lock(&self, key: LockKey) -> Result<Arc<tokio::sync::Mutex<()>>, LedgerError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Arc::clone(locks.entry(key).or_default()))
    }
}

/// Row locks owned by one transaction. Released on drop, and any row nobody
/// else holds or waits for is removed from the shared map.
struct HeldLocks {
    locks: RowLocks,
    guards: HashMap<LockKey, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn new(locks: RowLocks) -> Self {
        Self {
            locks,
            guards: HashMap::new(),
        }
    }

    fn contains(&self, key: &LockKey) -> bool {
        self.guards.contains_key(key)
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let released: Vec<LockKey> = self.guards.drain().map(|(key, _)| key).collect();

        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in released {
            // The map's own reference is the last one
            if locks.get(&key).is_some_and(|row| Arc::strong_count(row) == 1) {
                locks.remove(&key);
            }
        }
    }
}

/// In-process adapter. Transactions stage their writes and publish them
/// all at once on commit; row locks are held until the transaction ends.
#[derive(Clone)]
pub struct MemoryAdapter {
    store: MemoryStore,
    lock_timeout: Duration,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        Ok(Box::new(MemoryTransaction {
            store: self.store.clone(),
            lock_timeout: self.lock_timeout,
            held: HeldLocks::new(Arc::clone(&self.store.locks)),
            balances: HashMap::new(),
            entries: Vec::new(),
            inserted: HashMap::new(),
            updated: HashMap::new(),
        }))
    }

    async fn get_or_create_balance(&self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        let mut state = self.store.state()?;
        Ok(state
            .balances
            .entry(user_id)
            .or_insert_with(|| BalanceRecord::new(user_id))
            .clone())
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Option<BalanceRecord>, LedgerError> {
        Ok(self.store.state()?.balances.get(&user_id).cloned())
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let mut entries = self.replay_entries(user_id).await?;
        entries.reverse();
        Ok(Page::from_sorted(entries, pagination))
    }

    async fn replay_entries(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.store.state()?;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, LedgerError> {
        Ok(self.store.state()?.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals(
        &self,
        filter: WithdrawalFilter,
        pagination: Pagination,
    ) -> Result<Page<WithdrawalRequest>, LedgerError> {
        let state = self.store.state()?;
        let mut requests: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        requests.sort_by(|a, b| (b.requested_at, b.id).cmp(&(a.requested_at, a.id)));
        Ok(Page::from_sorted(requests, pagination))
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    lock_timeout: Duration,
    held: HeldLocks,
    balances: HashMap<Uuid, BalanceRecord>,
    entries: Vec<LedgerEntry>,
    inserted: HashMap<Uuid, WithdrawalRequest>,
    updated: HashMap<Uuid, WithdrawalRequest>,
}

impl MemoryTransaction {
    async fn acquire(&mut self, key: LockKey) -> Result<(), LedgerError> {
        if self.held.contains(&key) {
            return Ok(());
        }

        let row = self.store.row_lock(key)?;
        let guard = tokio::time::timeout(self.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout)?;
        self.held.guards.insert(key, guard);
        Ok(())
    }

    fn ensure_held(&self, key: LockKey) -> Result<(), LedgerError> {
        if self.held.contains(&key) {
            Ok(())
        } else {
            Err(LedgerError::Storage(format!("{key:?} written without lock")))
        }
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn lock_balance(&mut self, user_id: Uuid) -> Result<BalanceRecord, LedgerError> {
        self.acquire(LockKey::Balance(user_id)).await?;

        if let Some(staged) = self.balances.get(&user_id) {
            return Ok(staged.clone());
        }
        let committed = self.store.state()?.balances.get(&user_id).cloned();
        Ok(committed.unwrap_or_else(|| BalanceRecord::new(user_id)))
    }

    async fn save_balance(&mut self, balance: &BalanceRecord) -> Result<(), LedgerError> {
        self.ensure_held(LockKey::Balance(balance.user_id))?;
        self.balances.insert(balance.user_id, balance.clone());
        Ok(())
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.ensure_held(LockKey::Balance(entry.user_id))?;
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn find_entry_by_idempotency_key(
        &mut self,
        key_hash: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let matches = |e: &&LedgerEntry| e.idempotency_key.as_deref() == Some(key_hash);

        if let Some(staged) = self.entries.iter().find(matches) {
            return Ok(Some(staged.clone()));
        }
        let state = self.store.state()?;
        Ok(state.entries.iter().find(matches).cloned())
    }

    async fn lock_withdrawal(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WithdrawalRequest>, LedgerError> {
        self.acquire(LockKey::Withdrawal(id)).await?;

        if let Some(staged) = self.updated.get(&id).or_else(|| self.inserted.get(&id)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.store.state()?.withdrawals.get(&id).cloned())
    }

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError> {
        let exists = self.inserted.contains_key(&request.id)
            || self.store.state()?.withdrawals.contains_key(&request.id);
        if exists {
            return Err(LedgerError::Storage(format!(
                "withdrawal request {} already exists",
                request.id
            )));
        }

        self.acquire(LockKey::Withdrawal(request.id)).await?;
        self.inserted.insert(request.id, request.clone());
        Ok(())
    }

    async fn update_withdrawal(&mut self, request: &WithdrawalRequest) -> Result<(), LedgerError> {
        self.ensure_held(LockKey::Withdrawal(request.id))?;

        if let Some(staged) = self.inserted.get_mut(&request.id) {
            *staged = request.clone();
            return Ok(());
        }
        if !self.store.state()?.withdrawals.contains_key(&request.id) {
            return Err(LedgerError::NotFound(request.id));
        }
        self.updated.insert(request.id, request.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryTransaction {
            store,
            held,
            balances,
            entries,
            inserted,
            updated,
            ..
        } = *self;

        {
            let mut state = store.state()?;

            // Unique constraints, checked before anything is published
            for entry in &entries {
                let Some(key) = entry.idempotency_key.as_deref() else {
                    continue;
                };
                if let Some(existing) = state
                    .entries
                    .iter()
                    .find(|e| e.idempotency_key.as_deref() == Some(key))
                {
                    return Err(LedgerError::DuplicateIdempotencyKey(existing.id));
                }
            }
            if let Some(id) = inserted.keys().find(|id| state.withdrawals.contains_key(id)) {
                return Err(LedgerError::Storage(format!(
                    "withdrawal request {id} already exists"
                )));
            }

            state.balances.extend(balances);
            state.entries.extend(entries);
            state.withdrawals.extend(inserted);
            state.withdrawals.extend(updated);
        }

        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}
