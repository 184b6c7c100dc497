use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LedgerError;

/// A payout destination owned by a user. Managed elsewhere; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
    pub verified: bool,
}

/// Read-only view of the bank-account registry.
#[async_trait]
pub trait BankAccountRegistry: Send + Sync {
    /// The account withdrawals for `user_id` are paid to, if one is verified.
    async fn verified_account(&self, user_id: Uuid) -> Result<Option<BankAccount>, LedgerError>;
}

/// Registry backed by a map, for embedding and tests.
#[derive(Clone, Default)]
pub struct StaticBankAccounts {
    accounts: Arc<RwLock<HashMap<Uuid, Vec<BankAccount>>>>,
}

impl StaticBankAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: BankAccount) {
        let mut accounts = self
            .accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accounts.entry(account.user_id).or_default().push(account);
    }
}

#[async_trait]
impl BankAccountRegistry for StaticBankAccounts {
    async fn verified_account(&self, user_id: Uuid) -> Result<Option<BankAccount>, LedgerError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        Ok(accounts
            .get(&user_id)
            .and_then(|list| list.iter().find(|a| a.verified))
            .cloned())
    }
}
