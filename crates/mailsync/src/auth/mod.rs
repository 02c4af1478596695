//! Account credentials and token freshness
//!
//! The engine never owns credential storage; it sees accounts through
//! [`AccountDirectory`] and hands refreshed credentials back through
//! [`CredentialStore`].

mod coordinator;

pub use coordinator::TokenRefreshCoordinator;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::gmail::ApiError;
use crate::models::{Account, OAuthCredential};

/// Exchanges an account's refresh token for a new credential.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, account: &Account) -> Result<OAuthCredential, ApiError>;
}

/// Persists refreshed credentials (keychain, keystore).
pub trait CredentialStore: Send + Sync {
    fn save_credential(&self, account_id: i64, credential: &OAuthCredential) -> Result<()>;
}

/// Registered accounts, looked up by id.
pub trait AccountDirectory: Send + Sync {
    fn account(&self, id: i64) -> Option<Account>;
    fn accounts(&self) -> Vec<Account>;
}

/// Account registry held in memory. Also records refreshed credentials so
/// later lookups return the fresh token.
#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    accounts: RwLock<BTreeMap<i64, Account>>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, account: Account) {
        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.id, account);
    }

    pub fn remove(&self, id: i64) -> Option<Account> {
        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

impl AccountDirectory for InMemoryAccounts {
    fn account(&self, id: i64) -> Option<Account> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn accounts(&self) -> Vec<Account> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl CredentialStore for InMemoryAccounts {
    fn save_credential(&self, account_id: i64, credential: &OAuthCredential) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(account) = accounts.get_mut(&account_id) {
            account.credential = credential.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        let accounts = InMemoryAccounts::new();
        accounts.upsert(Account::new(2, "b@example.com", OAuthCredential::new("b")));
        accounts.upsert(Account::new(1, "a@example.com", OAuthCredential::new("a")));

        let ids: Vec<i64> = accounts.accounts().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);

        accounts
            .save_credential(1, &OAuthCredential::new("fresh"))
            .unwrap();
        assert_eq!(accounts.account(1).unwrap().access_token(), "fresh");

        assert!(accounts.remove(2).is_some());
        assert!(accounts.account(2).is_none());
    }
}
