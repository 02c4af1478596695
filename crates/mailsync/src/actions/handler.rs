//! Action handler for message label changes

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::auth::{AccountDirectory, TokenRefreshCoordinator};
use crate::gmail::MailApi;
use crate::models::{MessageId, labels};
use crate::storage::MailStore;

/// Applies label changes remotely, then locally.
///
/// The server stays the source of truth: if the remote call fails the cache
/// is left untouched, and the next sync carries any change made elsewhere.
pub struct ActionHandler {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    accounts: Arc<dyn AccountDirectory>,
    store: Arc<dyn MailStore>,
}

impl ActionHandler {
    pub fn new(
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        accounts: Arc<dyn AccountDirectory>,
        store: Arc<dyn MailStore>,
    ) -> Self {
        Self {
            api,
            auth,
            accounts,
            store,
        }
    }

    pub fn set_read(&self, account_id: i64, ids: &[MessageId], is_read: bool) -> Result<()> {
        info!(
            "Marking {} message(s) as {}",
            ids.len(),
            if is_read { "read" } else { "unread" }
        );
        if is_read {
            self.modify(account_id, ids, &[], &[labels::UNREAD])
        } else {
            self.modify(account_id, ids, &[labels::UNREAD], &[])
        }
    }

    pub fn set_starred(&self, account_id: i64, ids: &[MessageId], starred: bool) -> Result<()> {
        if starred {
            self.modify(account_id, ids, &[labels::STARRED], &[])
        } else {
            self.modify(account_id, ids, &[], &[labels::STARRED])
        }
    }

    /// Archive removes the INBOX label; the messages stay in All Mail.
    pub fn archive(&self, account_id: i64, ids: &[MessageId]) -> Result<()> {
        info!("Archiving {} message(s)", ids.len());
        self.modify(account_id, ids, &[], &[labels::INBOX])
    }

    fn modify(&self, account_id: i64, ids: &[MessageId], add: &[&str], remove: &[&str]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let account = self
            .accounts
            .account(account_id)
            .with_context(|| format!("Account {} is not registered", account_id))?;

        let add: Vec<String> = add.iter().map(|l| l.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|l| l.to_string()).collect();
        self.auth
            .call_with_auth(&account, |a| self.api.batch_modify_labels(a, ids, &add, &remove))?;

        for id in ids {
            if let Some(mut email) = self.store.get_email(account_id, id)? {
                email.apply_labels(&add, &remove);
                self.store.update_labels(account_id, id, email.label_ids)?;
            }
        }
        Ok(())
    }
}
