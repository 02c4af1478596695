//! In-memory storage
//!
//! Used by tests and previews. Each map sits behind its own `RwLock`;
//! [`MailStore::apply_changes`] holds the email map's write lock for the
//! whole batch so readers see all of it or none of it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::traits::{
    EmailQuery, MailStore, OutboxStore, SeenIdStore, SummaryStore, TimestampLog,
};
use crate::models::{Email, MessageId, QueuedOutboundEmail, SyncState};

type EmailKey = (i64, MessageId);

#[derive(Default)]
pub struct InMemoryMailStore {
    emails: RwLock<HashMap<EmailKey, Email>>,
    sync_states: RwLock<HashMap<i64, SyncState>>,
    outbox: RwLock<HashMap<Uuid, QueuedOutboundEmail>>,
    timestamps: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
    seen: RwLock<HashMap<String, BTreeMap<String, DateTime<Utc>>>>,
    summaries: RwLock<HashMap<EmailKey, String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MailStore for InMemoryMailStore {
    fn upsert_email(&self, email: Email) -> Result<()> {
        write(&self.emails).insert((email.account_id, email.id.clone()), email);
        Ok(())
    }

    fn apply_changes(
        &self,
        account_id: i64,
        upserts: &[Email],
        deletions: &[MessageId],
    ) -> Result<()> {
        if let Some(stray) = upserts.iter().find(|e| e.account_id != account_id) {
            anyhow::bail!(
                "Email {} belongs to account {}, not {}",
                stray.id,
                stray.account_id,
                account_id
            );
        }

        let mut emails = write(&self.emails);
        for email in upserts {
            emails.insert((account_id, email.id.clone()), email.clone());
        }
        for id in deletions {
            emails.remove(&(account_id, id.clone()));
        }
        Ok(())
    }

    fn get_email(&self, account_id: i64, id: &MessageId) -> Result<Option<Email>> {
        Ok(read(&self.emails).get(&(account_id, id.clone())).cloned())
    }

    fn has_email(&self, account_id: i64, id: &MessageId) -> Result<bool> {
        Ok(read(&self.emails).contains_key(&(account_id, id.clone())))
    }

    fn delete_email(&self, account_id: i64, id: &MessageId) -> Result<()> {
        write(&self.emails).remove(&(account_id, id.clone()));
        Ok(())
    }

    fn list_emails(&self, query: &EmailQuery) -> Result<Vec<Email>> {
        let mut emails: Vec<Email> = read(&self.emails)
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        emails.sort_by(|a, b| {
            b.internal_date
                .cmp(&a.internal_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            emails.truncate(limit);
        }
        Ok(emails)
    }

    fn count_emails(&self, account_id: i64) -> Result<usize> {
        Ok(read(&self.emails)
            .keys()
            .filter(|(account, _)| *account == account_id)
            .count())
    }

    fn update_labels(&self, account_id: i64, id: &MessageId, label_ids: Vec<String>) -> Result<()> {
        if let Some(email) = write(&self.emails).get_mut(&(account_id, id.clone())) {
            email.label_ids = label_ids;
        }
        Ok(())
    }

    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>> {
        Ok(read(&self.sync_states).get(&account_id).cloned())
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        write(&self.sync_states).insert(state.account_id, state.clone());
        Ok(())
    }

    fn delete_sync_state(&self, account_id: i64) -> Result<()> {
        write(&self.sync_states).remove(&account_id);
        Ok(())
    }

    fn delete_account_data(&self, account_id: i64) -> Result<()> {
        write(&self.emails).retain(|(account, _), _| *account != account_id);
        write(&self.summaries).retain(|(account, _), _| *account != account_id);
        write(&self.sync_states).remove(&account_id);
        Ok(())
    }
}

impl OutboxStore for InMemoryMailStore {
    fn insert_outbox(&self, item: &QueuedOutboundEmail) -> Result<()> {
        let mut outbox = write(&self.outbox);
        if outbox.contains_key(&item.id) {
            anyhow::bail!("Outbox item {} already exists", item.id);
        }
        outbox.insert(item.id, item.clone());
        Ok(())
    }

    fn update_outbox(&self, item: &QueuedOutboundEmail) -> Result<()> {
        let mut outbox = write(&self.outbox);
        match outbox.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => anyhow::bail!("Outbox item {} not found", item.id),
        }
    }

    fn get_outbox(&self, id: &Uuid) -> Result<Option<QueuedOutboundEmail>> {
        Ok(read(&self.outbox).get(id).cloned())
    }

    fn list_outbox(&self) -> Result<Vec<QueuedOutboundEmail>> {
        let mut items: Vec<_> = read(&self.outbox).values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn delete_outbox(&self, id: &Uuid) -> Result<bool> {
        Ok(write(&self.outbox).remove(id).is_some())
    }
}

impl TimestampLog for InMemoryMailStore {
    fn record(&self, namespace: &str, at: DateTime<Utc>) -> Result<()> {
        write(&self.timestamps)
            .entry(namespace.to_string())
            .or_default()
            .push(at);
        Ok(())
    }

    fn count_since(&self, namespace: &str, since: DateTime<Utc>) -> Result<usize> {
        Ok(read(&self.timestamps)
            .get(namespace)
            .map(|entries| entries.iter().filter(|t| **t >= since).count())
            .unwrap_or(0))
    }

    fn prune_before(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let mut timestamps = write(&self.timestamps);
        let Some(entries) = timestamps.get_mut(namespace) else {
            return Ok(0);
        };
        let len = entries.len();
        entries.retain(|t| *t >= before);
        Ok(len - entries.len())
    }
}

impl SeenIdStore for InMemoryMailStore {
    fn mark_seen(&self, namespace: &str, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut seen = write(&self.seen);
        let ids = seen.entry(namespace.to_string()).or_default();
        if ids.contains_key(id) {
            return Ok(false);
        }
        ids.insert(id.to_string(), at);
        Ok(true)
    }

    fn is_seen(&self, namespace: &str, id: &str) -> Result<bool> {
        Ok(read(&self.seen)
            .get(namespace)
            .is_some_and(|ids| ids.contains_key(id)))
    }

    fn prune_seen(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let mut seen = write(&self.seen);
        let Some(ids) = seen.get_mut(namespace) else {
            return Ok(0);
        };
        let len = ids.len();
        ids.retain(|_, at| *at >= before);
        Ok(len - ids.len())
    }
}

impl SummaryStore for InMemoryMailStore {
    fn save_summary(&self, account_id: i64, id: &MessageId, summary: &str) -> Result<()> {
        write(&self.summaries).insert((account_id, id.clone()), summary.to_string());
        Ok(())
    }

    fn get_summary(&self, account_id: i64, id: &MessageId) -> Result<Option<String>> {
        Ok(read(&self.summaries).get(&(account_id, id.clone())).cloned())
    }
}
