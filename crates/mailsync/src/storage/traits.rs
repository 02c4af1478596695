//! Storage trait definitions
//!
//! Each concern the engine persists has its own trait so units only see
//! what they use. [`InMemoryMailStore`](super::InMemoryMailStore) and
//! [`SqliteMailStore`](super::SqliteMailStore) implement all of them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Email, MessageId, QueuedOutboundEmail, SyncState};

/// Predicate for [`MailStore::list_emails`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailQuery {
    pub account_id: Option<i64>,
    /// Only emails carrying this label
    pub label: Option<String>,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

impl EmailQuery {
    pub fn account(account_id: i64) -> Self {
        Self {
            account_id: Some(account_id),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn unread(mut self) -> Self {
        self.unread_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, email: &Email) -> bool {
        self.account_id.is_none_or(|id| id == email.account_id)
            && self.label.as_deref().is_none_or(|l| email.has_label(l))
            && (!self.unread_only || email.is_unread())
    }
}

/// Local mirror of the remote mailbox plus per-account sync positions.
///
/// Results come back newest first (by `internal_date`).
pub trait MailStore: Send + Sync {
    fn upsert_email(&self, email: Email) -> Result<()>;

    /// Apply one sync's changes for an account atomically: all upserts and
    /// deletions become visible together or not at all.
    fn apply_changes(&self, account_id: i64, upserts: &[Email], deletions: &[MessageId])
    -> Result<()>;

    fn get_email(&self, account_id: i64, id: &MessageId) -> Result<Option<Email>>;

    fn has_email(&self, account_id: i64, id: &MessageId) -> Result<bool>;

    fn delete_email(&self, account_id: i64, id: &MessageId) -> Result<()>;

    fn list_emails(&self, query: &EmailQuery) -> Result<Vec<Email>>;

    fn count_emails(&self, account_id: i64) -> Result<usize>;

    /// Replace the label set of a cached email. Missing emails are ignored.
    fn update_labels(&self, account_id: i64, id: &MessageId, label_ids: Vec<String>) -> Result<()>;

    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>>;

    fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    fn delete_sync_state(&self, account_id: i64) -> Result<()>;

    /// Drop every cached email and the sync state of an account.
    fn delete_account_data(&self, account_id: i64) -> Result<()>;
}

/// Durable outbox rows. Listing is FIFO by `created_at`.
pub trait OutboxStore: Send + Sync {
    fn insert_outbox(&self, item: &QueuedOutboundEmail) -> Result<()>;

    fn update_outbox(&self, item: &QueuedOutboundEmail) -> Result<()>;

    fn get_outbox(&self, id: &Uuid) -> Result<Option<QueuedOutboundEmail>>;

    fn list_outbox(&self) -> Result<Vec<QueuedOutboundEmail>>;

    /// Returns whether a row was removed.
    fn delete_outbox(&self, id: &Uuid) -> Result<bool>;
}

/// Append-only event timestamps per namespace (hourly budgets).
pub trait TimestampLog: Send + Sync {
    fn record(&self, namespace: &str, at: DateTime<Utc>) -> Result<()>;

    fn count_since(&self, namespace: &str, since: DateTime<Utc>) -> Result<usize>;

    /// Remove entries strictly older than `before`; returns how many.
    fn prune_before(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize>;
}

/// Set of ids already handled, per namespace, with age-based pruning.
pub trait SeenIdStore: Send + Sync {
    /// Insert `id`; returns `false` when it was already present.
    fn mark_seen(&self, namespace: &str, id: &str, at: DateTime<Utc>) -> Result<bool>;

    fn is_seen(&self, namespace: &str, id: &str) -> Result<bool>;

    fn prune_seen(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize>;
}

/// Generated message summaries
pub trait SummaryStore: Send + Sync {
    fn save_summary(&self, account_id: i64, id: &MessageId, summary: &str) -> Result<()>;

    fn get_summary(&self, account_id: i64, id: &MessageId) -> Result<Option<String>>;

    fn has_summary(&self, account_id: i64, id: &MessageId) -> Result<bool> {
        Ok(self.get_summary(account_id, id)?.is_some())
    }
}

/// Everything the engine persists, in one backend.
pub trait EngineStore: MailStore + OutboxStore + TimestampLog + SeenIdStore + SummaryStore {}

impl<T> EngineStore for T where T: MailStore + OutboxStore + TimestampLog + SeenIdStore + SummaryStore
{}
