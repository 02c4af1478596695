//! Background work items derived from synced email

use super::{Email, MessageId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A unit of deferred per-message work (summarization, body prefetch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub account_id: i64,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub is_unread: bool,
    pub is_starred: bool,
    pub has_list_unsubscribe: bool,
    pub received_at: DateTime<Utc>,
}

impl WorkerJob {
    /// starred 4, unread 2, not bulk 1
    pub fn priority(&self) -> u8 {
        (self.is_starred as u8) * 4 + (self.is_unread as u8) * 2 + (!self.has_list_unsubscribe as u8)
    }

    /// Queue order: higher priority first, then newest first.
    pub fn queue_order(a: &WorkerJob, b: &WorkerJob) -> Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| b.received_at.cmp(&a.received_at))
    }
}

impl From<&Email> for WorkerJob {
    fn from(email: &Email) -> Self {
        Self {
            account_id: email.account_id,
            message_id: email.id.clone(),
            thread_id: email.thread_id.clone(),
            is_unread: email.is_unread(),
            is_starred: email.is_starred(),
            has_list_unsubscribe: email.has_list_unsubscribe,
            received_at: email.received_at,
        }
    }
}
