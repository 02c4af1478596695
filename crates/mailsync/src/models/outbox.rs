//! Offline outbox records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Outbox item status. `Failed` is terminal until the user retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sending" => Ok(OutboxStatus::Sending),
            "failed" => Ok(OutboxStatus::Failed),
            other => anyhow::bail!("Unknown outbox status: {}", other),
        }
    }
}

/// Attachment content supplied by the caller when composing.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A message the user asked to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundDraft {
    pub account_id: i64,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<DraftAttachment>,
    /// Gmail thread to reply into
    pub thread_id: Option<String>,
}

/// Attachment persisted on disk, referenced relative to the attachment root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
    pub relative_path: String,
    pub size: u64,
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOutboundEmail {
    pub id: Uuid,
    pub account_id: i64,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub thread_id: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedOutboundEmail {
    /// Fresh pending row for a draft whose attachments are already on disk.
    pub fn from_draft(id: Uuid, draft: &OutboundDraft, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            id,
            account_id: draft.account_id,
            to: draft.to.clone(),
            cc: draft.cc.clone(),
            bcc: draft.bcc.clone(),
            subject: draft.subject.clone(),
            body: draft.body.clone(),
            html_body: draft.html_body.clone(),
            attachments,
            thread_id: draft.thread_id.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutboxStatus::Failed
    }
}
