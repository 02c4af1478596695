//! Domain models for the sync engine

mod account;
mod email;
mod job;
mod outbox;
mod sync_state;

pub use account::{Account, EXPIRY_SKEW_SECS, OAuthCredential};
pub use email::{Email, EmailAddress, MessageId, ThreadId};
pub use job::WorkerJob;
pub use outbox::{AttachmentRef, DraftAttachment, OutboundDraft, OutboxStatus, QueuedOutboundEmail};
pub use sync_state::{HistoryCursor, SyncState};

/// Well-known Gmail system label ids
pub mod labels {
    pub const INBOX: &str = "INBOX";
    pub const SENT: &str = "SENT";
    pub const TRASH: &str = "TRASH";
    pub const SPAM: &str = "SPAM";
    pub const STARRED: &str = "STARRED";
    pub const UNREAD: &str = "UNREAD";
}
