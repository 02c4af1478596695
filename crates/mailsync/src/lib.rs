//! mailsync - sync and background work engine for a mobile Gmail client
//!
//! This crate keeps a local mail cache consistent with the server and feeds
//! deferred work off the back of every sync:
//! - Incremental sync over the Gmail history API, with full-sync fallback
//! - Single-flight OAuth token refresh per account
//! - Durable offline outbox with bounded retry
//! - Rate-limited, device-gated queues for summarization and body prefetch
//! - New-mail notifications with persisted dedup
//! - OS background-window lifecycle (schedule, run, expire)
//!
//! Everything is synchronous and executor-agnostic. Mobile hosts drive it
//! through the UniFFI [`ffi::MailService`] facade.

pub mod actions;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod device;
pub mod engine;
pub mod ffi;
pub mod gmail;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod outbox;
pub mod queue;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use actions::ActionHandler;
pub use auth::{AccountDirectory, CredentialStore, InMemoryAccounts, TokenRefreshCoordinator, TokenRefresher};
pub use cancel::{CancellationToken, Cancelled};
pub use config::{EngineConfig, GmailCredentials};
pub use device::{DeviceConditions, DeviceSnapshot, StaticConditions};
pub use engine::{EngineDeps, SyncEngine};
pub use gmail::{ApiError, GmailClient, GmailTokenRefresher, MailApi};
pub use lifecycle::{BackgroundTaskManager, TaskKind, TaskRequest, TaskScheduler};
pub use models::{
    Account, Email, EmailAddress, HistoryCursor, MessageId, OAuthCredential, OutboundDraft,
    OutboxStatus, QueuedOutboundEmail, SyncState, ThreadId, WorkerJob,
};
pub use notify::{NewMailNotification, NotificationChecker, Notifier};
pub use outbox::{AttachmentStore, DrainReport, OutboxQueue};
pub use queue::{HourlyBudget, JobAction, LeadSentenceSummarizer, Summarizer, WorkerQueue};
pub use storage::{
    BlobStore, EmailQuery, EngineStore, FileBlobStore, InMemoryBlobStore, InMemoryMailStore,
    MailStore, SqliteMailStore,
};
pub use sync::{AccountSyncOutcome, HistoryDelta, HistoryDeltaResolver, SyncOrchestrator, SyncOutcome};

uniffi::setup_scaffolding!();
