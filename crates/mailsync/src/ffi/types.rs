//! FFI-friendly type wrappers for UniFFI export
//!
//! These types convert internal Rust types to FFI-compatible versions:
//! - `DateTime<Utc>` → `i64` (Unix timestamp)
//! - `MessageId`/`Uuid` → `String`
//! - Outcome enums → flat records

use crate::gmail::ApiError;
use crate::lifecycle::{TaskKind, TaskRequest};
use crate::models::{
    Account, DraftAttachment, Email, EmailAddress, OutboundDraft, OutboxStatus, QueuedOutboundEmail,
};
use crate::notify::NewMailNotification;
use crate::outbox::{DrainReport, OutboxError};
use crate::sync::{AccountSyncOutcome, SyncMode, SyncOutcome};

// ============================================================================
// Error Types
// ============================================================================

/// FFI-friendly error type
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum MailError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Sync error: {message}")]
    Sync { message: String },
}

impl From<anyhow::Error> for MailError {
    fn from(e: anyhow::Error) -> Self {
        let message = format!("{:#}", e);

        if let Some(api) = e.downcast_ref::<ApiError>() {
            return match api {
                ApiError::Unauthenticated | ApiError::ReauthRequired => MailError::AuthRequired,
                ApiError::NotFound => MailError::NotFound { resource: message },
                _ => MailError::Network { message },
            };
        }
        if let Some(outbox) = e.downcast_ref::<OutboxError>() {
            return match outbox {
                OutboxError::NotFound(id) => MailError::NotFound {
                    resource: format!("outbox item {}", id),
                },
                OutboxError::InFlight(_) | OutboxError::NoRecipients => {
                    MailError::InvalidArgument { message }
                }
            };
        }
        if e.downcast_ref::<rusqlite::Error>().is_some()
            || e.downcast_ref::<rusqlite_migration::Error>().is_some()
        {
            return MailError::Database { message };
        }
        MailError::Sync { message }
    }
}

// ============================================================================
// Account Types
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAccount {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    /// Whether the access token is (about to be) expired
    pub token_expired: bool,
}

impl From<Account> for FfiAccount {
    fn from(a: Account) -> Self {
        Self {
            id: a.id,
            token_expired: a.is_expired(),
            email: a.email,
            display_name: a.display_name,
        }
    }
}

// ============================================================================
// Email Types
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl From<EmailAddress> for FfiEmailAddress {
    fn from(e: EmailAddress) -> Self {
        Self {
            name: e.name,
            email: e.email,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEmail {
    pub id: String,
    pub thread_id: String,
    pub account_id: i64,
    pub from: FfiEmailAddress,
    pub to: Vec<FfiEmailAddress>,
    pub subject: String,
    pub snippet: String,
    /// Unix timestamp (seconds since epoch)
    pub received_at: i64,
    pub label_ids: Vec<String>,
    pub is_unread: bool,
    pub is_starred: bool,
}

impl From<Email> for FfiEmail {
    fn from(e: Email) -> Self {
        Self {
            is_unread: e.is_unread(),
            is_starred: e.is_starred(),
            id: e.id.0,
            thread_id: e.thread_id.0,
            account_id: e.account_id,
            from: e.from.into(),
            to: e.to.into_iter().map(FfiEmailAddress::from).collect(),
            subject: e.subject,
            snippet: e.snippet,
            received_at: e.received_at.timestamp(),
            label_ids: e.label_ids,
        }
    }
}

// ============================================================================
// Sync Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSyncStatus {
    Synced,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSyncMode {
    Full,
    Incremental,
    FallbackFull,
}

impl From<SyncMode> for FfiSyncMode {
    fn from(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Full => FfiSyncMode::Full,
            SyncMode::Incremental => FfiSyncMode::Incremental,
            SyncMode::FallbackFull => FfiSyncMode::FallbackFull,
        }
    }
}

/// Result of syncing one account
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncOutcome {
    pub account_id: i64,
    pub status: FfiSyncStatus,
    pub mode: Option<FfiSyncMode>,
    pub messages_upserted: u32,
    pub messages_deleted: u32,
    pub messages_skipped: u32,
    pub cursor: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// The user has to sign in again before this account can sync
    pub needs_reauth: bool,
}

impl FfiSyncOutcome {
    fn empty(account_id: i64, status: FfiSyncStatus) -> Self {
        Self {
            account_id,
            status,
            mode: None,
            messages_upserted: 0,
            messages_deleted: 0,
            messages_skipped: 0,
            cursor: None,
            duration_ms: 0,
            error: None,
            needs_reauth: false,
        }
    }
}

impl From<AccountSyncOutcome> for FfiSyncOutcome {
    fn from(o: AccountSyncOutcome) -> Self {
        match o.outcome {
            SyncOutcome::Synced(stats) => Self {
                mode: Some(stats.mode.into()),
                messages_upserted: stats.messages_upserted as u32,
                messages_deleted: stats.messages_deleted as u32,
                messages_skipped: stats.messages_skipped as u32,
                cursor: Some(stats.cursor.as_str().to_string()),
                duration_ms: stats.duration_ms,
                ..Self::empty(o.account_id, FfiSyncStatus::Synced)
            },
            SyncOutcome::Failed {
                error,
                needs_reauth,
            } => Self {
                error: Some(error),
                needs_reauth,
                ..Self::empty(o.account_id, FfiSyncStatus::Failed)
            },
            SyncOutcome::Cancelled => Self::empty(o.account_id, FfiSyncStatus::Cancelled),
        }
    }
}

// ============================================================================
// Outbox Types
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDraftAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiOutboundDraft {
    pub account_id: i64,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<FfiDraftAttachment>,
    pub thread_id: Option<String>,
}

impl From<FfiOutboundDraft> for OutboundDraft {
    fn from(d: FfiOutboundDraft) -> Self {
        Self {
            account_id: d.account_id,
            to: d.to,
            cc: d.cc,
            bcc: d.bcc,
            subject: d.subject,
            body: d.body,
            html_body: d.html_body,
            attachments: d
                .attachments
                .into_iter()
                .map(|a| DraftAttachment {
                    filename: a.filename,
                    mime_type: a.mime_type,
                    data: a.data,
                })
                .collect(),
            thread_id: d.thread_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiOutboxStatus {
    Pending,
    Sending,
    Failed,
}

impl From<OutboxStatus> for FfiOutboxStatus {
    fn from(s: OutboxStatus) -> Self {
        match s {
            OutboxStatus::Pending => FfiOutboxStatus::Pending,
            OutboxStatus::Sending => FfiOutboxStatus::Sending,
            OutboxStatus::Failed => FfiOutboxStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiOutboxItem {
    pub id: String,
    pub account_id: i64,
    pub to: Vec<String>,
    pub subject: String,
    pub status: FfiOutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub attachment_names: Vec<String>,
    /// Unix timestamp (seconds since epoch)
    pub created_at: i64,
}

impl From<QueuedOutboundEmail> for FfiOutboxItem {
    fn from(q: QueuedOutboundEmail) -> Self {
        Self {
            id: q.id.to_string(),
            account_id: q.account_id,
            to: q.to,
            subject: q.subject,
            status: q.status.into(),
            retry_count: q.retry_count,
            last_error: q.last_error,
            attachment_names: q.attachments.into_iter().map(|a| a.filename).collect(),
            created_at: q.created_at.timestamp(),
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDrainReport {
    pub sent: u32,
    pub retried: u32,
    pub failed: u32,
    pub already_running: bool,
    pub offline: bool,
    pub cancelled: bool,
}

impl From<DrainReport> for FfiDrainReport {
    fn from(r: DrainReport) -> Self {
        Self {
            sent: r.sent as u32,
            retried: r.retried as u32,
            failed: r.failed as u32,
            already_running: r.already_running,
            offline: r.offline,
            cancelled: r.cancelled,
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiTaskKind {
    Sync,
    NotificationCheck,
    SummaryProcessing,
    OutboxProcessing,
}

impl From<TaskKind> for FfiTaskKind {
    fn from(k: TaskKind) -> Self {
        match k {
            TaskKind::Sync => FfiTaskKind::Sync,
            TaskKind::NotificationCheck => FfiTaskKind::NotificationCheck,
            TaskKind::SummaryProcessing => FfiTaskKind::SummaryProcessing,
            TaskKind::OutboxProcessing => FfiTaskKind::OutboxProcessing,
        }
    }
}

impl From<FfiTaskKind> for TaskKind {
    fn from(k: FfiTaskKind) -> Self {
        match k {
            FfiTaskKind::Sync => TaskKind::Sync,
            FfiTaskKind::NotificationCheck => TaskKind::NotificationCheck,
            FfiTaskKind::SummaryProcessing => TaskKind::SummaryProcessing,
            FfiTaskKind::OutboxProcessing => TaskKind::OutboxProcessing,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTaskRequest {
    pub kind: FfiTaskKind,
    /// Identifier registered with the OS scheduler
    pub identifier: String,
    /// Unix timestamp (seconds since epoch)
    pub earliest_begin: i64,
    pub requires_network: bool,
}

impl From<&TaskRequest> for FfiTaskRequest {
    fn from(r: &TaskRequest) -> Self {
        Self {
            kind: r.kind.into(),
            identifier: r.identifier.to_string(),
            earliest_begin: r.earliest_begin.timestamp(),
            requires_network: r.requires_network,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNotification {
    pub account_id: i64,
    pub message_id: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
}

impl From<&NewMailNotification> for FfiNotification {
    fn from(n: &NewMailNotification) -> Self {
        Self {
            account_id: n.account_id,
            message_id: n.message_id.to_string(),
            thread_id: n.thread_id.clone(),
            sender: n.sender.clone(),
            subject: n.subject.clone(),
            snippet: n.snippet.clone(),
        }
    }
}

// ============================================================================
// Host Callbacks
// ============================================================================

/// Live device signals. Called right before each gated action.
#[uniffi::export(callback_interface)]
pub trait DeviceConditionsCallback: Send + Sync {
    fn is_network_available(&self) -> bool;
    /// `0.0..=1.0`, or `None` when unknown
    fn battery_level(&self) -> Option<f32>;
    fn is_low_power_mode(&self) -> bool;
}

/// OS background scheduler (BGTaskScheduler, WorkManager)
#[uniffi::export(callback_interface)]
pub trait TaskSchedulerCallback: Send + Sync {
    /// Returns false when the OS refused the request.
    fn submit(&self, request: FfiTaskRequest) -> bool;
}

/// Secure credential storage (Keychain, Keystore)
#[uniffi::export(callback_interface)]
pub trait CredentialCallback: Send + Sync {
    /// Called after a token refresh with the JSON produced by `create_token_json`.
    fn save_token(&self, account_id: i64, token_json: String);
}

#[uniffi::export(callback_interface)]
pub trait NotificationCallback: Send + Sync {
    fn post(&self, notification: FfiNotification);
}

// ============================================================================
// Log Callback
// ============================================================================

/// Log level for FFI callback
#[derive(Debug, Clone, Copy, uniffi::Enum)]
pub enum FfiLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<log::Level> for FfiLogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => FfiLogLevel::Error,
            log::Level::Warn => FfiLogLevel::Warn,
            log::Level::Info => FfiLogLevel::Info,
            log::Level::Debug => FfiLogLevel::Debug,
            log::Level::Trace => FfiLogLevel::Trace,
        }
    }
}

impl From<FfiLogLevel> for log::Level {
    fn from(level: FfiLogLevel) -> Self {
        match level {
            FfiLogLevel::Error => log::Level::Error,
            FfiLogLevel::Warn => log::Level::Warn,
            FfiLogLevel::Info => log::Level::Info,
            FfiLogLevel::Debug => log::Level::Debug,
            FfiLogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Receives log records from Rust. Swift should forward to os_log/Logger,
/// Kotlin to android.util.Log.
#[uniffi::export(callback_interface)]
pub trait LogCallback: Send + Sync {
    /// `target` is the module path, e.g. `mailsync::sync::orchestrator`.
    fn on_log(&self, level: FfiLogLevel, target: String, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancelled;
    use crate::models::HistoryCursor;
    use crate::sync::SyncStats;
    use uuid::Uuid;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            MailError::from(anyhow::Error::from(ApiError::ReauthRequired)),
            MailError::AuthRequired
        ));
        assert!(matches!(
            MailError::from(anyhow::Error::from(ApiError::Timeout)),
            MailError::Network { .. }
        ));
        assert!(matches!(
            MailError::from(anyhow::Error::from(OutboxError::NotFound(Uuid::nil()))),
            MailError::NotFound { .. }
        ));
        assert!(matches!(
            MailError::from(anyhow::Error::from(OutboxError::NoRecipients)),
            MailError::InvalidArgument { .. }
        ));
        assert!(matches!(
            MailError::from(anyhow::Error::from(Cancelled { step: "send" })),
            MailError::Sync { .. }
        ));
    }

    #[test]
    fn test_sync_outcome_conversion() {
        let synced = FfiSyncOutcome::from(AccountSyncOutcome {
            account_id: 1,
            outcome: SyncOutcome::Synced(SyncStats {
                mode: SyncMode::Incremental,
                history_records: 2,
                messages_upserted: 1,
                messages_deleted: 1,
                messages_skipped: 0,
                cursor: HistoryCursor::new("101"),
                duration_ms: 5,
            }),
        });
        assert_eq!(synced.status, FfiSyncStatus::Synced);
        assert_eq!(synced.mode, Some(FfiSyncMode::Incremental));
        assert_eq!(synced.cursor.as_deref(), Some("101"));

        let failed = FfiSyncOutcome::from(AccountSyncOutcome {
            account_id: 2,
            outcome: SyncOutcome::Failed {
                error: "boom".into(),
                needs_reauth: true,
            },
        });
        assert_eq!(failed.status, FfiSyncStatus::Failed);
        assert!(failed.needs_reauth);
        assert_eq!(failed.mode, None);
    }

    #[test]
    fn test_task_kind_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::from(FfiTaskKind::from(kind)), kind);
        }
    }
}
