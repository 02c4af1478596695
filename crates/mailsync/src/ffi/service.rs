//! MailService facade for UniFFI export
//!
//! Wraps a [`SyncEngine`] over SQLite and on-disk blob storage, with the
//! host platform supplying device signals, scheduling, credential storage
//! and notifications through callback interfaces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use log::warn;
use uuid::Uuid;

use super::logging::{init_ffi_logger, set_log_callback, set_log_level};
use crate::auth::{AccountDirectory, CredentialStore, InMemoryAccounts};
use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, GmailCredentials};
use crate::device::DeviceConditions;
use crate::engine::{EngineDeps, SyncEngine};
use crate::ffi::types::*;
use crate::gmail::{GmailClient, GmailTokenRefresher, StoredToken};
use crate::lifecycle::{TaskKind, TaskRequest, TaskScheduler, parse_task_kind};
use crate::models::{Account, MessageId, OAuthCredential};
use crate::notify::{NewMailNotification, Notifier};
use crate::storage::{EmailQuery, FileBlobStore, SqliteMailStore};

// ============================================================================
// Host adapters
// ============================================================================

struct HostDevice(Box<dyn DeviceConditionsCallback>);

impl DeviceConditions for HostDevice {
    fn is_network_available(&self) -> bool {
        self.0.is_network_available()
    }

    fn battery_level(&self) -> Option<f32> {
        self.0.battery_level()
    }

    fn is_low_power_mode(&self) -> bool {
        self.0.is_low_power_mode()
    }
}

struct HostScheduler(Box<dyn TaskSchedulerCallback>);

impl TaskScheduler for HostScheduler {
    fn submit(&self, request: &TaskRequest) -> anyhow::Result<()> {
        if !self.0.submit(FfiTaskRequest::from(request)) {
            bail!("Scheduler refused {}", request.identifier);
        }
        Ok(())
    }
}

struct HostNotifier(Box<dyn NotificationCallback>);

impl Notifier for HostNotifier {
    fn notify(&self, notification: &NewMailNotification) -> anyhow::Result<()> {
        self.0.post(FfiNotification::from(notification));
        Ok(())
    }
}

/// Keeps the in-memory registry current and hands refreshed tokens to the
/// host's secure storage.
struct HostCredentials {
    accounts: Arc<InMemoryAccounts>,
    callback: Box<dyn CredentialCallback>,
}

impl CredentialStore for HostCredentials {
    fn save_credential(&self, account_id: i64, credential: &OAuthCredential) -> anyhow::Result<()> {
        self.accounts.save_credential(account_id, credential)?;
        let json = serde_json::to_string(&StoredToken::from(credential))?;
        self.callback.save_token(account_id, json);
        Ok(())
    }
}

fn parse_token(token_json: &str) -> Result<OAuthCredential, MailError> {
    serde_json::from_str::<StoredToken>(token_json)
        .map(OAuthCredential::from)
        .map_err(|e| MailError::InvalidArgument {
            message: format!("Invalid token JSON: {}", e),
        })
}

fn task_kind(identifier: &str) -> Result<TaskKind, MailError> {
    parse_task_kind(identifier).map_err(|e| MailError::InvalidArgument {
        message: e.to_string(),
    })
}

fn parse_outbox_id(id: &str) -> Result<Uuid, MailError> {
    Uuid::parse_str(id).map_err(|e| MailError::InvalidArgument {
        message: format!("Invalid outbox id {}: {}", id, e),
    })
}

fn to_message_ids(ids: Vec<String>) -> Vec<MessageId> {
    ids.into_iter().map(MessageId::from).collect()
}

// ============================================================================
// MailService
// ============================================================================

/// Entry point for Swift/Kotlin.
///
/// Accounts live in memory; the host registers each signed-in account
/// (with the token from its secure storage) after constructing the service.
#[derive(uniffi::Object)]
pub struct MailService {
    engine: SyncEngine,
    accounts: Arc<InMemoryAccounts>,
}

#[uniffi::export]
impl MailService {
    /// # Arguments
    /// * `db_path` - SQLite database file
    /// * `blob_path` - Directory for prefetched message bodies
    /// * `attachment_path` - Directory for outbox attachments
    /// * `client_id` / `client_secret` - OAuth client (mobile clients have no secret)
    #[uniffi::constructor]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_path: String,
        blob_path: String,
        attachment_path: String,
        client_id: String,
        client_secret: Option<String>,
        device: Box<dyn DeviceConditionsCallback>,
        scheduler: Box<dyn TaskSchedulerCallback>,
        credentials: Box<dyn CredentialCallback>,
        notifier: Box<dyn NotificationCallback>,
    ) -> Result<Arc<Self>, MailError> {
        if let Some(parent) = PathBuf::from(&db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| MailError::Database {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let config = EngineConfig::load().unwrap_or_else(|e| {
            warn!("Ignoring unreadable engine config: {:#}", e);
            EngineConfig::default()
        });

        let store = Arc::new(SqliteMailStore::new(&db_path).context("Failed to open database")?);
        let blobs = Arc::new(FileBlobStore::new(&blob_path).context("Failed to open blob store")?);
        let accounts = Arc::new(InMemoryAccounts::new());

        let deps = EngineDeps {
            api: Arc::new(GmailClient::new(&config.network)),
            refresher: Arc::new(GmailTokenRefresher::new(
                GmailCredentials::new(client_id, client_secret),
                &config.network,
            )),
            credentials: Some(Arc::new(HostCredentials {
                accounts: accounts.clone(),
                callback: credentials,
            })),
            accounts: accounts.clone(),
            device: Arc::new(HostDevice(device)),
            scheduler: Arc::new(HostScheduler(scheduler)),
            notifier: Arc::new(HostNotifier(notifier)),
            blobs,
            attachment_root: PathBuf::from(attachment_path),
            summarizer: None,
        };

        let engine = SyncEngine::new(store, deps, config)?;
        Ok(Arc::new(Self { engine, accounts }))
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Register (or update) a signed-in account.
    ///
    /// `token_json` is the format produced by [`create_token_json`].
    pub fn register_account(
        &self,
        account_id: i64,
        email: String,
        display_name: Option<String>,
        token_json: String,
    ) -> Result<FfiAccount, MailError> {
        let mut account = Account::new(account_id, email, parse_token(&token_json)?);
        if let Some(name) = display_name {
            account = account.with_display_name(name);
        }
        self.accounts.upsert(account.clone());
        Ok(FfiAccount::from(account))
    }

    /// Forget an account. With `purge_data` its cached mail, sync state,
    /// summaries and bodies are deleted as well.
    pub fn remove_account(&self, account_id: i64, purge_data: bool) -> Result<(), MailError> {
        if self.accounts.remove(account_id).is_none() {
            return Err(MailError::NotFound {
                resource: format!("account {}", account_id),
            });
        }
        if purge_data {
            self.engine.remove_account_data(account_id)?;
        }
        Ok(())
    }

    pub fn list_accounts(&self) -> Vec<FfiAccount> {
        self.accounts
            .accounts()
            .into_iter()
            .map(FfiAccount::from)
            .collect()
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Foreground sync of every account. Returns no outcomes when offline.
    pub fn sync_now(&self) -> Vec<FfiSyncOutcome> {
        self.engine
            .sync_now(&CancellationToken::new())
            .into_iter()
            .map(FfiSyncOutcome::from)
            .collect()
    }

    pub fn sync_account(&self, account_id: i64) -> Result<FfiSyncOutcome, MailError> {
        let outcome = self.engine.sync_account(account_id, &CancellationToken::new())?;
        Ok(FfiSyncOutcome::from(crate::sync::AccountSyncOutcome {
            account_id,
            outcome,
        }))
    }

    /// List cached mail, newest first.
    pub fn list_emails(
        &self,
        account_id: i64,
        label: Option<String>,
        unread_only: bool,
        limit: u32,
    ) -> Result<Vec<FfiEmail>, MailError> {
        let mut query = EmailQuery::account(account_id).limit(limit as usize);
        if let Some(label) = label {
            query = query.with_label(label);
        }
        if unread_only {
            query = query.unread();
        }
        let emails = self.engine.store().list_emails(&query)?;
        Ok(emails.into_iter().map(FfiEmail::from).collect())
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Run the window the OS granted for `identifier`. Blocks until the work
    /// finishes or [`Self::expire_background_task`] is called.
    pub fn run_background_task(&self, identifier: String) -> Result<(), MailError> {
        let kind = task_kind(&identifier)?;
        self.engine.run_background_task(kind)?;
        Ok(())
    }

    /// OS expiration handler. Returns whether a window was running.
    pub fn expire_background_task(&self, identifier: String) -> Result<bool, MailError> {
        let kind = task_kind(&identifier)?;
        Ok(self.engine.expire_background_task(kind))
    }

    /// Submit the first window of every task kind (call at app launch).
    pub fn schedule_background_tasks(&self) -> Result<(), MailError> {
        self.engine.schedule_background_tasks()?;
        Ok(())
    }

    // ========================================================================
    // Outbox
    // ========================================================================

    /// Persist a message for sending. Returns once it is durable.
    pub fn enqueue_outbox(&self, draft: FfiOutboundDraft) -> Result<FfiOutboxItem, MailError> {
        let item = self.engine.outbox().enqueue(draft.into())?;
        Ok(FfiOutboxItem::from(item))
    }

    pub fn list_outbox(&self) -> Result<Vec<FfiOutboxItem>, MailError> {
        let items = self.engine.outbox().list()?;
        Ok(items.into_iter().map(FfiOutboxItem::from).collect())
    }

    pub fn drain_outbox(&self) -> Result<FfiDrainReport, MailError> {
        let report = self.engine.outbox().drain(&CancellationToken::new())?;
        Ok(FfiDrainReport::from(report))
    }

    /// Reset a failed item and send it right away.
    pub fn retry_outbox(&self, id: String) -> Result<FfiDrainReport, MailError> {
        let report = self.engine.outbox().retry(&parse_outbox_id(&id)?)?;
        Ok(FfiDrainReport::from(report))
    }

    pub fn delete_outbox(&self, id: String) -> Result<(), MailError> {
        self.engine.outbox().delete(&parse_outbox_id(&id)?)?;
        Ok(())
    }

    // ========================================================================
    // Derived content
    // ========================================================================

    pub fn get_summary(&self, account_id: i64, message_id: String) -> Result<Option<String>, MailError> {
        Ok(self.engine.summary(account_id, &MessageId::new(message_id))?)
    }

    /// Plain-text body, if it has been prefetched.
    pub fn get_cached_body(
        &self,
        account_id: i64,
        message_id: String,
    ) -> Result<Option<String>, MailError> {
        Ok(self.engine.cached_body(account_id, &MessageId::new(message_id))?)
    }

    // ========================================================================
    // Actions
    // ========================================================================

    pub fn set_read(
        &self,
        account_id: i64,
        message_ids: Vec<String>,
        is_read: bool,
    ) -> Result<(), MailError> {
        self.engine
            .actions()
            .set_read(account_id, &to_message_ids(message_ids), is_read)?;
        Ok(())
    }

    pub fn set_starred(
        &self,
        account_id: i64,
        message_ids: Vec<String>,
        starred: bool,
    ) -> Result<(), MailError> {
        self.engine
            .actions()
            .set_starred(account_id, &to_message_ids(message_ids), starred)?;
        Ok(())
    }

    pub fn archive(&self, account_id: i64, message_ids: Vec<String>) -> Result<(), MailError> {
        self.engine
            .actions()
            .archive(account_id, &to_message_ids(message_ids))?;
        Ok(())
    }
}

// ============================================================================
// Free Functions
// ============================================================================

/// Install the log forwarder. Safe to call more than once; later calls only
/// swap the callback and level.
#[uniffi::export]
pub fn initialize_logging(callback: Box<dyn LogCallback>, max_level: FfiLogLevel) {
    let level = log::Level::from(max_level);
    // Already installed on a second call
    let _ = init_ffi_logger(level);
    set_log_callback(Some(Arc::from(callback)));
    set_log_level(level);
}

#[uniffi::export]
pub fn set_logging_level(max_level: FfiLogLevel) {
    set_log_level(max_level.into());
}

/// Token JSON expected by [`MailService::register_account`] and handed to
/// [`CredentialCallback::save_token`].
///
/// # Arguments
/// * `access_token` - The OAuth access token
/// * `refresh_token` - The OAuth refresh token (optional but recommended)
/// * `expires_at` - Unix timestamp when the token expires (optional)
#[uniffi::export]
pub fn create_token_json(
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
) -> String {
    let token = StoredToken {
        access_token,
        refresh_token,
        expires_at,
    };
    serde_json::to_string(&token).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_json_round_trip() {
        let json = create_token_json("access".into(), Some("refresh".into()), Some(1_700_000_000));
        let cred = parse_token(&json).unwrap();
        assert_eq!(cred.access_token, "access");
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(cred.expires_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(parse_token("not json"), Err(MailError::InvalidArgument { .. })));
        assert!(matches!(parse_outbox_id("42"), Err(MailError::InvalidArgument { .. })));
    }

    struct OfflineHost;

    impl DeviceConditionsCallback for OfflineHost {
        fn is_network_available(&self) -> bool {
            false
        }

        fn battery_level(&self) -> Option<f32> {
            None
        }

        fn is_low_power_mode(&self) -> bool {
            false
        }
    }

    impl TaskSchedulerCallback for OfflineHost {
        fn submit(&self, _request: FfiTaskRequest) -> bool {
            true
        }
    }

    impl CredentialCallback for OfflineHost {
        fn save_token(&self, _account_id: i64, _token_json: String) {}
    }

    impl NotificationCallback for OfflineHost {
        fn post(&self, _notification: FfiNotification) {}
    }

    fn service(dir: &std::path::Path) -> Arc<MailService> {
        let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
        MailService::new(
            path("db/mail.db"),
            path("bodies"),
            path("outbox"),
            "client".into(),
            None,
            Box::new(OfflineHost),
            Box::new(OfflineHost),
            Box::new(OfflineHost),
            Box::new(OfflineHost),
        )
        .unwrap()
    }

    #[test]
    fn test_list_emails_reads_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let token = create_token_json("access".into(), None, None);
        service
            .register_account(1, "me@example.com".into(), None, token)
            .unwrap();

        let store = service.engine.store();
        for (id, labels) in [("a", &["INBOX", "UNREAD"][..]), ("b", &["INBOX"][..])] {
            store
                .upsert_email(crate::gmail::normalize_metadata(
                    &crate::testing::message(id, labels, 1),
                    1,
                ))
                .unwrap();
        }

        assert_eq!(service.list_emails(1, None, false, 10).unwrap().len(), 2);
        let unread = service
            .list_emails(1, Some("INBOX".into()), true, 10)
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "a");
        assert!(service.sync_now().is_empty());
        assert_eq!(service.list_accounts().len(), 1);
    }
}
