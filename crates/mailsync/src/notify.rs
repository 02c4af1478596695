//! New-mail notifications
//!
//! Each check lists unread inbox mail on the server and announces every
//! message the device has not announced before. Announced ids are kept in a
//! [`SeenIdStore`] namespace and pruned once they are older than the dedup
//! window.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{debug, info, warn};

use crate::auth::TokenRefreshCoordinator;
use crate::cancel::{CancellationToken, is_cancelled_error};
use crate::config::NotificationConfig;
use crate::gmail::{MailApi, normalize_metadata};
use crate::models::{Account, Email, MessageId, labels};
use crate::storage::{MailStore, SeenIdStore};

/// Seen-id namespace of announced messages
pub const NOTIFIED: &str = "notified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMailNotification {
    pub account_id: i64,
    pub message_id: MessageId,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
}

impl From<&Email> for NewMailNotification {
    fn from(email: &Email) -> Self {
        Self {
            account_id: email.account_id,
            message_id: email.id.clone(),
            thread_id: email.thread_id.as_str().to_string(),
            sender: email
                .from
                .name
                .clone()
                .unwrap_or_else(|| email.from.email.clone()),
            subject: email.subject.clone(),
            snippet: email.snippet.clone(),
        }
    }
}

/// Posts a notification to the user. Implemented by the host.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &NewMailNotification) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub announced: usize,
    pub already_seen: usize,
    pub failed_accounts: usize,
}

fn seen_key(account_id: i64, id: &MessageId) -> String {
    format!("{account_id}:{id}")
}

pub struct NotificationChecker {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    store: Arc<dyn MailStore>,
    seen: Arc<dyn SeenIdStore>,
    notifier: Arc<dyn Notifier>,
    config: NotificationConfig,
}

impl NotificationChecker {
    pub fn new(
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        store: Arc<dyn MailStore>,
        seen: Arc<dyn SeenIdStore>,
        notifier: Arc<dyn Notifier>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            api,
            auth,
            store,
            seen,
            notifier,
            config,
        }
    }

    /// Check every account. An account that fails is logged and skipped;
    /// cancellation stops the whole check.
    pub fn check(&self, accounts: &[Account], cancel: &CancellationToken) -> Result<NotifyReport> {
        let pruned = self
            .seen
            .prune_seen(NOTIFIED, Utc::now() - Duration::days(self.config.dedup_ttl_days))?;
        if pruned > 0 {
            debug!("[NOTIFY] Pruned {} expired entries", pruned);
        }

        let mut report = NotifyReport::default();
        for account in accounts {
            match self.check_account(account, cancel, &mut report) {
                Ok(()) => {}
                Err(e) if is_cancelled_error(&e) => return Err(e),
                Err(e) => {
                    warn!("[NOTIFY] Check failed for {}: {:#}", account.email, e);
                    report.failed_accounts += 1;
                }
            }
        }

        if report.announced > 0 {
            info!("[NOTIFY] Announced {} new message(s)", report.announced);
        }
        Ok(report)
    }

    fn check_account(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        report: &mut NotifyReport,
    ) -> Result<()> {
        cancel.check("notification listing")?;
        let listing = self.auth.call_with_auth(account, |a| {
            self.api.list_messages(
                a,
                Some(labels::INBOX),
                Some(&self.config.query),
                self.config.max_per_check,
                None,
            )
        })?;

        for msg_ref in listing.messages {
            let id = MessageId::new(msg_ref.id);
            let key = seen_key(account.id, &id);
            if self.seen.is_seen(NOTIFIED, &key)? {
                report.already_seen += 1;
                continue;
            }

            let email = match self.store.get_email(account.id, &id)? {
                Some(email) => email,
                None => {
                    cancel.check("notification fetch")?;
                    let msg = self
                        .auth
                        .call_with_auth(account, |a| self.api.get_message_metadata(a, &id))?;
                    normalize_metadata(&msg, account.id)
                }
            };
            if !email.is_unread() {
                continue;
            }

            self.notifier.notify(&NewMailNotification::from(&email))?;
            self.seen.mark_seen(NOTIFIED, &key, Utc::now())?;
            report.announced += 1;
        }
        Ok(())
    }
}
