//! Durable send queue
//!
//! Messages composed offline wait here until the network is back. Each
//! drain attempt counts against the item's retry budget; once the budget
//! is spent the item stays `failed` until the user retries or deletes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use uuid::Uuid;

use super::OutboxError;
use super::attachments::AttachmentStore;
use super::compose::compose_message;
use crate::auth::{AccountDirectory, TokenRefreshCoordinator};
use crate::cancel::CancellationToken;
use crate::config::OutboxConfig;
use crate::device::DeviceConditions;
use crate::gmail::MailApi;
use crate::models::{OutboundDraft, OutboxStatus, QueuedOutboundEmail};
use crate::storage::OutboxStore;

/// What one drain did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    /// Attempts that failed but will be retried
    pub retried: usize,
    /// Items that reached terminal `failed` in this drain
    pub failed: usize,
    /// Another drain was already in progress; nothing was done
    pub already_running: bool,
    /// Stopped early because the network went away
    pub offline: bool,
    pub cancelled: bool,
}

enum Attempt {
    Sent,
    WillRetry,
    Failed,
}

/// Clears the draining flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OutboxQueue {
    store: Arc<dyn OutboxStore>,
    attachments: AttachmentStore,
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    accounts: Arc<dyn AccountDirectory>,
    device: Arc<dyn DeviceConditions>,
    config: OutboxConfig,
    draining: AtomicBool,
}

impl OutboxQueue {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        attachments: AttachmentStore,
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        accounts: Arc<dyn AccountDirectory>,
        device: Arc<dyn DeviceConditions>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            attachments,
            api,
            auth,
            accounts,
            device,
            config,
            draining: AtomicBool::new(false),
        }
    }

    /// Persist a draft. Attachments hit the disk before the row does, so a
    /// stored row never points at missing files.
    pub fn enqueue(&self, draft: OutboundDraft) -> Result<QueuedOutboundEmail> {
        if draft.to.is_empty() && draft.cc.is_empty() && draft.bcc.is_empty() {
            return Err(OutboxError::NoRecipients.into());
        }

        let id = Uuid::new_v4();
        let refs = self.attachments.write(&id, &draft.attachments)?;
        let item = QueuedOutboundEmail::from_draft(id, &draft, refs);

        if let Err(e) = self.store.insert_outbox(&item) {
            let _ = self.attachments.remove(&id);
            return Err(e).context("Failed to queue message");
        }

        info!(
            "[OUTBOX] Queued {} ({} attachments) for account {}",
            id,
            item.attachments.len(),
            item.account_id
        );
        Ok(item)
    }

    pub fn list(&self) -> Result<Vec<QueuedOutboundEmail>> {
        self.store.list_outbox()
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<QueuedOutboundEmail>> {
        self.store.get_outbox(id)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Send pending items oldest first. A second caller while a drain is
    /// running returns immediately with `already_running`.
    pub fn drain(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[OUTBOX] Drain already running");
            return Ok(DrainReport {
                already_running: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        let pending: Vec<_> = self
            .store
            .list_outbox()?
            .into_iter()
            .filter(|item| item.status == OutboxStatus::Pending)
            .collect();

        for item in pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.device.is_network_available() {
                report.offline = true;
                break;
            }

            // The user may have deleted or retried it since the listing
            let Some(item) = self
                .store
                .get_outbox(&item.id)?
                .filter(|current| current.status == OutboxStatus::Pending)
            else {
                debug!("[OUTBOX] {} no longer pending, skipping", item.id);
                continue;
            };

            let id = item.id;
            match self.attempt(item) {
                Ok(Attempt::Sent) => report.sent += 1,
                Ok(Attempt::WillRetry) => report.retried += 1,
                Ok(Attempt::Failed) => report.failed += 1,
                Err(e) if self.store.get_outbox(&id)?.is_none() => {
                    debug!("[OUTBOX] {} removed during its attempt: {:#}", id, e);
                }
                Err(e) => return Err(e),
            }
        }

        if report.sent + report.retried + report.failed > 0 || report.offline {
            info!(
                "[OUTBOX] Drain: {} sent, {} to retry, {} failed{}",
                report.sent,
                report.retried,
                report.failed,
                if report.offline { " (went offline)" } else { "" }
            );
        }
        Ok(report)
    }

    fn attempt(&self, mut item: QueuedOutboundEmail) -> Result<Attempt> {
        item.status = OutboxStatus::Sending;
        self.store.update_outbox(&item)?;

        match self.send(&item) {
            Ok(()) => {
                self.store.delete_outbox(&item.id)?;
                if let Err(e) = self.attachments.remove(&item.id) {
                    warn!("[OUTBOX] Sent {} but could not remove attachments: {}", item.id, e);
                }
                info!("[OUTBOX] Sent {}", item.id);
                Ok(Attempt::Sent)
            }
            Err(e) => {
                item.retry_count += 1;
                item.last_error = Some(format!("{:#}", e));
                let outcome = if item.retry_count >= self.config.max_retries {
                    item.status = OutboxStatus::Failed;
                    Attempt::Failed
                } else {
                    item.status = OutboxStatus::Pending;
                    Attempt::WillRetry
                };
                warn!(
                    "[OUTBOX] Send of {} failed (attempt {}/{}): {:#}",
                    item.id, item.retry_count, self.config.max_retries, e
                );
                self.store.update_outbox(&item)?;
                Ok(outcome)
            }
        }
    }

    fn send(&self, item: &QueuedOutboundEmail) -> Result<()> {
        let account = self
            .accounts
            .account(item.account_id)
            .with_context(|| format!("Account {} is not registered", item.account_id))?;

        let files = item
            .attachments
            .iter()
            .map(|a| Ok((a.clone(), self.attachments.read(a)?)))
            .collect::<Result<Vec<_>>>()?;
        let raw = compose_message(&account, item, &files)?;

        self.auth.call_with_auth(&account, |a| {
            self.api.send(a, &raw, item.thread_id.as_deref())
        })?;
        Ok(())
    }

    /// Reset a failed item and drain right away.
    pub fn retry(&self, id: &Uuid) -> Result<DrainReport> {
        let mut item = self.store.get_outbox(id)?.ok_or(OutboxError::NotFound(*id))?;
        if item.status == OutboxStatus::Sending {
            return Err(OutboxError::InFlight(*id).into());
        }

        item.status = OutboxStatus::Pending;
        item.retry_count = 0;
        item.last_error = None;
        self.store.update_outbox(&item)?;
        info!("[OUTBOX] Retrying {}", id);

        self.drain(&CancellationToken::new())
    }

    /// Remove an item and its files. Refused while it is being sent.
    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let item = self.store.get_outbox(id)?.ok_or(OutboxError::NotFound(*id))?;
        if item.status == OutboxStatus::Sending {
            return Err(OutboxError::InFlight(*id).into());
        }

        self.store.delete_outbox(id)?;
        self.attachments.remove(id)?;
        info!("[OUTBOX] Deleted {}", id);
        Ok(())
    }

    /// Rows left in `sending` by a crash may or may not have gone out.
    /// Mark them failed so the user decides whether to resend.
    pub fn recover_interrupted(&self) -> Result<usize> {
        if self.is_draining() {
            return Ok(0);
        }

        let mut recovered = 0;
        for mut item in self.store.list_outbox()? {
            if item.status != OutboxStatus::Sending {
                continue;
            }
            item.status = OutboxStatus::Failed;
            item.last_error =
                Some("Interrupted while sending; it may have been delivered".to_string());
            self.store.update_outbox(&item)?;
            recovered += 1;
        }

        if recovered > 0 {
            warn!("[OUTBOX] Marked {} interrupted sends as failed", recovered);
        }
        Ok(recovered)
    }
}
