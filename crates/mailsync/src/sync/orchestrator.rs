//! Per-account sync control loop

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, info, warn};

use super::fetch::MessageFetcher;
use super::history::HistoryDeltaResolver;
use crate::auth::TokenRefreshCoordinator;
use crate::cancel::{CancellationToken, Cancelled};
use crate::config::SyncConfig;
use crate::gmail::{ApiError, MailApi};
use crate::models::{Account, Email, HistoryCursor, MessageId, SyncState, WorkerJob};
use crate::storage::{BlobStore, MailStore};

/// Receives work derived from freshly synced email. Must not block.
pub trait JobSink: Send + Sync {
    fn offer(&self, jobs: Vec<WorkerJob>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
    /// Full sync after the stored cursor was rejected
    FallbackFull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
    pub mode: SyncMode,
    pub history_records: usize,
    pub messages_upserted: usize,
    pub messages_deleted: usize,
    pub messages_skipped: usize,
    pub cursor: HistoryCursor,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced(SyncStats),
    Failed { error: String, needs_reauth: bool },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSyncOutcome {
    pub account_id: i64,
    pub outcome: SyncOutcome,
}

impl AccountSyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Synced(_))
    }
}

/// Changes a sync computed, ready to apply
struct SyncPlan {
    mode: SyncMode,
    history_records: usize,
    upserts: Vec<Email>,
    deletions: Vec<MessageId>,
    skipped: Vec<MessageId>,
    cursor: HistoryCursor,
}

pub struct SyncOrchestrator {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    store: Arc<dyn MailStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    fetcher: Arc<MessageFetcher>,
    resolver: HistoryDeltaResolver,
    config: SyncConfig,
    sinks: Vec<Arc<dyn JobSink>>,
}

impl SyncOrchestrator {
    pub fn new(
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        store: Arc<dyn MailStore>,
        config: SyncConfig,
    ) -> Self {
        let fetcher = Arc::new(MessageFetcher::new(
            api.clone(),
            auth.clone(),
            config.fetch_fan_out,
        ));
        let resolver = HistoryDeltaResolver::new(api.clone(), auth.clone(), fetcher.clone());
        Self {
            api,
            auth,
            store,
            blobs: None,
            fetcher,
            resolver,
            config,
            sinks: Vec::new(),
        }
    }

    /// Also drop cached bodies of deleted messages.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn JobSink>) {
        self.sinks.push(sink);
    }

    /// Sync every account in turn. An account's failure never stops the
    /// others; cancellation stops the pass.
    pub fn run_sync(
        &self,
        accounts: &[Account],
        cancel: &CancellationToken,
    ) -> Vec<AccountSyncOutcome> {
        let mut outcomes = Vec::with_capacity(accounts.len());

        for account in accounts {
            let outcome = if cancel.is_cancelled() {
                SyncOutcome::Cancelled
            } else {
                self.sync_account(account, cancel)
            };
            outcomes.push(AccountSyncOutcome {
                account_id: account.id,
                outcome,
            });
        }

        let synced = outcomes.iter().filter(|o| o.is_success()).count();
        info!("[SYNC] Pass complete: {}/{} accounts synced", synced, accounts.len());
        outcomes
    }

    /// Sync one account and classify the result.
    pub fn sync_account(&self, account: &Account, cancel: &CancellationToken) -> SyncOutcome {
        let start = Instant::now();
        match self.try_sync_account(account, cancel) {
            Ok(mut stats) => {
                stats.duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    "[SYNC] {}: {:?} sync done (+{} -{} skipped {}) in {}ms",
                    account.email,
                    stats.mode,
                    stats.messages_upserted,
                    stats.messages_deleted,
                    stats.messages_skipped,
                    stats.duration_ms
                );
                SyncOutcome::Synced(stats)
            }
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
                info!("[SYNC] {}: {}", account.email, e);
                SyncOutcome::Cancelled
            }
            Err(e) => {
                let needs_reauth = matches!(e.downcast_ref::<ApiError>(), Some(ApiError::ReauthRequired));
                warn!("[SYNC] {}: sync failed: {:#}", account.email, e);
                SyncOutcome::Failed {
                    error: format!("{:#}", e),
                    needs_reauth,
                }
            }
        }
    }

    fn try_sync_account(&self, account: &Account, cancel: &CancellationToken) -> Result<SyncStats> {
        let state = self.store.get_sync_state(account.id)?;

        let plan = match &state {
            None => self.plan_full(account, SyncMode::Full, cancel)?,
            Some(state) => match self.plan_incremental(account, state, cancel) {
                Ok(plan) => plan,
                Err(e) if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::InvalidCursor)) => {
                    warn!(
                        "[SYNC] {}: cursor {} rejected, falling back to full sync",
                        account.email, state.cursor
                    );
                    self.plan_full(account, SyncMode::FallbackFull, cancel)?
                }
                Err(e) => return Err(e),
            },
        };

        self.apply(account, state, plan, cancel)
    }

    fn plan_full(
        &self,
        account: &Account,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncPlan> {
        // Cursor is read before listing; changes made meanwhile replay on
        // the next incremental sync.
        cancel.check("profile")?;
        let profile = self.auth.call_with_auth(account, |a| self.api.get_profile(a))?;

        cancel.check("message list")?;
        let listing = self.auth.call_with_auth(account, |a| {
            self.api.list_messages(
                a,
                Some(self.config.full_sync_label.as_str()),
                None,
                self.config.full_sync_batch,
                None,
            )
        })?;
        let ids: Vec<MessageId> = listing
            .messages
            .iter()
            .map(|m| MessageId::new(&m.id))
            .collect();
        debug!("[SYNC] {}: full sync of {} messages", account.email, ids.len());

        let fetched = self.fetcher.fetch_metadata(account, &ids, cancel)?;

        Ok(SyncPlan {
            mode,
            history_records: 0,
            upserts: fetched.emails,
            deletions: fetched.missing,
            skipped: fetched.skipped,
            cursor: HistoryCursor::new(profile.history_id),
        })
    }

    fn plan_incremental(
        &self,
        account: &Account,
        state: &SyncState,
        cancel: &CancellationToken,
    ) -> Result<SyncPlan> {
        let resolved = self
            .resolver
            .resolve(account, &state.cursor, &state.retry_ids, cancel)?;

        let reported = resolved
            .delta
            .cursor
            .clone()
            .unwrap_or_else(|| state.cursor.clone());
        let cursor = if reported.is_newer_than(&state.cursor) {
            reported
        } else {
            warn!(
                "[SYNC] {}: server reported older cursor {} (have {}), keeping stored one",
                account.email, reported, state.cursor
            );
            state.cursor.clone()
        };

        let deletions = resolved.deletions();
        Ok(SyncPlan {
            mode: SyncMode::Incremental,
            history_records: resolved.delta.records,
            upserts: resolved.fetched.emails,
            deletions,
            skipped: resolved.fetched.skipped,
            cursor,
        })
    }

    fn apply(
        &self,
        account: &Account,
        previous: Option<SyncState>,
        plan: SyncPlan,
        cancel: &CancellationToken,
    ) -> Result<SyncStats> {
        cancel.check("cache write")?;
        self.store
            .apply_changes(account.id, &plan.upserts, &plan.deletions)?;

        // Cursor only moves once the cache holds what it describes
        let state = match (plan.mode, previous) {
            (SyncMode::Incremental, Some(previous)) => {
                previous.advanced(plan.cursor.clone(), plan.skipped.clone())
            }
            _ => SyncState::after_full_sync(account.id, plan.cursor.clone())
                .with_retry_ids(plan.skipped.clone()),
        };
        self.store.save_sync_state(&state)?;

        if let Some(blobs) = &self.blobs {
            for id in &plan.deletions {
                if let Err(e) = blobs.delete_message(account.id, id) {
                    debug!("[SYNC] Failed to drop cached body of {}: {}", id, e);
                }
            }
        }

        if !plan.upserts.is_empty() {
            let jobs: Vec<WorkerJob> = plan.upserts.iter().map(WorkerJob::from).collect();
            for sink in &self.sinks {
                sink.offer(jobs.clone());
            }
        }

        Ok(SyncStats {
            mode: plan.mode,
            history_records: plan.history_records,
            messages_upserted: plan.upserts.len(),
            messages_deleted: plan.deletions.len(),
            messages_skipped: plan.skipped.len(),
            cursor: plan.cursor,
            duration_ms: 0,
        })
    }
}
