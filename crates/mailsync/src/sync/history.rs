//! History delta resolution
//!
//! Walks the history log from a stored cursor and reduces it to the
//! smallest set of changes the cache needs: which ids to fetch and which to
//! delete. A message deleted anywhere in the window is deleted, whatever
//! else happened to it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};

use super::fetch::{BatchFetch, MessageFetcher};
use crate::auth::TokenRefreshCoordinator;
use crate::cancel::CancellationToken;
use crate::gmail::MailApi;
use crate::gmail::api::HistoryRecord;
use crate::models::{Account, HistoryCursor, MessageId};

/// Changes reported by one history window. The three id sets are
/// disjoint once [`HistoryDelta::finish`] has run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryDelta {
    pub added: HashSet<MessageId>,
    pub deleted: HashSet<MessageId>,
    pub label_changed: HashSet<MessageId>,
    /// Newest cursor the server reported
    pub cursor: Option<HistoryCursor>,
    pub records: usize,
}

impl HistoryDelta {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a HistoryRecord>) -> Self {
        let mut delta = Self::default();
        for record in records {
            delta.fold(record);
        }
        delta.finish()
    }

    pub fn fold(&mut self, record: &HistoryRecord) {
        self.records += 1;
        for change in &record.messages_added {
            self.added.insert(MessageId::new(&change.message.id));
        }
        for change in &record.messages_deleted {
            self.deleted.insert(MessageId::new(&change.message.id));
        }
        for change in record.labels_added.iter().chain(&record.labels_removed) {
            self.label_changed.insert(MessageId::new(&change.message.id));
        }
    }

    /// Deletion wins over everything; an added message's labels come with
    /// its fetch anyway.
    pub fn finish(mut self) -> Self {
        self.added.retain(|id| !self.deleted.contains(id));
        self.label_changed
            .retain(|id| !self.deleted.contains(id) && !self.added.contains(id));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.label_changed.is_empty()
    }

    /// Ids to fetch: added, label-changed and earlier skips, minus
    /// deletions. Sorted so fetch order is stable.
    pub fn ids_to_fetch(&self, retry_ids: &[MessageId]) -> Vec<MessageId> {
        self.added
            .iter()
            .chain(&self.label_changed)
            .chain(retry_ids)
            .filter(|id| !self.deleted.contains(*id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A delta together with the emails fetched for it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDelta {
    pub delta: HistoryDelta,
    pub fetched: BatchFetch,
}

impl ResolvedDelta {
    /// Ids to remove from the cache: reported deletions plus fetched ids
    /// the server no longer has.
    pub fn deletions(&self) -> Vec<MessageId> {
        let mut ids: BTreeSet<MessageId> = self.delta.deleted.iter().cloned().collect();
        ids.extend(self.fetched.missing.iter().cloned());
        ids.into_iter().collect()
    }
}

pub struct HistoryDeltaResolver {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    fetcher: Arc<MessageFetcher>,
}

impl HistoryDeltaResolver {
    pub fn new(
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        fetcher: Arc<MessageFetcher>,
    ) -> Self {
        Self { api, auth, fetcher }
    }

    /// Resolve everything after `cursor`.
    ///
    /// Errors from the history endpoint propagate unchanged (including
    /// [`ApiError::InvalidCursor`](crate::gmail::ApiError::InvalidCursor));
    /// deciding what to do about them is the caller's job.
    pub fn resolve(
        &self,
        account: &Account,
        cursor: &HistoryCursor,
        retry_ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<ResolvedDelta> {
        let mut delta = HistoryDelta::default();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            cancel.check("history page")?;

            let page = self.auth.call_with_auth(account, |a| {
                self.api.list_history(a, cursor, page_token.as_deref())
            })?;
            pages += 1;

            for record in &page.history {
                delta.fold(record);
            }
            if let Some(history_id) = page.history_id {
                delta.cursor = Some(HistoryCursor::new(history_id));
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let delta = delta.finish();
        debug!(
            "[HISTORY] {}: {} records over {} pages, +{} -{} ~{}",
            account.email,
            delta.records,
            pages,
            delta.added.len(),
            delta.deleted.len(),
            delta.label_changed.len()
        );

        let to_fetch = delta.ids_to_fetch(retry_ids);
        let fetched = if to_fetch.is_empty() {
            BatchFetch::default()
        } else {
            self.fetcher.fetch_metadata(account, &to_fetch, cancel)?
        };

        if !fetched.skipped.is_empty() {
            info!(
                "[HISTORY] {}: {} messages will be retried next sync",
                account.email,
                fetched.skipped.len()
            );
        }

        Ok(ResolvedDelta { delta, fetched })
    }
}
