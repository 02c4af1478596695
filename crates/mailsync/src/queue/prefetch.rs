//! Body prefetch
//!
//! Downloads full messages ahead of time so opening them, and summarizing
//! them, works offline.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;

use super::JobAction;
use crate::auth::{AccountDirectory, TokenRefreshCoordinator};
use crate::cancel::CancellationToken;
use crate::gmail::{MailApi, MessageContent, extract_content};
use crate::models::WorkerJob;
use crate::storage::{BlobKey, BlobStore};

/// Fetches message bodies into the [`BlobStore`]
pub struct BodyFetcher {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    accounts: Arc<dyn AccountDirectory>,
    blobs: Arc<dyn BlobStore>,
}

impl BodyFetcher {
    pub fn new(
        api: Arc<dyn MailApi>,
        auth: Arc<TokenRefreshCoordinator>,
        accounts: Arc<dyn AccountDirectory>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            api,
            auth,
            accounts,
            blobs,
        }
    }

    pub fn is_cached(&self, job: &WorkerJob) -> Result<bool> {
        self.blobs
            .exists(&BlobKey::text(job.account_id, &job.message_id))
    }

    pub fn cached_text(&self, job: &WorkerJob) -> Result<Option<String>> {
        self.blobs.get_text(job.account_id, &job.message_id)
    }

    /// Download and cache both bodies. The text body is always written
    /// (possibly empty) so the message counts as cached afterwards.
    pub fn fetch(&self, job: &WorkerJob, cancel: &CancellationToken) -> Result<MessageContent> {
        let account = self
            .accounts
            .account(job.account_id)
            .with_context(|| format!("Account {} is not registered", job.account_id))?;

        cancel.check("body fetch")?;
        let message = self
            .auth
            .call_with_auth(&account, |a| self.api.get_message_full(a, &job.message_id))?;
        let content = extract_content(&message);

        cancel.check("body write")?;
        if let Some(html) = &content.html {
            self.blobs
                .put(&BlobKey::html(job.account_id, &job.message_id), html.as_bytes())?;
        }
        let text = content.readable_text().unwrap_or_default();
        self.blobs
            .put(&BlobKey::text(job.account_id, &job.message_id), text.as_bytes())?;

        debug!(
            "[QUEUE] Cached body of {} ({} bytes text{})",
            job.message_id,
            text.len(),
            if content.html.is_some() { ", html" } else { "" }
        );
        Ok(content)
    }
}

pub struct PrefetchAction {
    bodies: Arc<BodyFetcher>,
}

impl PrefetchAction {
    pub fn new(bodies: Arc<BodyFetcher>) -> Self {
        Self { bodies }
    }
}

impl JobAction for PrefetchAction {
    fn name(&self) -> &'static str {
        "prefetch"
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn is_satisfied(&self, job: &WorkerJob) -> Result<bool> {
        self.bodies.is_cached(job)
    }

    fn perform(&self, job: &WorkerJob, cancel: &CancellationToken) -> Result<()> {
        self.bodies.fetch(job, cancel).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAccounts;
    use crate::gmail::normalize_metadata;
    use crate::storage::InMemoryBlobStore;
    use crate::testing::{FakeMailApi, account, coordinator, message};

    fn setup() -> (PrefetchAction, Arc<FakeMailApi>, Arc<InMemoryBlobStore>) {
        let api = FakeMailApi::new();
        let accounts = Arc::new(InMemoryAccounts::new());
        accounts.upsert(account(1));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let bodies = Arc::new(BodyFetcher::new(api.clone(), coordinator(), accounts, blobs.clone()));
        (PrefetchAction::new(bodies), api, blobs)
    }

    #[test]
    fn test_prefetch_caches_text_body() {
        let (action, api, blobs) = setup();
        let msg = message("m1", &["INBOX"], 1);
        api.add_message(1, msg.clone());
        let job = WorkerJob::from(&normalize_metadata(&msg, 1));

        assert!(!action.is_satisfied(&job).unwrap());
        action.perform(&job, &CancellationToken::new()).unwrap();

        assert!(action.is_satisfied(&job).unwrap());
        let text = blobs.get_text(1, &job.message_id).unwrap().unwrap();
        assert!(text.contains("Body of m1"));
        assert_eq!(api.state().full_calls, vec!["m1"]);
    }

    #[test]
    fn test_missing_message_fails() {
        let (action, _api, _blobs) = setup();
        let job = WorkerJob::from(&normalize_metadata(&message("gone", &["INBOX"], 1), 1));
        assert!(action.perform(&job, &CancellationToken::new()).is_err());
        assert!(!action.is_satisfied(&job).unwrap());
    }
}
