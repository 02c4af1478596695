//! Bounded parallel metadata fetch

use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use rayon::prelude::*;

use crate::auth::TokenRefreshCoordinator;
use crate::cancel::CancellationToken;
use crate::gmail::{ApiError, MailApi, normalize_metadata};
use crate::models::{Account, Email, MessageId};

/// Result of fetching a batch of message ids.
///
/// Every requested id ends up in exactly one of the three lists.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchFetch {
    pub emails: Vec<Email>,
    /// Transient failures, worth retrying on the next pass
    pub skipped: Vec<MessageId>,
    /// Gone on the server (404)
    pub missing: Vec<MessageId>,
}

impl BatchFetch {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.skipped.is_empty() && self.missing.is_empty()
    }
}

pub struct MessageFetcher {
    api: Arc<dyn MailApi>,
    auth: Arc<TokenRefreshCoordinator>,
    fan_out: usize,
}

impl MessageFetcher {
    pub fn new(api: Arc<dyn MailApi>, auth: Arc<TokenRefreshCoordinator>, fan_out: usize) -> Self {
        Self {
            api,
            auth,
            fan_out: fan_out.max(1),
        }
    }

    /// Fetch metadata for `ids`, at most `fan_out` requests at a time.
    ///
    /// Per-id failures are absorbed into `skipped`/`missing`. Only a
    /// definitive auth failure or cancellation aborts the batch.
    pub fn fetch_metadata(
        &self,
        account: &Account,
        ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<BatchFetch> {
        let mut batch = BatchFetch::default();

        for chunk in ids.chunks(self.fan_out) {
            cancel.check("message fetch")?;

            let results: Vec<(MessageId, Result<Email, ApiError>)> = chunk
                .par_iter()
                .map(|id| {
                    let result = self
                        .auth
                        .call_with_auth(account, |a| self.api.get_message_metadata(a, id))
                        .map(|msg| normalize_metadata(&msg, account.id));
                    (id.clone(), result)
                })
                .collect();

            for (id, result) in results {
                match result {
                    Ok(email) => batch.emails.push(email),
                    Err(ApiError::NotFound) => {
                        debug!("[SYNC] Message {} no longer exists", id);
                        batch.missing.push(id);
                    }
                    Err(ApiError::ReauthRequired) => return Err(ApiError::ReauthRequired.into()),
                    Err(e) => {
                        warn!("[SYNC] Skipping message {}: {}", id, e);
                        batch.skipped.push(id);
                    }
                }
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMailApi, account, coordinator, message};

    fn ids(raw: &[&str]) -> Vec<MessageId> {
        raw.iter().map(|s| MessageId::new(*s)).collect()
    }

    fn fetcher(api: &Arc<FakeMailApi>) -> MessageFetcher {
        MessageFetcher::new(api.clone(), coordinator(), 3)
    }

    #[test]
    fn test_partial_failures_are_sorted_out() {
        let api = FakeMailApi::new();
        api.add_message(1, message("a", &["INBOX"], 1));
        api.add_message(1, message("d", &["INBOX"], 2));
        api.add_message(1, message("b", &["INBOX"], 3));
        api.add_message(1, message("e", &["INBOX"], 4));
        api.state().fetch_errors.insert("b".into(), ApiError::Timeout);
        api.state().fetch_errors.insert("e".into(), ApiError::RateLimited);

        let batch = fetcher(&api)
            .fetch_metadata(&account(1), &ids(&["a", "b", "c", "d", "e"]), &CancellationToken::new())
            .unwrap();

        let mut fetched: Vec<_> = batch.emails.iter().map(|e| e.id.as_str()).collect();
        fetched.sort();
        assert_eq!(fetched, vec!["a", "d"]);
        assert_eq!(batch.missing, ids(&["c"]));
        let mut skipped = batch.skipped.clone();
        skipped.sort();
        assert_eq!(skipped, ids(&["b", "e"]));
        assert_eq!(api.state().metadata_calls.len(), 5);
    }

    #[test]
    fn test_reauth_aborts_batch() {
        let api = FakeMailApi::new();
        api.add_message(1, message("a", &["INBOX"], 1));
        api.state().fetch_errors.insert("b".into(), ApiError::Unauthenticated);

        let err = fetcher(&api)
            .fetch_metadata(&account(1), &ids(&["a", "b"]), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ApiError>(), Some(&ApiError::ReauthRequired));
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let api = FakeMailApi::new();
        api.add_message(1, message("a", &["INBOX"], 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(&api)
            .fetch_metadata(&account(1), &ids(&["a"]), &cancel)
            .unwrap_err();
        assert!(crate::cancel::is_cancelled_error(&err));
        assert!(api.state().metadata_calls.is_empty());
    }
}
