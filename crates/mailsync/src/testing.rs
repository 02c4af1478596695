//! Scripted in-process fakes shared by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::auth::{TokenRefreshCoordinator, TokenRefresher};
use crate::cancel::CancellationToken;
use crate::gmail::api::{
    GmailMessage, Header, HistoryResponse, ListMessagesResponse, MessagePart, MessageRef,
    PartBody, ProfileResponse,
};
use crate::gmail::{ApiError, MailApi};
use crate::models::{Account, HistoryCursor, MessageId, OAuthCredential};

pub fn account(id: i64) -> Account {
    Account::new(id, format!("user{id}@example.com"), OAuthCredential::new(format!("token-{id}")))
}

pub fn message(id: &str, labels: &[&str], internal_date: i64) -> GmailMessage {
    GmailMessage {
        id: id.to_string(),
        thread_id: format!("t-{id}"),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        snippet: format!("snippet {id}"),
        internal_date: Some(internal_date.to_string()),
        history_id: None,
        payload: Some(MessagePart {
            mime_type: Some("text/plain".into()),
            headers: vec![
                Header {
                    name: "From".into(),
                    value: "Alice <alice@example.com>".into(),
                },
                Header {
                    name: "Subject".into(),
                    value: format!("subject {id}"),
                },
            ],
            body: Some(PartBody {
                size: None,
                data: Some(base64_url(&format!("Body of {id}. Second sentence."))),
                attachment_id: None,
            }),
            ..Default::default()
        }),
    }
}

fn base64_url(s: &str) -> String {
    use base64::prelude::*;
    BASE64_URL_SAFE_NO_PAD.encode(s)
}

#[derive(Default)]
pub struct FakeState {
    /// Per account: message id -> message
    pub messages: HashMap<(i64, String), GmailMessage>,
    /// Forced per-message fetch failures
    pub fetch_errors: HashMap<String, ApiError>,
    /// Per account: ids returned by `list_messages`, newest first
    pub listing: HashMap<i64, Vec<String>>,
    /// Per account: `(start cursor, page token)` -> page
    pub history: HashMap<(i64, String, Option<String>), Result<HistoryResponse, ApiError>>,
    pub profile_history_id: HashMap<i64, String>,
    /// Consumed front to back; an empty queue means success
    pub send_results: VecDeque<Result<(), ApiError>>,
    pub sent: Vec<(i64, Vec<u8>, Option<String>)>,
    pub label_changes: Vec<(Vec<String>, Vec<String>, Vec<String>)>,
    pub history_calls: Vec<(i64, String)>,
    pub metadata_calls: Vec<String>,
    /// Fired by every metadata fetch, like a window revoked mid-pass
    pub cancel_on_fetch: Option<CancellationToken>,
    pub full_calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeMailApi {
    state: Mutex<FakeState>,
}

impl FakeMailApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_message(&self, account_id: i64, msg: GmailMessage) {
        self.state().messages.insert((account_id, msg.id.clone()), msg);
    }

    pub fn set_listing(&self, account_id: i64, ids: &[&str]) {
        self.state()
            .listing
            .insert(account_id, ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_profile(&self, account_id: i64, history_id: &str) {
        self.state()
            .profile_history_id
            .insert(account_id, history_id.to_string());
    }

    pub fn set_history(
        &self,
        account_id: i64,
        start: &str,
        page_token: Option<&str>,
        page: Result<HistoryResponse, ApiError>,
    ) {
        self.state().history.insert(
            (account_id, start.to_string(), page_token.map(str::to_string)),
            page,
        );
    }

    fn lookup(&self, account: &Account, id: &MessageId) -> Result<GmailMessage, ApiError> {
        let state = self.state();
        if let Some(err) = state.fetch_errors.get(id.as_str()) {
            return Err(err.clone());
        }
        state
            .messages
            .get(&(account.id, id.to_string()))
            .cloned()
            .ok_or(ApiError::NotFound)
    }
}

impl MailApi for FakeMailApi {
    fn list_messages(
        &self,
        account: &Account,
        _label: Option<&str>,
        _query: Option<&str>,
        max_results: u32,
        _page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ApiError> {
        let state = self.state();
        let ids = state.listing.get(&account.id).cloned().unwrap_or_default();
        Ok(ListMessagesResponse {
            messages: ids
                .into_iter()
                .take(max_results as usize)
                .map(|id| MessageRef {
                    thread_id: format!("t-{id}"),
                    id,
                })
                .collect(),
            next_page_token: None,
            result_size_estimate: None,
        })
    }

    fn get_message_metadata(&self, account: &Account, id: &MessageId) -> Result<GmailMessage, ApiError> {
        {
            let mut state = self.state();
            state.metadata_calls.push(id.to_string());
            if let Some(cancel) = &state.cancel_on_fetch {
                cancel.cancel();
            }
        }
        self.lookup(account, id)
    }

    fn get_message_full(&self, account: &Account, id: &MessageId) -> Result<GmailMessage, ApiError> {
        self.state().full_calls.push(id.to_string());
        self.lookup(account, id)
    }

    fn list_history(
        &self,
        account: &Account,
        start: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse, ApiError> {
        let mut state = self.state();
        state.history_calls.push((account.id, start.to_string()));
        state
            .history
            .get(&(account.id, start.to_string(), page_token.map(str::to_string)))
            .cloned()
            .unwrap_or(Ok(HistoryResponse {
                history_id: Some(start.to_string()),
                ..Default::default()
            }))
    }

    fn get_profile(&self, account: &Account) -> Result<ProfileResponse, ApiError> {
        let state = self.state();
        Ok(ProfileResponse {
            email_address: account.email.clone(),
            messages_total: None,
            threads_total: None,
            history_id: state
                .profile_history_id
                .get(&account.id)
                .cloned()
                .unwrap_or_else(|| "1".to_string()),
        })
    }

    fn modify_labels(
        &self,
        _account: &Account,
        id: &MessageId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        self.state()
            .label_changes
            .push((vec![id.to_string()], add.to_vec(), remove.to_vec()));
        Ok(())
    }

    fn batch_modify_labels(
        &self,
        _account: &Account,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        self.state().label_changes.push((
            ids.iter().map(|id| id.to_string()).collect(),
            add.to_vec(),
            remove.to_vec(),
        ));
        Ok(())
    }

    fn send(&self, account: &Account, raw: &[u8], thread_id: Option<&str>) -> Result<MessageId, ApiError> {
        let mut state = self.state();
        state.send_results.pop_front().unwrap_or(Ok(()))?;
        state
            .sent
            .push((account.id, raw.to_vec(), thread_id.map(str::to_string)));
        Ok(MessageId::new(format!("sent-{}", Utc::now().timestamp_micros())))
    }
}

/// Refresher for accounts that never need one
pub struct NoRefresh;

impl TokenRefresher for NoRefresh {
    fn refresh(&self, _account: &Account) -> Result<OAuthCredential, ApiError> {
        Err(ApiError::ReauthRequired)
    }
}

pub fn coordinator() -> Arc<TokenRefreshCoordinator> {
    Arc::new(TokenRefreshCoordinator::new(Arc::new(NoRefresh)))
}
