//! Gmail REST client
//!
//! Blocking HTTP over `ureq` so the engine stays executor-agnostic. Every
//! request carries a global timeout. Idempotent GETs are retried on
//! transient failures with exponential backoff and jitter; POSTs are sent
//! exactly once.

use base64::prelude::*;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use ureq::Agent;
use ureq::http::Response;

use super::api::{
    BatchModifyRequest, GmailMessage, HistoryResponse, ListMessagesResponse, ModifyRequest,
    ProfileResponse, SendRequest, SendResponse,
};
use super::{ApiError, METADATA_HEADERS, MailApi};
use crate::config::NetworkConfig;
use crate::models::{Account, HistoryCursor, MessageId};

pub struct GmailClient {
    agent: Agent,
    base_url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl GmailClient {
    pub const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(network: &NetworkConfig) -> Self {
        Self::with_base_url(Self::BASE_URL, network)
    }

    /// Point the client at another host (tests, proxies).
    pub fn with_base_url(base_url: impl Into<String>, network: &NetworkConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(network.request_timeout()))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts: network.max_attempts.max(1),
            initial_backoff: Duration::from_millis(network.initial_backoff_ms),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me{}", self.base_url, path)
    }

    /// GET with retry on transient failures.
    fn get_json<T: DeserializeOwned>(
        &self,
        account: &Account,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut delay = self.initial_backoff;

        for attempt in 1..=self.max_attempts {
            let mut request = self.agent.get(&url).header("Authorization", &bearer(account));
            for (key, value) in query {
                request = request.query(*key, value);
            }
            let result = request.call().map_err(ApiError::from).and_then(read_json);

            match result {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "[GMAIL] GET {} failed (attempt {}/{}): {}",
                        path, attempt, self.max_attempts, e
                    );
                    let jitter = Duration::from_millis(rand::random_range(0..100));
                    std::thread::sleep(delay + jitter);
                    delay *= 2;
                }
                other => return other,
            }
        }

        Err(ApiError::Other(format!("no attempts made for {}", path)))
    }

    /// POST a JSON body once and return the raw success body.
    fn post_json<B: Serialize>(
        &self,
        account: &Account,
        path: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        let response = self
            .agent
            .post(&self.url(path))
            .header("Authorization", &bearer(account))
            .send_json(body)?;
        read_text(response)
    }
}

fn bearer(account: &Account) -> String {
    format!("Bearer {}", account.access_token())
}

fn check_status(response: &mut Response<ureq::Body>) -> Result<(), ApiError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(());
    }
    let body = response.body_mut().read_to_string().unwrap_or_default();
    Err(ApiError::from_status(status, &body))
}

fn read_json<T: DeserializeOwned>(mut response: Response<ureq::Body>) -> Result<T, ApiError> {
    check_status(&mut response)?;
    response
        .body_mut()
        .read_json()
        .map_err(|e| ApiError::Decode(e.to_string()))
}

fn read_text(mut response: Response<ureq::Body>) -> Result<String, ApiError> {
    check_status(&mut response)?;
    response.body_mut().read_to_string().map_err(ApiError::from)
}

impl MailApi for GmailClient {
    fn list_messages(
        &self,
        account: &Account,
        label: Option<&str>,
        query: Option<&str>,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ApiError> {
        let mut params = vec![("maxResults", max_results.clamp(1, 500).to_string())];
        if let Some(label) = label {
            params.push(("labelIds", label.to_string()));
        }
        if let Some(q) = query {
            params.push(("q", q.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        self.get_json(account, "/messages", &params)
    }

    fn get_message_metadata(
        &self,
        account: &Account,
        id: &MessageId,
    ) -> Result<GmailMessage, ApiError> {
        let mut params = vec![("format", "metadata".to_string())];
        params.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", h.to_string())));
        let path = format!("/messages/{}", urlencoding::encode(id.as_str()));
        self.get_json(account, &path, &params)
    }

    fn get_message_full(&self, account: &Account, id: &MessageId) -> Result<GmailMessage, ApiError> {
        let path = format!("/messages/{}", urlencoding::encode(id.as_str()));
        self.get_json(account, &path, &[("format", "full".to_string())])
    }

    fn list_history(
        &self,
        account: &Account,
        start: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse, ApiError> {
        let mut params = vec![("startHistoryId", start.as_str().to_string())];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        match self.get_json(account, "/history", &params) {
            Err(ApiError::NotFound) => {
                debug!("[GMAIL] history cursor {} rejected for {}", start, account.email);
                Err(ApiError::InvalidCursor)
            }
            other => other,
        }
    }

    fn get_profile(&self, account: &Account) -> Result<ProfileResponse, ApiError> {
        self.get_json(account, "/profile", &[])
    }

    fn modify_labels(
        &self,
        account: &Account,
        id: &MessageId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        let path = format!("/messages/{}/modify", urlencoding::encode(id.as_str()));
        let body = ModifyRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        };
        self.post_json(account, &path, &body).map(|_| ())
    }

    fn batch_modify_labels(
        &self,
        account: &Account,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = BatchModifyRequest {
            ids: ids.iter().map(|id| id.as_str()).collect(),
            add_label_ids: add,
            remove_label_ids: remove,
        };
        self.post_json(account, "/messages/batchModify", &body)
            .map(|_| ())
    }

    fn send(
        &self,
        account: &Account,
        raw: &[u8],
        thread_id: Option<&str>,
    ) -> Result<MessageId, ApiError> {
        let body = SendRequest {
            raw: BASE64_URL_SAFE.encode(raw),
            thread_id,
        };
        let text = self.post_json(account, "/messages/send", &body)?;
        let sent: SendResponse =
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(MessageId::new(sent.id))
    }
}
