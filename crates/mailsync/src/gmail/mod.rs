//! Gmail API integration
//!
//! - [`MailApi`]: the remote operations the engine depends on
//! - [`GmailClient`]: the REST implementation over blocking `ureq`
//! - [`GmailTokenRefresher`]: OAuth refresh-token grant
//! - Normalization from API payloads to cache records

mod auth;
mod client;
mod error;
mod normalize;

pub use auth::{GmailTokenRefresher, StoredToken};
pub use client::GmailClient;
pub use error::ApiError;
pub use normalize::{MessageContent, extract_content, normalize_metadata};

use crate::models::{Account, HistoryCursor, MessageId};

/// Headers requested with `format=metadata`
pub const METADATA_HEADERS: &[&str] = &["From", "To", "Subject", "Date", "List-Unsubscribe"];

/// Remote mailbox operations.
///
/// Every call is authorized by the access token of the account passed in;
/// token freshness is the caller's concern (see
/// [`crate::auth::TokenRefreshCoordinator`]).
pub trait MailApi: Send + Sync {
    /// List message ids, newest first.
    fn list_messages(
        &self,
        account: &Account,
        label: Option<&str>,
        query: Option<&str>,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<api::ListMessagesResponse, ApiError>;

    /// Headers, labels and snippet of one message.
    fn get_message_metadata(
        &self,
        account: &Account,
        id: &MessageId,
    ) -> Result<api::GmailMessage, ApiError>;

    /// Message including its MIME body parts.
    fn get_message_full(&self, account: &Account, id: &MessageId)
    -> Result<api::GmailMessage, ApiError>;

    /// One page of history after `start`. An unknown or expired cursor is
    /// [`ApiError::InvalidCursor`].
    fn list_history(
        &self,
        account: &Account,
        start: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<api::HistoryResponse, ApiError>;

    fn get_profile(&self, account: &Account) -> Result<api::ProfileResponse, ApiError>;

    fn modify_labels(
        &self,
        account: &Account,
        id: &MessageId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError>;

    fn batch_modify_labels(
        &self,
        account: &Account,
        ids: &[MessageId],
        add: &[String],
        remove: &[String],
    ) -> Result<(), ApiError>;

    /// Send an RFC 5322 message. Not idempotent; implementations must not
    /// retry on their own.
    fn send(
        &self,
        account: &Account,
        raw: &[u8],
        thread_id: Option<&str>,
    ) -> Result<MessageId, ApiError>;
}

/// Gmail API wire types
pub mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        #[serde(default)]
        pub messages: Vec<MessageRef>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        #[serde(default)]
        pub label_ids: Vec<String>,
        #[serde(default)]
        pub snippet: String,
        /// Milliseconds since epoch, as a decimal string
        pub internal_date: Option<String>,
        pub history_id: Option<String>,
        pub payload: Option<MessagePart>,
    }

    /// A MIME part. The top-level payload is a part too.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        #[serde(default)]
        pub headers: Vec<Header>,
        pub body: Option<PartBody>,
        #[serde(default)]
        pub parts: Vec<MessagePart>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PartBody {
        pub size: Option<u64>,
        /// base64url encoded content
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        #[serde(default)]
        pub history: Vec<HistoryRecord>,
        pub next_page_token: Option<String>,
        /// Mailbox's current history id
        pub history_id: Option<String>,
    }

    /// One history entry. Each change list is absent on the wire when it
    /// has no entries.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        #[serde(default)]
        pub messages_added: Vec<HistoryMessageChange>,
        #[serde(default)]
        pub messages_deleted: Vec<HistoryMessageChange>,
        #[serde(default)]
        pub labels_added: Vec<HistoryLabelChange>,
        #[serde(default)]
        pub labels_removed: Vec<HistoryLabelChange>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HistoryMessageChange {
        pub message: MessageRef,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MessageRef,
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub threads_total: Option<u64>,
        pub history_id: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ModifyRequest<'a> {
        pub add_label_ids: &'a [String],
        pub remove_label_ids: &'a [String],
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BatchModifyRequest<'a> {
        pub ids: Vec<&'a str>,
        pub add_label_ids: &'a [String],
        pub remove_label_ids: &'a [String],
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SendRequest<'a> {
        /// base64url encoded RFC 5322 message
        pub raw: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub thread_id: Option<&'a str>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SendResponse {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_history_record_with_absent_lists() {
            let json = r#"{
                "history": [
                    { "id": "101", "messagesAdded": [ { "message": { "id": "m1", "threadId": "t1" } } ] },
                    { "id": "102" }
                ],
                "historyId": "102"
            }"#;
            let response: HistoryResponse = serde_json::from_str(json).unwrap();
            assert_eq!(response.history.len(), 2);
            assert_eq!(response.history[0].messages_added[0].message.id, "m1");
            assert!(response.history[0].messages_deleted.is_empty());
            assert!(response.history[1].labels_added.is_empty());
            assert_eq!(response.history_id.as_deref(), Some("102"));
        }

        #[test]
        fn test_empty_history_page() {
            let response: HistoryResponse = serde_json::from_str(r#"{ "historyId": "7" }"#).unwrap();
            assert!(response.history.is_empty());
            assert!(response.next_page_token.is_none());
        }

        #[test]
        fn test_send_request_omits_missing_thread() {
            let body = serde_json::to_value(SendRequest {
                raw: "abc".into(),
                thread_id: None,
            })
            .unwrap();
            assert_eq!(body, serde_json::json!({ "raw": "abc" }));
        }
    }
}
