//! Gmail payload normalization
//!
//! Metadata responses become cache [`Email`] records; full responses yield
//! the text and HTML bodies used by prefetch and summarization.

use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{GmailMessage, MessagePart};
use crate::models::{Email, EmailAddress, MessageId, ThreadId};

/// Build a cache record from a metadata (or full) message.
pub fn normalize_metadata(msg: &GmailMessage, account_id: i64) -> Email {
    let headers = msg.payload.as_ref().map(|p| p.headers.as_slice()).unwrap_or_default();
    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    };

    let internal_date: i64 = msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    Email {
        id: MessageId::new(&msg.id),
        thread_id: ThreadId::new(&msg.thread_id),
        account_id,
        from: header("From")
            .map(EmailAddress::parse)
            .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid")),
        to: header("To").map(EmailAddress::parse_list).unwrap_or_default(),
        subject: header("Subject").unwrap_or_default().to_string(),
        snippet: decode_html_entities(&msg.snippet),
        received_at,
        internal_date,
        label_ids: msg.label_ids.clone(),
        has_list_unsubscribe: header("List-Unsubscribe").is_some(),
    }
}

/// Decoded bodies of a full message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageContent {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }

    /// Plain text if present, otherwise the HTML with tags stripped.
    pub fn readable_text(&self) -> Option<String> {
        self.text
            .clone()
            .or_else(|| self.html.as_deref().map(strip_tags))
    }
}

pub fn extract_content(msg: &GmailMessage) -> MessageContent {
    let Some(payload) = &msg.payload else {
        return MessageContent::default();
    };

    MessageContent {
        text: find_part(payload, "text/plain"),
        html: find_part(payload, "text/html"),
    }
}

/// Depth-first search for the first inline part of `mime` with data.
fn find_part(part: &MessagePart, mime: &str) -> Option<String> {
    let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty());
    if !is_attachment
        && part.mime_type.as_deref().is_some_and(|m| m.starts_with(mime))
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref())
        && let Some(decoded) = decode_base64_body(data)
    {
        return Some(decoded);
    }

    part.parts.iter().find_map(|child| find_part(child, mime))
}

/// Gmail uses URL-safe base64, with or without padding.
fn decode_base64_body(data: &str) -> Option<String> {
    [&BASE64_URL_SAFE_NO_PAD, &BASE64_URL_SAFE, &BASE64_STANDARD]
        .iter()
        .find_map(|engine| engine.decode(data).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let decoded = decode_html_entities(&out);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
