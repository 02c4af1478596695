//! Cached email record and its identifiers

use super::labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Gmail message id. Unique within one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gmail thread id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An address with an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse `"Jane Doe <jane@example.com>"` or a bare address.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let (Some(open), Some(close)) = (s.rfind('<'), s.rfind('>'))
            && open < close
        {
            let name = s[..open].trim().trim_matches('"').trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: s[open + 1..close].trim().to_string(),
            };
        }

        Self::new(s)
    }

    /// Parse a comma separated address list such as a `To` header.
    ///
    /// Commas inside quoted display names do not split.
    pub fn parse_list(s: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut quoted = false;
        let mut start = 0;
        for (i, c) in s.char_indices() {
            match c {
                '"' => quoted = !quoted,
                ',' if !quoted => {
                    out.push(&s[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        out.push(&s[start..]);

        out.into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// A message as mirrored in the local cache.
///
/// Only labels change after creation; a reported deletion removes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub account_id: i64,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Gmail internal timestamp in milliseconds since epoch
    pub internal_date: i64,
    pub label_ids: Vec<String>,
    /// Whether the message carries a `List-Unsubscribe` header (bulk mail)
    pub has_list_unsubscribe: bool,
}

impl Email {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }

    pub fn is_unread(&self) -> bool {
        self.has_label(labels::UNREAD)
    }

    pub fn is_starred(&self) -> bool {
        self.has_label(labels::STARRED)
    }

    /// Apply a label mutation in place, keeping label order stable.
    pub fn apply_labels(&mut self, add: &[String], remove: &[String]) {
        self.label_ids.retain(|l| !remove.contains(l));
        for label in add {
            if !self.label_ids.contains(label) {
                self.label_ids.push(label.clone());
            }
        }
    }
}
