//! Persisted per-account sync position

use super::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Opaque history position issued by the server.
///
/// Gmail issues decimal history ids; [`HistoryCursor::is_newer_than`] uses
/// that when both sides parse and otherwise treats cursors as unordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryCursor(pub String);

impl HistoryCursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Numeric ordering when both cursors are numeric, `None` otherwise.
    pub fn compare(&self, other: &HistoryCursor) -> Option<Ordering> {
        Some(self.numeric()?.cmp(&other.numeric()?))
    }

    /// True unless `self` is provably older than `other`.
    pub fn is_newer_than(&self, other: &HistoryCursor) -> bool {
        !matches!(self.compare(other), Some(Ordering::Less))
    }
}

impl From<&str> for HistoryCursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sync position for one account. Written only after a sync's changes have
/// been applied to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub account_id: i64,
    pub cursor: HistoryCursor,
    pub last_sync_at: DateTime<Utc>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Messages whose fetch failed transiently; retried on the next pass.
    #[serde(default)]
    pub retry_ids: Vec<MessageId>,
}

impl SyncState {
    /// State after a completed full sync.
    pub fn after_full_sync(account_id: i64, cursor: HistoryCursor) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            cursor,
            last_sync_at: now,
            last_full_sync_at: Some(now),
            retry_ids: Vec::new(),
        }
    }

    /// Advance after an incremental sync.
    pub fn advanced(mut self, cursor: HistoryCursor, retry_ids: Vec<MessageId>) -> Self {
        self.cursor = cursor;
        self.last_sync_at = Utc::now();
        self.retry_ids = retry_ids;
        self
    }

    pub fn with_retry_ids(mut self, retry_ids: Vec<MessageId>) -> Self {
        self.retry_ids = retry_ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_ordering() {
        let a = HistoryCursor::from("100");
        let b = HistoryCursor::from("101");
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
        assert!(a.is_newer_than(&a));
    }

    #[test]
    fn test_non_numeric_cursor_is_unordered() {
        let a = HistoryCursor::from("abc");
        let b = HistoryCursor::from("100");
        assert_eq!(a.compare(&b), None);
        assert!(a.is_newer_than(&b));
    }

    #[test]
    fn test_advanced_replaces_retry_ids() {
        let state = SyncState::after_full_sync(1, "10".into())
            .with_retry_ids(vec![MessageId::new("old")]);
        let next = state.advanced("11".into(), vec![]);
        assert_eq!(next.cursor.as_str(), "11");
        assert!(next.retry_ids.is_empty());
        assert!(next.last_full_sync_at.is_some());
    }

    #[test]
    fn test_serialization_defaults_retry_ids() {
        let json = r#"{"account_id":1,"cursor":"5","last_sync_at":"2024-01-01T00:00:00Z","last_full_sync_at":null}"#;
        let state: SyncState = serde_json::from_str(json).unwrap();
        assert_eq!(state.cursor, HistoryCursor::from("5"));
        assert!(state.retry_ids.is_empty());
    }
}
