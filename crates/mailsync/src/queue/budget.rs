//! Rolling one-hour action budget

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::storage::TimestampLog;

/// At most `limit` recorded actions in any rolling hour.
///
/// Entries older than the window are pruned before every count, so the log
/// never grows past `limit` live entries per namespace.
pub struct HourlyBudget {
    log: Arc<dyn TimestampLog>,
    namespace: String,
    limit: usize,
}

impl HourlyBudget {
    pub fn new(log: Arc<dyn TimestampLog>, namespace: impl Into<String>, limit: usize) -> Self {
        Self {
            log,
            namespace: namespace.into(),
            limit,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let window_start = now - Duration::hours(1);
        self.log.prune_before(&self.namespace, window_start)?;
        let used = self.log.count_since(&self.namespace, window_start)?;
        Ok(self.limit.saturating_sub(used))
    }

    pub fn remaining(&self) -> Result<usize> {
        self.remaining_at(Utc::now())
    }

    pub fn record_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.log.record(&self.namespace, at)
    }

    pub fn record(&self) -> Result<()> {
        self.record_at(Utc::now())
    }
}
