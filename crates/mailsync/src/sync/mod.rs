//! Mailbox synchronization
//!
//! The [`SyncOrchestrator`] picks full or incremental sync per account,
//! the [`HistoryDeltaResolver`] turns the history log into a minimal
//! change set, and [`MessageFetcher`] fetches metadata in bounded parallel
//! chunks.

mod fetch;
mod history;
mod orchestrator;

pub use fetch::{BatchFetch, MessageFetcher};
pub use history::{HistoryDelta, HistoryDeltaResolver, ResolvedDelta};
pub use orchestrator::{
    AccountSyncOutcome, JobSink, SyncMode, SyncOrchestrator, SyncOutcome, SyncStats,
};
