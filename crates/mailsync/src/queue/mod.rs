//! Rate-limited background work queues
//!
//! A [`WorkerQueue`] drains [`WorkerJob`]s through a [`JobAction`], gated on
//! device conditions and an [`HourlyBudget`]. The engine runs two of them:
//! summarization ([`SummarizeAction`]) and body prefetch ([`PrefetchAction`]).

mod budget;
mod prefetch;
mod summarize;
mod worker;

pub use budget::HourlyBudget;
pub use prefetch::{BodyFetcher, PrefetchAction};
pub use summarize::{LeadSentenceSummarizer, SummarizeAction, Summarizer};
pub use worker::{PauseReason, QueueDrainReport, QueuePhase, WorkerQueue};

use anyhow::Result;

use crate::cancel::CancellationToken;
use crate::models::WorkerJob;

/// Budget log namespace of the summarization queue
pub const SUMMARY_BUDGET: &str = "budget.summary";
/// Budget log namespace of the prefetch queue
pub const PREFETCH_BUDGET: &str = "budget.prefetch";

/// The work a [`WorkerQueue`] performs for each job.
pub trait JobAction: Send + Sync {
    /// Short name used in logs and thread names
    fn name(&self) -> &'static str;

    /// Whether drains pause while the device is offline
    fn requires_network(&self) -> bool;

    /// True when the job's result already exists; such jobs are never queued.
    fn is_satisfied(&self, job: &WorkerJob) -> Result<bool>;

    fn perform(&self, job: &WorkerJob, cancel: &CancellationToken) -> Result<()>;
}
