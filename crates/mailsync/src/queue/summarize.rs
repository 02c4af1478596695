//! Message summarization

use std::sync::Arc;

use anyhow::Result;

use super::JobAction;
use super::prefetch::BodyFetcher;
use crate::cancel::CancellationToken;
use crate::device::DeviceConditions;
use crate::models::WorkerJob;
use crate::storage::SummaryStore;

/// Produces a short summary of a message body. `None` when there is
/// nothing worth summarizing.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, text: &str) -> Option<String>;
}

/// Leading sentences of the body, skipping quoted replies.
#[derive(Debug, Clone)]
pub struct LeadSentenceSummarizer {
    pub max_sentences: usize,
    pub max_chars: usize,
}

impl Default for LeadSentenceSummarizer {
    fn default() -> Self {
        Self {
            max_sentences: 2,
            max_chars: 200,
        }
    }
}

impl Summarizer for LeadSentenceSummarizer {
    fn summarize(&self, text: &str) -> Option<String> {
        let body: String = text
            .lines()
            .map(str::trim)
            .take_while(|line| !(line.starts_with("On ") && line.ends_with("wrote:")))
            .filter(|line| !line.starts_with('>'))
            .collect::<Vec<_>>()
            .join(" ");
        let body = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if body.is_empty() {
            return None;
        }

        let mut summary = String::new();
        let mut sentences = 0;
        for (i, c) in body.char_indices() {
            summary.push(c);
            let at_boundary = matches!(c, '.' | '!' | '?')
                && body[i + c.len_utf8()..].starts_with(' ');
            if at_boundary {
                sentences += 1;
                if sentences >= self.max_sentences {
                    break;
                }
            }
        }

        if summary.chars().count() > self.max_chars {
            let cut: String = summary.chars().take(self.max_chars.saturating_sub(1)).collect();
            summary = format!("{}…", cut.trim_end());
        }
        Some(summary.trim().to_string())
    }
}

pub struct SummarizeAction {
    bodies: Arc<BodyFetcher>,
    summaries: Arc<dyn SummaryStore>,
    summarizer: Arc<dyn Summarizer>,
    device: Arc<dyn DeviceConditions>,
}

impl SummarizeAction {
    pub fn new(
        bodies: Arc<BodyFetcher>,
        summaries: Arc<dyn SummaryStore>,
        summarizer: Arc<dyn Summarizer>,
        device: Arc<dyn DeviceConditions>,
    ) -> Self {
        Self {
            bodies,
            summaries,
            summarizer,
            device,
        }
    }
}

impl JobAction for SummarizeAction {
    fn name(&self) -> &'static str {
        "summarize"
    }

    /// Works from the body cache; goes to the network only on a miss.
    fn requires_network(&self) -> bool {
        false
    }

    fn is_satisfied(&self, job: &WorkerJob) -> Result<bool> {
        self.summaries.has_summary(job.account_id, &job.message_id)
    }

    fn perform(&self, job: &WorkerJob, cancel: &CancellationToken) -> Result<()> {
        let text = match self.bodies.cached_text(job)? {
            Some(text) => text,
            None if self.device.is_network_available() => self
                .bodies
                .fetch(job, cancel)?
                .readable_text()
                .unwrap_or_default(),
            None => anyhow::bail!("body of {} not cached and offline", job.message_id),
        };

        let Some(summary) = self.summarizer.summarize(&text) else {
            anyhow::bail!("nothing to summarize in {}", job.message_id);
        };

        cancel.check("summary write")?;
        self.summaries
            .save_summary(job.account_id, &job.message_id, &summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAccounts;
    use crate::device::StaticConditions;
    use crate::gmail::normalize_metadata;
    use crate::storage::{BlobKey, BlobStore, InMemoryBlobStore, InMemoryMailStore};
    use crate::testing::{FakeMailApi, account, coordinator, message};

    #[test]
    fn test_lead_sentences() {
        let s = LeadSentenceSummarizer::default();
        assert_eq!(
            s.summarize("Hi team. The build is green! Ship it? Thanks").as_deref(),
            Some("Hi team. The build is green!")
        );
        assert_eq!(s.summarize("   \n  "), None);
        assert_eq!(s.summarize("v1.2 is out").as_deref(), Some("v1.2 is out"));
    }

    #[test]
    fn test_quoted_reply_is_ignored() {
        let s = LeadSentenceSummarizer::default();
        let text = "Sounds good\n\nOn Mon, Jan 1, 2024 Bob wrote:\n> Shall we meet?";
        assert_eq!(s.summarize(text).as_deref(), Some("Sounds good"));
    }

    #[test]
    fn test_long_text_is_truncated() {
        let s = LeadSentenceSummarizer {
            max_sentences: 2,
            max_chars: 10,
        };
        let summary = s.summarize("abcdefghijklmnopqrstuvwxyz").unwrap();
        assert_eq!(summary.chars().count(), 10);
        assert!(summary.ends_with('…'));
    }

    struct Setup {
        action: SummarizeAction,
        api: Arc<FakeMailApi>,
        blobs: Arc<InMemoryBlobStore>,
        store: Arc<InMemoryMailStore>,
        device: Arc<StaticConditions>,
    }

    fn setup() -> Setup {
        let api = FakeMailApi::new();
        let accounts = Arc::new(InMemoryAccounts::new());
        accounts.upsert(account(1));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = Arc::new(InMemoryMailStore::new());
        let device = Arc::new(StaticConditions::online());
        let bodies = Arc::new(BodyFetcher::new(api.clone(), coordinator(), accounts, blobs.clone()));
        let action = SummarizeAction::new(
            bodies,
            store.clone(),
            Arc::new(LeadSentenceSummarizer::default()),
            device.clone(),
        );
        Setup {
            action,
            api,
            blobs,
            store,
            device,
        }
    }

    fn job(id: &str) -> WorkerJob {
        WorkerJob::from(&normalize_metadata(&message(id, &["INBOX", "UNREAD"], 1), 1))
    }

    #[test]
    fn test_summarizes_cached_body_offline() {
        let s = setup();
        s.device.set_network_available(false);
        let job = job("m1");
        s.blobs
            .put(&BlobKey::text(1, &job.message_id), b"Quarterly numbers are in. Revenue is up. More below.")
            .unwrap();

        s.action.perform(&job, &CancellationToken::new()).unwrap();

        assert_eq!(
            s.store.get_summary(1, &job.message_id).unwrap().as_deref(),
            Some("Quarterly numbers are in. Revenue is up.")
        );
        assert!(s.action.is_satisfied(&job).unwrap());
        assert!(s.api.state().full_calls.is_empty());
    }

    #[test]
    fn test_fetches_missing_body_when_online() {
        let s = setup();
        s.api.add_message(1, message("m2", &["INBOX"], 1));
        let job = job("m2");

        s.action.perform(&job, &CancellationToken::new()).unwrap();

        assert_eq!(
            s.store.get_summary(1, &job.message_id).unwrap().as_deref(),
            Some("Body of m2. Second sentence.")
        );
        assert!(s.blobs.exists(&BlobKey::text(1, &job.message_id)).unwrap());
    }

    #[test]
    fn test_offline_without_body_fails() {
        let s = setup();
        s.device.set_network_available(false);
        assert!(s.action.perform(&job("m3"), &CancellationToken::new()).is_err());
    }
}
