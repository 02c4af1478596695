//! Engine composition root
//!
//! [`SyncEngine`] owns one instance of every unit, wires the sync
//! orchestrator to both worker queues, and maps each background task kind
//! to its work.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::actions::ActionHandler;
use crate::auth::{AccountDirectory, CredentialStore, TokenRefreshCoordinator, TokenRefresher};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::device::DeviceConditions;
use crate::gmail::MailApi;
use crate::lifecycle::{BackgroundTaskManager, TaskKind, TaskScheduler};
use crate::models::{MessageId, WorkerJob, labels};
use crate::notify::{NotificationChecker, Notifier};
use crate::outbox::{AttachmentStore, OutboxQueue};
use crate::queue::{
    BodyFetcher, HourlyBudget, LeadSentenceSummarizer, PREFETCH_BUDGET, PrefetchAction,
    SUMMARY_BUDGET, SummarizeAction, Summarizer, WorkerQueue,
};
use crate::storage::{BlobStore, EmailQuery, EngineStore, MailStore, SummaryStore};
use crate::sync::{AccountSyncOutcome, SyncOrchestrator, SyncOutcome};

/// Newest cached inbox messages re-offered to the queues per account
const RESEED_PER_ACCOUNT: usize = 50;

/// External collaborators the engine is built from.
pub struct EngineDeps {
    pub api: Arc<dyn MailApi>,
    pub refresher: Arc<dyn TokenRefresher>,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub device: Arc<dyn DeviceConditions>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub notifier: Arc<dyn Notifier>,
    pub blobs: Arc<dyn BlobStore>,
    /// Directory for outbox attachment files
    pub attachment_root: PathBuf,
    /// Defaults to [`LeadSentenceSummarizer`]
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

pub struct SyncEngine {
    accounts: Arc<dyn AccountDirectory>,
    device: Arc<dyn DeviceConditions>,
    store: Arc<dyn MailStore>,
    summaries: Arc<dyn SummaryStore>,
    blobs: Arc<dyn BlobStore>,
    orchestrator: SyncOrchestrator,
    outbox: OutboxQueue,
    summary_queue: Arc<WorkerQueue>,
    prefetch_queue: Arc<WorkerQueue>,
    notifications: NotificationChecker,
    tasks: BackgroundTaskManager,
    actions: ActionHandler,
}

impl SyncEngine {
    pub fn new<S: EngineStore + 'static>(
        store: Arc<S>,
        deps: EngineDeps,
        config: EngineConfig,
    ) -> Result<Self> {
        let mail_store: Arc<dyn MailStore> = store.clone();
        let summaries: Arc<dyn SummaryStore> = store.clone();

        let mut auth = TokenRefreshCoordinator::new(deps.refresher);
        if let Some(credentials) = deps.credentials {
            auth = auth.with_credential_store(credentials);
        }
        let auth = Arc::new(auth);

        let bodies = Arc::new(BodyFetcher::new(
            deps.api.clone(),
            auth.clone(),
            deps.accounts.clone(),
            deps.blobs.clone(),
        ));
        let summarizer = deps
            .summarizer
            .unwrap_or_else(|| Arc::new(LeadSentenceSummarizer::default()));

        let summary_queue = WorkerQueue::new(
            Arc::new(SummarizeAction::new(
                bodies.clone(),
                summaries.clone(),
                summarizer,
                deps.device.clone(),
            )),
            deps.device.clone(),
            HourlyBudget::new(store.clone(), SUMMARY_BUDGET, config.queues.summary_budget_per_hour),
            config.queues.min_battery_level,
        );
        let prefetch_queue = WorkerQueue::new(
            Arc::new(PrefetchAction::new(bodies)),
            deps.device.clone(),
            HourlyBudget::new(store.clone(), PREFETCH_BUDGET, config.queues.prefetch_budget_per_hour),
            config.queues.min_battery_level,
        );

        let mut orchestrator = SyncOrchestrator::new(
            deps.api.clone(),
            auth.clone(),
            mail_store.clone(),
            config.sync.clone(),
        )
        .with_blob_store(deps.blobs.clone());
        orchestrator.add_sink(summary_queue.clone());
        orchestrator.add_sink(prefetch_queue.clone());

        let attachments = AttachmentStore::new(&deps.attachment_root).with_context(|| {
            format!(
                "Failed to open attachment directory {}",
                deps.attachment_root.display()
            )
        })?;
        let outbox = OutboxQueue::new(
            store.clone(),
            attachments,
            deps.api.clone(),
            auth.clone(),
            deps.accounts.clone(),
            deps.device.clone(),
            config.outbox.clone(),
        );
        let recovered = outbox.recover_interrupted()?;
        if recovered > 0 {
            warn!("[OUTBOX] {} send(s) interrupted by a previous shutdown", recovered);
        }

        let notifications = NotificationChecker::new(
            deps.api.clone(),
            auth.clone(),
            mail_store.clone(),
            store.clone(),
            deps.notifier,
            config.notifications.clone(),
        );
        let actions = ActionHandler::new(deps.api, auth, deps.accounts.clone(), mail_store.clone());
        let tasks = BackgroundTaskManager::new(deps.scheduler, config.tasks.clone());

        Ok(Self {
            accounts: deps.accounts,
            device: deps.device,
            store: mail_store,
            summaries,
            blobs: deps.blobs,
            orchestrator,
            outbox,
            summary_queue,
            prefetch_queue,
            notifications,
            tasks,
            actions,
        })
    }

    /// Sync every registered account. Offline this is a no-op.
    pub fn sync_now(&self, cancel: &CancellationToken) -> Vec<AccountSyncOutcome> {
        if !self.device.is_network_available() {
            info!("[SYNC] Offline, skipping sync");
            return Vec::new();
        }
        self.orchestrator.run_sync(&self.accounts.accounts(), cancel)
    }

    pub fn sync_account(&self, account_id: i64, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let account = self
            .accounts
            .account(account_id)
            .with_context(|| format!("Account {} is not registered", account_id))?;
        Ok(self.orchestrator.sync_account(&account, cancel))
    }

    /// The work behind one background window.
    pub fn run_task(&self, kind: TaskKind, cancel: &CancellationToken) -> Result<()> {
        match kind {
            TaskKind::Sync => {
                let outcomes = self.sync_now(cancel);
                let failed = outcomes.iter().filter(|o| !o.is_success()).count();
                if failed > 0 {
                    warn!("[TASK] {} of {} account(s) did not sync", failed, outcomes.len());
                }
            }
            TaskKind::NotificationCheck => {
                if self.device.is_network_available() {
                    self.notifications.check(&self.accounts.accounts(), cancel)?;
                }
            }
            TaskKind::SummaryProcessing => {
                self.reseed_queues()?;
                self.summary_queue.drain(cancel)?;
                self.prefetch_queue.drain(cancel)?;
            }
            TaskKind::OutboxProcessing => {
                self.outbox.drain(cancel)?;
            }
        }
        Ok(())
    }

    /// Entry point for an OS-granted window.
    pub fn run_background_task(&self, kind: TaskKind) -> Result<()> {
        self.tasks.run_window(kind, |cancel| self.run_task(kind, cancel))
    }

    pub fn expire_background_task(&self, kind: TaskKind) -> bool {
        self.tasks.expire(kind)
    }

    pub fn schedule_background_tasks(&self) -> Result<()> {
        self.tasks.schedule_all()
    }

    /// Queues live in memory; after a restart they are refilled from the
    /// newest cached inbox mail. Finished jobs are filtered on enqueue.
    fn reseed_queues(&self) -> Result<()> {
        let mut jobs = Vec::new();
        for account in self.accounts.accounts() {
            let query = EmailQuery::account(account.id)
                .with_label(labels::INBOX)
                .limit(RESEED_PER_ACCOUNT);
            jobs.extend(self.store.list_emails(&query)?.iter().map(WorkerJob::from));
        }
        self.summary_queue.enqueue(jobs.clone());
        self.prefetch_queue.enqueue(jobs);
        Ok(())
    }

    pub fn outbox(&self) -> &OutboxQueue {
        &self.outbox
    }

    pub fn actions(&self) -> &ActionHandler {
        &self.actions
    }

    pub fn summary_queue(&self) -> &Arc<WorkerQueue> {
        &self.summary_queue
    }

    pub fn prefetch_queue(&self) -> &Arc<WorkerQueue> {
        &self.prefetch_queue
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn summary(&self, account_id: i64, id: &MessageId) -> Result<Option<String>> {
        self.summaries.get_summary(account_id, id)
    }

    pub fn cached_body(&self, account_id: i64, id: &MessageId) -> Result<Option<String>> {
        self.blobs.get_text(account_id, id)
    }

    /// Drop everything cached for an account (after sign-out).
    pub fn remove_account_data(&self, account_id: i64) -> Result<()> {
        self.store.delete_account_data(account_id)?;
        self.blobs.delete_account(account_id)?;
        info!("Removed cached data for account {}", account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAccounts;
    use crate::device::StaticConditions;
    use crate::lifecycle::TaskRequest;
    use crate::models::{OutboundDraft, OutboxStatus};
    use crate::notify::NewMailNotification;
    use crate::queue::QueuePhase;
    use crate::storage::{InMemoryBlobStore, InMemoryMailStore, OutboxStore};
    use crate::testing::{FakeMailApi, NoRefresh, account, message};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<TaskRequest>>,
        notified: Mutex<Vec<NewMailNotification>>,
    }

    impl TaskScheduler for Recorder {
        fn submit(&self, request: &TaskRequest) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notification: &NewMailNotification) -> Result<()> {
            self.notified.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Setup {
        engine: SyncEngine,
        api: Arc<FakeMailApi>,
        store: Arc<InMemoryMailStore>,
        device: Arc<StaticConditions>,
        recorder: Arc<Recorder>,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeMailApi::new();
        let accounts = Arc::new(InMemoryAccounts::new());
        accounts.upsert(account(1));
        let store = Arc::new(InMemoryMailStore::new());
        let device = Arc::new(StaticConditions::online());
        let recorder = Arc::new(Recorder::default());

        let deps = EngineDeps {
            api: api.clone(),
            refresher: Arc::new(NoRefresh),
            credentials: None,
            accounts,
            device: device.clone(),
            scheduler: recorder.clone(),
            notifier: recorder.clone(),
            blobs: Arc::new(InMemoryBlobStore::new()),
            attachment_root: dir.path().join("attachments"),
            summarizer: None,
        };
        let engine = SyncEngine::new(store.clone(), deps, EngineConfig::default()).unwrap();
        Setup {
            engine,
            api,
            store,
            device,
            recorder,
            _dir: dir,
        }
    }

    fn wait_idle(queue: &WorkerQueue) {
        for _ in 0..500 {
            if queue.phase() == QueuePhase::Idle {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("queue {} never went idle", queue.name());
    }

    #[test]
    fn test_sync_is_noop_offline() {
        let s = setup();
        s.device.set_network_available(false);

        assert!(s.engine.sync_now(&CancellationToken::new()).is_empty());
        assert!(s.store.get_sync_state(1).unwrap().is_none());
    }

    #[test]
    fn test_sync_window_reschedules_and_syncs() {
        let s = setup();
        s.api.add_message(1, message("m1", &["INBOX", "UNREAD"], 1));
        s.api.set_listing(1, &["m1"]);

        s.engine.run_background_task(TaskKind::Sync).unwrap();

        assert_eq!(s.recorder.requests.lock().unwrap()[0].kind, TaskKind::Sync);
        assert!(s.store.get_email(1, &MessageId::new("m1")).unwrap().is_some());
    }

    #[test]
    fn test_summary_window_summarizes_cached_mail() {
        let s = setup();
        s.api.add_message(1, message("m1", &["INBOX", "UNREAD"], 1));
        s.api.set_listing(1, &["m1"]);
        s.engine.sync_now(&CancellationToken::new());

        s.engine.run_background_task(TaskKind::SummaryProcessing).unwrap();
        // Sync also starts background drains; let them finish
        wait_idle(s.engine.summary_queue());
        wait_idle(s.engine.prefetch_queue());

        assert_eq!(
            s.engine.summary(1, &MessageId::new("m1")).unwrap().as_deref(),
            Some("Body of m1. Second sentence.")
        );
    }

    #[test]
    fn test_notification_window_announces_new_mail() {
        let s = setup();
        s.api.add_message(1, message("m1", &["INBOX", "UNREAD"], 1));
        s.api.set_listing(1, &["m1"]);

        s.engine.run_background_task(TaskKind::NotificationCheck).unwrap();

        assert_eq!(s.recorder.notified.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_outbox_window_sends_pending_mail() {
        let s = setup();
        let item = s
            .engine
            .outbox()
            .enqueue(OutboundDraft {
                account_id: 1,
                to: vec!["bob@example.com".into()],
                subject: "Hello".into(),
                body: "Hi Bob".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);

        s.engine.run_background_task(TaskKind::OutboxProcessing).unwrap();

        assert!(s.store.list_outbox().unwrap().is_empty());
        assert_eq!(s.api.state().sent.len(), 1);
    }

    #[test]
    fn test_remove_account_data() {
        let s = setup();
        s.api.add_message(1, message("m1", &["INBOX"], 1));
        s.api.set_listing(1, &["m1"]);
        s.engine.sync_now(&CancellationToken::new());

        s.engine.remove_account_data(1).unwrap();

        assert_eq!(s.store.count_emails(1).unwrap(), 0);
        assert!(s.store.get_sync_state(1).unwrap().is_none());
    }
}
