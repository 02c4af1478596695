//! Background task lifecycle
//!
//! The host OS grants short execution windows. Each window first schedules
//! its successor, then runs the work for its kind under a cancellation token
//! the OS expiration handler can trip through [`BackgroundTaskManager::expire`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::TaskIntervals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Sync,
    NotificationCheck,
    SummaryProcessing,
    OutboxProcessing,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Sync,
        TaskKind::NotificationCheck,
        TaskKind::SummaryProcessing,
        TaskKind::OutboxProcessing,
    ];

    /// Identifier registered with the OS scheduler
    pub fn identifier(&self) -> &'static str {
        match self {
            TaskKind::Sync => "com.mailsync.sync",
            TaskKind::NotificationCheck => "com.mailsync.notification-check",
            TaskKind::SummaryProcessing => "com.mailsync.summary-processing",
            TaskKind::OutboxProcessing => "com.mailsync.outbox-processing",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.identifier() == identifier)
    }

    /// Sync runs offline too (as a no-op) so its schedule never lapses.
    pub fn requires_network(&self) -> bool {
        matches!(self, TaskKind::NotificationCheck | TaskKind::OutboxProcessing)
    }

    pub fn min_interval(&self, intervals: &TaskIntervals) -> Duration {
        let mins = match self {
            TaskKind::Sync => intervals.sync_mins,
            TaskKind::NotificationCheck => intervals.notification_check_mins,
            TaskKind::SummaryProcessing => intervals.summary_processing_mins,
            TaskKind::OutboxProcessing => intervals.outbox_processing_mins,
        };
        Duration::minutes(mins as i64)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Request for the next execution window of a task kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub identifier: &'static str,
    pub earliest_begin: DateTime<Utc>,
    pub requires_network: bool,
}

/// The host's background scheduler.
pub trait TaskScheduler: Send + Sync {
    fn submit(&self, request: &TaskRequest) -> Result<()>;
}

struct ActiveWindow {
    id: u64,
    token: CancellationToken,
}

pub struct BackgroundTaskManager {
    scheduler: Arc<dyn TaskScheduler>,
    intervals: TaskIntervals,
    active: Mutex<HashMap<TaskKind, ActiveWindow>>,
    next_id: AtomicU64,
}

impl BackgroundTaskManager {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, intervals: TaskIntervals) -> Self {
        Self {
            scheduler,
            intervals,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskKind, ActiveWindow>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_for(&self, kind: TaskKind, now: DateTime<Utc>) -> TaskRequest {
        TaskRequest {
            kind,
            identifier: kind.identifier(),
            earliest_begin: now + kind.min_interval(&self.intervals),
            requires_network: kind.requires_network(),
        }
    }

    pub fn schedule(&self, kind: TaskKind) -> Result<()> {
        let request = self.request_for(kind, Utc::now());
        self.scheduler.submit(&request)?;
        debug!("[TASK] Scheduled {} not before {}", kind, request.earliest_begin);
        Ok(())
    }

    /// Submit the next window of every kind.
    pub fn schedule_all(&self) -> Result<()> {
        for kind in TaskKind::ALL {
            self.schedule(kind)?;
        }
        Ok(())
    }

    /// Run one OS-granted window. The successor is submitted before the work
    /// starts, so an expired or failed window never breaks the chain.
    pub fn run_window<T>(
        &self,
        kind: TaskKind,
        work: impl FnOnce(&CancellationToken) -> Result<T>,
    ) -> Result<T> {
        if let Err(e) = self.schedule(kind) {
            warn!("[TASK] Failed to reschedule {}: {:#}", kind, e);
        }

        let token = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.active().insert(
            kind,
            ActiveWindow {
                id,
                token: token.clone(),
            },
        ) {
            // The OS never overlaps windows of one kind; a leftover is stale
            previous.token.cancel();
        }

        info!("[TASK] Window {} started", kind);
        let result = work(&token);

        {
            let mut active = self.active();
            if active.get(&kind).is_some_and(|w| w.id == id) {
                active.remove(&kind);
            }
        }

        match &result {
            Ok(_) if token.is_cancelled() => info!("[TASK] Window {} expired", kind),
            Ok(_) => info!("[TASK] Window {} finished", kind),
            Err(e) => warn!("[TASK] Window {} failed: {:#}", kind, e),
        }
        result
    }

    /// OS expiration handler. Returns whether a window was running.
    pub fn expire(&self, kind: TaskKind) -> bool {
        match self.active().get(&kind) {
            Some(window) => {
                window.token.cancel();
                info!("[TASK] Expiring {}", kind);
                true
            }
            None => false,
        }
    }

    pub fn expire_all(&self) {
        for window in self.active().values() {
            window.token.cancel();
        }
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.active().contains_key(&kind)
    }
}

/// Resolve an OS task identifier.
pub fn parse_task_kind(identifier: &str) -> Result<TaskKind> {
    match TaskKind::from_identifier(identifier) {
        Some(kind) => Ok(kind),
        None => bail!("Unknown background task identifier: {}", identifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct RecordingScheduler {
        requests: Mutex<Vec<TaskRequest>>,
    }

    impl TaskScheduler for RecordingScheduler {
        fn submit(&self, request: &TaskRequest) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct FailingScheduler;

    impl TaskScheduler for FailingScheduler {
        fn submit(&self, _request: &TaskRequest) -> Result<()> {
            bail!("scheduler unavailable")
        }
    }

    fn manager() -> (Arc<BackgroundTaskManager>, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = Arc::new(BackgroundTaskManager::new(
            scheduler.clone(),
            TaskIntervals::default(),
        ));
        (manager, scheduler)
    }

    #[test]
    fn test_identifiers_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(parse_task_kind(kind.identifier()).unwrap(), kind);
        }
        assert!(parse_task_kind("com.example.other").is_err());
    }

    #[test]
    fn test_window_reschedules_before_running() {
        let (manager, scheduler) = manager();
        let before = Utc::now();

        manager
            .run_window(TaskKind::Sync, |_| {
                assert_eq!(scheduler.requests.lock().unwrap().len(), 1);
                Ok(())
            })
            .unwrap();

        let requests = scheduler.requests.lock().unwrap();
        assert_eq!(requests[0].identifier, "com.mailsync.sync");
        assert!(!requests[0].requires_network);
        assert!(requests[0].earliest_begin >= before + Duration::minutes(15));
    }

    #[test]
    fn test_failed_work_still_rescheduled() {
        let (manager, scheduler) = manager();
        let result: Result<()> =
            manager.run_window(TaskKind::OutboxProcessing, |_| bail!("network down"));
        assert!(result.is_err());
        assert_eq!(scheduler.requests.lock().unwrap().len(), 1);
        assert!(!manager.is_running(TaskKind::OutboxProcessing));
    }

    #[test]
    fn test_scheduler_failure_does_not_block_work() {
        let manager = BackgroundTaskManager::new(Arc::new(FailingScheduler), TaskIntervals::default());
        assert_eq!(manager.run_window(TaskKind::Sync, |_| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_expire_cancels_running_window() {
        let (manager, _scheduler) = manager();
        let (started_tx, started_rx) = mpsc::channel();

        let runner = {
            let manager = manager.clone();
            thread::spawn(move || {
                manager.run_window(TaskKind::SummaryProcessing, |token| {
                    started_tx.send(()).unwrap();
                    while !token.is_cancelled() {
                        thread::sleep(std::time::Duration::from_millis(5));
                    }
                    Ok(token.is_cancelled())
                })
            })
        };

        started_rx.recv().unwrap();
        assert!(manager.expire(TaskKind::SummaryProcessing));
        assert!(runner.join().unwrap().unwrap());
        assert!(!manager.expire(TaskKind::SummaryProcessing));
    }

    #[test]
    fn test_schedule_all_submits_every_kind() {
        let (manager, scheduler) = manager();
        manager.schedule_all().unwrap();

        let requests = scheduler.requests.lock().unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.identifier).collect();
        assert_eq!(
            ids,
            vec![
                "com.mailsync.sync",
                "com.mailsync.notification-check",
                "com.mailsync.summary-processing",
                "com.mailsync.outbox-processing",
            ]
        );
        let summary = &requests[2];
        assert!(summary.earliest_begin - Utc::now() > Duration::minutes(59));
    }
}
