//! Priority worker queue with device gating and an hourly budget

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use anyhow::Result;
use log::{debug, info, warn};

use super::JobAction;
use super::budget::HourlyBudget;
use crate::cancel::{CancellationToken, is_cancelled_error};
use crate::device::DeviceConditions;
use crate::models::{MessageId, WorkerJob};
use crate::sync::JobSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Draining,
}

/// Why a drain stopped with work left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    LowPowerMode,
    LowBattery,
    Offline,
    BudgetExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDrainReport {
    pub performed: usize,
    pub failed: usize,
    /// Already done by the time their turn came
    pub skipped: usize,
    pub paused: Option<PauseReason>,
    pub already_running: bool,
}

type JobKey = (i64, MessageId);

fn key(job: &WorkerJob) -> JobKey {
    (job.account_id, job.message_id.clone())
}

struct QueueState {
    /// Sorted by [`WorkerJob::queue_order`]
    jobs: Vec<WorkerJob>,
    /// Queued or currently running
    keys: HashSet<JobKey>,
    phase: QueuePhase,
}

pub struct WorkerQueue {
    this: Weak<WorkerQueue>,
    action: Arc<dyn JobAction>,
    device: Arc<dyn DeviceConditions>,
    budget: HourlyBudget,
    min_battery_level: f32,
    state: Mutex<QueueState>,
}

impl WorkerQueue {
    pub fn new(
        action: Arc<dyn JobAction>,
        device: Arc<dyn DeviceConditions>,
        budget: HourlyBudget,
        min_battery_level: f32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            action,
            device,
            budget,
            min_battery_level,
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                keys: HashSet::new(),
                phase: QueuePhase::Idle,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self) -> QueuePhase {
        self.state().phase
    }

    /// Snapshot of queued jobs in execution order.
    pub fn pending(&self) -> Vec<WorkerJob> {
        self.state().jobs.clone()
    }

    /// Add jobs that are neither queued nor already satisfied. Returns how
    /// many were added.
    pub fn enqueue(&self, jobs: Vec<WorkerJob>) -> usize {
        self.enqueue_inner(jobs, false).0
    }

    /// Enqueue and, if the queue is idle, start draining on a background
    /// thread.
    pub fn enqueue_candidates(&self, jobs: Vec<WorkerJob>) -> usize {
        let (added, claimed) = self.enqueue_inner(jobs, true);
        if claimed {
            self.spawn_drain();
        }
        added
    }

    fn enqueue_inner(&self, jobs: Vec<WorkerJob>, claim: bool) -> (usize, bool) {
        let fresh: Vec<WorkerJob> = jobs
            .into_iter()
            .filter(|job| match self.action.is_satisfied(job) {
                Ok(satisfied) => !satisfied,
                Err(e) => {
                    debug!("[QUEUE] {}: could not check {}: {}", self.name(), job.message_id, e);
                    true
                }
            })
            .collect();

        let mut state = self.state();
        let mut added = 0;
        for job in fresh {
            if state.keys.insert(key(&job)) {
                state.jobs.push(job);
                added += 1;
            }
        }
        if added > 0 {
            state.jobs.sort_by(WorkerJob::queue_order);
        }

        let claimed = claim && added > 0 && state.phase == QueuePhase::Idle;
        if claimed {
            state.phase = QueuePhase::Draining;
        }
        (added, claimed)
    }

    fn spawn_drain(&self) {
        let Some(queue) = self.this.upgrade() else {
            self.state().phase = QueuePhase::Idle;
            return;
        };

        let spawned = thread::Builder::new()
            .name(format!("mailsync-{}", self.name()))
            .spawn(move || {
                if let Err(e) = queue.drain_claimed(&CancellationToken::new()) {
                    warn!("[QUEUE] {}: drain failed: {:#}", queue.name(), e);
                }
            });

        if let Err(e) = spawned {
            warn!("[QUEUE] {}: could not start drain thread: {}", self.name(), e);
            self.state().phase = QueuePhase::Idle;
        }
    }

    /// Drain on the calling thread until the queue is empty, a gate
    /// closes, or `cancel` fires.
    pub fn drain(&self, cancel: &CancellationToken) -> Result<QueueDrainReport> {
        {
            let mut state = self.state();
            if state.phase == QueuePhase::Draining {
                return Ok(QueueDrainReport {
                    already_running: true,
                    ..Default::default()
                });
            }
            state.phase = QueuePhase::Draining;
        }
        self.drain_claimed(cancel)
    }

    fn drain_claimed(&self, cancel: &CancellationToken) -> Result<QueueDrainReport> {
        let mut idle = IdleOnDrop {
            queue: self,
            armed: true,
        };
        let mut report = QueueDrainReport::default();

        loop {
            if let Some(reason) = self.gate(cancel)? {
                if !self.is_empty() {
                    debug!("[QUEUE] {}: paused ({:?})", self.name(), reason);
                    report.paused = Some(reason);
                }
                break;
            }

            let Some(job) = self.next_job() else {
                // next_job already went idle; a new drain may own the queue now
                idle.armed = false;
                break;
            };

            let result = match self.action.is_satisfied(&job) {
                Ok(true) => {
                    report.skipped += 1;
                    Ok(())
                }
                _ => self.run(&job, cancel, &mut report),
            };
            self.finish(&job);
            result?;

            if report.paused.is_some() {
                break;
            }
        }

        if report.performed + report.failed > 0 {
            info!(
                "[QUEUE] {}: {} done, {} failed, {} left",
                self.name(),
                report.performed,
                report.failed,
                self.len()
            );
        }
        Ok(report)
    }

    fn run(
        &self,
        job: &WorkerJob,
        cancel: &CancellationToken,
        report: &mut QueueDrainReport,
    ) -> Result<()> {
        match self.action.perform(job, cancel) {
            Ok(()) => {
                self.budget.record()?;
                report.performed += 1;
            }
            Err(e) if is_cancelled_error(&e) => {
                // Not the job's fault; it goes back for the next window
                self.requeue(job.clone());
                report.paused = Some(PauseReason::Cancelled);
            }
            Err(e) => {
                debug!("[QUEUE] {}: dropping {}: {:#}", self.name(), job.message_id, e);
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Device and budget checks, read fresh every time.
    fn gate(&self, cancel: &CancellationToken) -> Result<Option<PauseReason>> {
        if cancel.is_cancelled() {
            return Ok(Some(PauseReason::Cancelled));
        }
        if self.device.is_low_power_mode() {
            return Ok(Some(PauseReason::LowPowerMode));
        }
        if let Some(level) = self.device.battery_level()
            && level < self.min_battery_level
        {
            return Ok(Some(PauseReason::LowBattery));
        }
        if self.action.requires_network() && !self.device.is_network_available() {
            return Ok(Some(PauseReason::Offline));
        }
        if self.budget.remaining()? == 0 {
            return Ok(Some(PauseReason::BudgetExhausted));
        }
        Ok(None)
    }

    /// Pop the head of the queue, or go idle when there is none. Both
    /// happen under one lock so a concurrent enqueue cannot be stranded.
    fn next_job(&self) -> Option<WorkerJob> {
        let mut state = self.state();
        if state.jobs.is_empty() {
            state.phase = QueuePhase::Idle;
            None
        } else {
            Some(state.jobs.remove(0))
        }
    }

    fn requeue(&self, job: WorkerJob) {
        let mut state = self.state();
        state.keys.insert(key(&job));
        state.jobs.push(job);
        state.jobs.sort_by(WorkerJob::queue_order);
    }

    fn finish(&self, job: &WorkerJob) {
        let mut state = self.state();
        if !state.jobs.iter().any(|queued| key(queued) == key(job)) {
            state.keys.remove(&key(job));
        }
    }
}

struct IdleOnDrop<'a> {
    queue: &'a WorkerQueue,
    armed: bool,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.state().phase = QueuePhase::Idle;
        }
    }
}

impl JobSink for WorkerQueue {
    fn offer(&self, jobs: Vec<WorkerJob>) {
        let added = self.enqueue_candidates(jobs);
        if added > 0 {
            debug!("[QUEUE] {}: {} new jobs", self.name(), added);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSnapshot, StaticConditions};
    use crate::models::ThreadId;
    use crate::storage::{InMemoryMailStore, TimestampLog};
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct CountingAction {
        performed: Mutex<Vec<String>>,
        done: Mutex<HashSet<String>>,
        fail: AtomicBool,
        network: bool,
    }

    impl JobAction for CountingAction {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn requires_network(&self) -> bool {
            self.network
        }

        fn is_satisfied(&self, job: &WorkerJob) -> Result<bool> {
            Ok(self.done.lock().unwrap().contains(job.message_id.as_str()))
        }

        fn perform(&self, job: &WorkerJob, _cancel: &CancellationToken) -> Result<()> {
            self.performed.lock().unwrap().push(job.message_id.to_string());
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("summarizer unavailable");
            }
            self.done.lock().unwrap().insert(job.message_id.to_string());
            Ok(())
        }
    }

    fn job(id: &str, starred: bool, unread: bool, bulk: bool, age_mins: i64) -> WorkerJob {
        WorkerJob {
            account_id: 1,
            message_id: MessageId::new(id),
            thread_id: ThreadId::new(id),
            is_unread: unread,
            is_starred: starred,
            has_list_unsubscribe: bulk,
            received_at: Utc::now() - Duration::minutes(age_mins),
        }
    }

    fn plain(id: &str) -> WorkerJob {
        job(id, false, true, false, 0)
    }

    fn queue_with(
        action: Arc<CountingAction>,
        device: Arc<StaticConditions>,
        limit: usize,
    ) -> (Arc<WorkerQueue>, Arc<InMemoryMailStore>) {
        let store = Arc::new(InMemoryMailStore::new());
        let budget = HourlyBudget::new(store.clone(), "budget.counting", limit);
        (WorkerQueue::new(action, device, budget, 0.2), store)
    }

    #[test]
    fn test_duplicate_ids_run_once() {
        let action = Arc::new(CountingAction::default());
        let (queue, _store) = queue_with(action.clone(), Arc::new(StaticConditions::online()), 10);

        assert_eq!(queue.enqueue(vec![plain("a"), plain("a")]), 1);
        assert_eq!(queue.enqueue(vec![plain("a")]), 0);
        queue.drain(&CancellationToken::new()).unwrap();

        assert_eq!(*action.performed.lock().unwrap(), vec!["a"]);
        // Satisfied now, so not queued again
        assert_eq!(queue.enqueue(vec![plain("a")]), 0);
    }

    #[test]
    fn test_priority_order() {
        let action = Arc::new(CountingAction::default());
        let (queue, _store) = queue_with(action.clone(), Arc::new(StaticConditions::online()), 10);

        queue.enqueue(vec![
            job("bulk", false, false, true, 0),
            job("old-unread", false, true, false, 30),
            job("starred", true, false, true, 60),
        ]);
        queue.enqueue(vec![job("new-unread", false, true, false, 1)]);
        queue.drain(&CancellationToken::new()).unwrap();

        assert_eq!(
            *action.performed.lock().unwrap(),
            vec!["starred", "new-unread", "old-unread", "bulk"]
        );
    }

    #[test]
    fn test_hourly_budget_caps_work() {
        let action = Arc::new(CountingAction::default());
        let (queue, _store) = queue_with(action.clone(), Arc::new(StaticConditions::online()), 10);

        queue.enqueue((0..50).map(|i| plain(&format!("m{i}"))).collect());
        let report = queue.drain(&CancellationToken::new()).unwrap();

        assert_eq!(report.performed, 10);
        assert_eq!(report.paused, Some(PauseReason::BudgetExhausted));
        assert_eq!(queue.len(), 40);

        let again = queue.drain(&CancellationToken::new()).unwrap();
        assert_eq!(again.performed, 0);
        assert_eq!(action.performed.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_device_gates_pause_without_losing_jobs() {
        let action = Arc::new(CountingAction {
            network: true,
            ..Default::default()
        });
        let device = Arc::new(StaticConditions::new(DeviceSnapshot {
            low_power_mode: true,
            ..Default::default()
        }));
        let (queue, _store) = queue_with(action.clone(), device.clone(), 10);
        queue.enqueue(vec![plain("a")]);

        let report = queue.drain(&CancellationToken::new()).unwrap();
        assert_eq!(report.paused, Some(PauseReason::LowPowerMode));

        device.set_low_power_mode(false);
        device.set_battery_level(Some(0.1));
        let report = queue.drain(&CancellationToken::new()).unwrap();
        assert_eq!(report.paused, Some(PauseReason::LowBattery));

        device.set_battery_level(Some(0.9));
        device.set_network_available(false);
        let report = queue.drain(&CancellationToken::new()).unwrap();
        assert_eq!(report.paused, Some(PauseReason::Offline));

        assert_eq!(queue.len(), 1);
        assert!(action.performed.lock().unwrap().is_empty());

        device.set_network_available(true);
        let report = queue.drain(&CancellationToken::new()).unwrap();
        assert_eq!(report.performed, 1);
        assert_eq!(queue.phase(), QueuePhase::Idle);
    }

    #[test]
    fn test_failed_jobs_are_dropped() {
        let action = Arc::new(CountingAction::default());
        action.fail.store(true, Ordering::SeqCst);
        let (queue, store) = queue_with(action.clone(), Arc::new(StaticConditions::online()), 10);

        queue.enqueue(vec![plain("a"), plain("b")]);
        let report = queue.drain(&CancellationToken::new()).unwrap();

        assert_eq!(report.failed, 2);
        assert!(queue.is_empty());
        // Failures do not spend budget
        assert_eq!(
            store
                .count_since("budget.counting", Utc::now() - Duration::hours(1))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_enqueue_candidates_drains_in_background() {
        let action = Arc::new(CountingAction::default());
        let (queue, _store) = queue_with(action.clone(), Arc::new(StaticConditions::online()), 10);

        queue.offer(vec![plain("a"), plain("b")]);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while action.performed.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(action.performed.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_second_drain_is_refused() {
        let action = Arc::new(CountingAction::default());
        let (queue, _store) = queue_with(action, Arc::new(StaticConditions::online()), 10);
        queue.state().phase = QueuePhase::Draining;

        let report = queue.drain(&CancellationToken::new()).unwrap();
        assert!(report.already_running);
    }
}
