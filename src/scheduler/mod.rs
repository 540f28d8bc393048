mod execution;
mod pool;
mod trigger;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::logging::{LogLevel, Logger};
use crate::storage::{StorageError, StorageFacade};
use crate::worker::StopSignal;

pub use execution::ReportExecutor;
pub use pool::ExecutionPool;
pub use trigger::{JobType, Trigger, TriggerError};

/// A persisted execution schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: Uuid,
    pub report_id: Uuid,
    pub user_id: u32,
    pub trigger: Trigger,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn job_type(&self) -> JobType {
        self.trigger.job_type()
    }
}

/// Request to persist (or replace) the schedule of `job_id`.
#[derive(Clone, Debug)]
pub struct RecurringSchedule {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub days_of_week: u32,
    pub days_of_month: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub parameters: BTreeMap<String, String>,
    pub user_id: u32,
    pub comments: String,
}

/// One execution handed to the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub user_id: u32,
    pub parameters: BTreeMap<String, String>,
    pub requested_at: DateTime<Utc>,
}

pub trait JobRunner: Send + Sync {
    fn run(&self, request: &ExecutionRequest);
}

#[derive(Debug)]
pub enum SchedulerError {
    InvalidUtcOffset { minutes: i32 },
    InvalidPoolSize { threads: usize, capacity: usize },
    InvalidTrigger(TriggerError),
    AlreadyRunning,
    NotRunning,
    QueueFull { job_id: Uuid },
    SpawnFailed(std::io::Error),
    JoinFailed,
    Storage(StorageError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtcOffset { minutes } => {
                write!(f, "scheduler.utc_offset_minutes {minutes} is out of range")
            }
            Self::InvalidPoolSize { threads, capacity } => write!(
                f,
                "execution pool needs at least one thread and one queue slot, got {threads} threads and {capacity} slots"
            ),
            Self::InvalidTrigger(source) => write!(f, "invalid schedule: {source}"),
            Self::AlreadyRunning => write!(f, "scheduler is already running"),
            Self::NotRunning => write!(f, "scheduler is not running"),
            Self::QueueFull { job_id } => {
                write!(f, "execution queue is full; job '{job_id}' was not started")
            }
            Self::SpawnFailed(source) => write!(f, "scheduler thread spawn failed: {source}"),
            Self::JoinFailed => write!(f, "scheduler timer thread join failed"),
            Self::Storage(source) => write!(f, "schedule persistence failed: {source}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

struct PendingJob {
    job: ScheduledJob,
    next_due: Option<DateTime<Utc>>,
}

struct SchedulerShared {
    storage: Arc<StorageFacade>,
    logger: Arc<Logger>,
    offset: FixedOffset,
    max_idle_wait: Duration,
    jobs: Mutex<HashMap<Uuid, PendingJob>>,
    pool: Mutex<Option<Arc<ExecutionPool>>>,
    signal: StopSignal,
}

pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Restores persisted schedules; nothing fires until [`Scheduler::start`].
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<StorageFacade>,
        runner: Arc<dyn JobRunner>,
        logger: Arc<Logger>,
    ) -> Result<Self, SchedulerError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60)).ok_or(
            SchedulerError::InvalidUtcOffset {
                minutes: config.utc_offset_minutes,
            },
        )?;

        let now = Utc::now();
        let mut jobs = HashMap::new();
        for job in storage.load_schedules().map_err(SchedulerError::Storage)? {
            let next_due = job.trigger.next_due(now, offset);
            logger.log(
                LogLevel::Debug,
                Some("scheduler::restore"),
                "Restored persisted schedule",
                Some(json!({
                    "report_id": job.report_id.to_string(),
                    "job_id": job.job_id.to_string(),
                    "job_type": job.job_type().as_str(),
                    "next_due": next_due.map(|at| at.to_rfc3339()),
                })),
            );
            jobs.insert(job.job_id, PendingJob { job, next_due });
        }
        logger.log(
            LogLevel::Info,
            Some("scheduler::restore"),
            "Persisted schedules restored",
            Some(json!({ "schedules": jobs.len() })),
        );

        Ok(Self {
            shared: Arc::new(SchedulerShared {
                storage,
                logger,
                offset,
                max_idle_wait: Duration::from_millis(config.max_idle_wait_ms.max(1)),
                jobs: Mutex::new(jobs),
                pool: Mutex::new(None),
                signal: StopSignal::new(),
            }),
            runner,
            config,
            timer: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let pool = ExecutionPool::start(
            self.config.execution_threads,
            self.config.queue_capacity,
            Arc::clone(&self.runner),
            Arc::clone(&self.shared.logger),
        )?;
        *lock(&self.shared.pool) = Some(Arc::new(pool));

        self.shared.signal.reset();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("scheduler-timer".to_owned())
            .spawn(move || timer_loop(&shared))
            .map_err(SchedulerError::SpawnFailed)?;
        *timer = Some(handle);

        self.shared.logger.log(
            LogLevel::Info,
            Some("scheduler::start"),
            "Scheduler started",
            Some(json!({
                "execution_threads": self.config.execution_threads,
                "queue_capacity": self.config.queue_capacity,
                "utc_offset_minutes": self.config.utc_offset_minutes,
            })),
        );
        Ok(())
    }

    /// Stops the timer first, then drains the pool: queued runs are dropped,
    /// runs already executing complete before this returns.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        self.shared.signal.stop();
        let timer = lock(&self.timer).take();
        let joined = match timer {
            Some(handle) => handle.join().map_err(|_| SchedulerError::JoinFailed),
            None => Ok(()),
        };

        if let Some(pool) = lock(&self.shared.pool).take() {
            pool.shutdown();
            self.shared.logger.log(
                LogLevel::Info,
                Some("scheduler::stop"),
                "Scheduler stopped",
                None,
            );
        }
        joined
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        lock(&self.timer).is_some()
    }

    /// Queues an immediate execution under a fresh job id. Nothing is persisted.
    pub fn schedule_once(
        &self,
        report_id: Uuid,
        user_id: u32,
        parameters: BTreeMap<String, String>,
    ) -> Result<Uuid, SchedulerError> {
        let job_id = Uuid::new_v4();
        self.shared.submit(ExecutionRequest {
            report_id,
            job_id,
            user_id,
            parameters,
            requested_at: Utc::now(),
        })?;

        self.shared.logger.log(
            LogLevel::Info,
            Some("scheduler::once"),
            "Immediate report execution queued",
            Some(json!({
                "report_id": report_id.to_string(),
                "job_id": job_id.to_string(),
                "user_id": user_id,
            })),
        );
        Ok(job_id)
    }

    /// Persists the schedule, replacing any existing one with the same job id.
    pub fn schedule_recurring(
        &self,
        request: RecurringSchedule,
    ) -> Result<ScheduledJob, SchedulerError> {
        let trigger = Trigger::from_parts(
            request.job_type,
            request.start_time,
            request.days_of_week,
            request.days_of_month,
        )
        .map_err(SchedulerError::InvalidTrigger)?;

        let now = Utc::now();
        let mut jobs = lock(&self.shared.jobs);
        let created_at = jobs
            .get(&request.job_id)
            .map(|pending| pending.job.created_at)
            .unwrap_or(now);
        let job = ScheduledJob {
            job_id: request.job_id,
            report_id: request.report_id,
            user_id: request.user_id,
            trigger,
            parameters: request.parameters,
            comments: request.comments,
            created_at,
        };

        self.shared
            .storage
            .upsert_schedule(&job)
            .map_err(SchedulerError::Storage)?;
        let next_due = trigger.next_due(now, self.shared.offset);
        jobs.insert(
            job.job_id,
            PendingJob {
                job: job.clone(),
                next_due,
            },
        );
        drop(jobs);
        self.shared.signal.wake();

        self.shared.logger.log(
            LogLevel::Info,
            Some("scheduler::recurring"),
            "Report execution scheduled",
            Some(json!({
                "report_id": job.report_id.to_string(),
                "job_id": job.job_id.to_string(),
                "user_id": job.user_id,
                "job_type": job.job_type().as_str(),
                "next_due": next_due.map(|at| at.to_rfc3339()),
            })),
        );
        Ok(job)
    }

    /// User 0 lists every owner's schedules.
    pub fn list_schedules(&self, report_id: Uuid, user_id: u32) -> Vec<ScheduledJob> {
        let mut schedules: Vec<ScheduledJob> = lock(&self.shared.jobs)
            .values()
            .map(|pending| &pending.job)
            .filter(|job| job.report_id == report_id)
            .filter(|job| user_id == 0 || job.user_id == user_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|job| (job.created_at, job.job_id));
        schedules
    }

    pub fn next_due(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        lock(&self.shared.jobs)
            .get(&job_id)
            .and_then(|pending| pending.next_due)
    }

    /// Returns whether a schedule was removed; an unknown job is not an error.
    pub fn delete_schedule(&self, report_id: Uuid, job_id: Uuid) -> Result<bool, SchedulerError> {
        let mut jobs = lock(&self.shared.jobs);
        if jobs
            .get(&job_id)
            .is_some_and(|pending| pending.job.report_id != report_id)
        {
            return Ok(false);
        }

        let persisted = self
            .shared
            .storage
            .remove_schedule(job_id)
            .map_err(SchedulerError::Storage)?;
        let pending = jobs.remove(&job_id).is_some();
        drop(jobs);
        self.shared.signal.wake();

        let removed = persisted || pending;
        self.shared.logger.log(
            LogLevel::Info,
            Some("scheduler::delete"),
            if removed {
                "Schedule deleted"
            } else {
                "Schedule to delete was not found"
            },
            Some(json!({
                "report_id": report_id.to_string(),
                "job_id": job_id.to_string(),
            })),
        );
        Ok(removed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SchedulerShared {
    fn submit(&self, request: ExecutionRequest) -> Result<(), SchedulerError> {
        let pool = lock(&self.pool).clone().ok_or(SchedulerError::NotRunning)?;
        pool.submit(request)
    }

    // Advances recurring jobs past `now` and retires fired one-shot jobs.
    fn take_due(&self, now: DateTime<Utc>) -> (Vec<ScheduledJob>, Option<DateTime<Utc>>) {
        let mut jobs = lock(&self.jobs);
        let mut due = Vec::new();
        for pending in jobs.values_mut() {
            if pending.next_due.is_some_and(|at| at <= now) {
                due.push(pending.job.clone());
                pending.next_due = if pending.job.trigger.is_recurring() {
                    pending.job.trigger.next_due(now, self.offset)
                } else {
                    None
                };
            }
        }

        for job in due.iter().filter(|job| !job.trigger.is_recurring()) {
            jobs.remove(&job.job_id);
            if let Err(error) = self.storage.remove_schedule(job.job_id) {
                self.logger.log(
                    LogLevel::Error,
                    Some("scheduler::timer"),
                    "Failed to remove fired one-shot schedule",
                    Some(json!({
                        "report_id": job.report_id.to_string(),
                        "job_id": job.job_id.to_string(),
                        "error": error.to_string(),
                    })),
                );
            }
        }

        let next_wake = jobs.values().filter_map(|pending| pending.next_due).min();
        (due, next_wake)
    }

    fn fire(&self, job: ScheduledJob, now: DateTime<Utc>) {
        let payload = json!({
            "report_id": job.report_id.to_string(),
            "job_id": job.job_id.to_string(),
            "job_type": job.job_type().as_str(),
        });
        let request = ExecutionRequest {
            report_id: job.report_id,
            job_id: job.job_id,
            user_id: job.user_id,
            parameters: job.parameters,
            requested_at: now,
        };

        match self.submit(request) {
            Ok(()) => self.logger.log(
                LogLevel::Debug,
                Some("scheduler::timer"),
                "Scheduled report execution fired",
                Some(payload),
            ),
            Err(error) => {
                let mut payload = payload;
                payload["error"] = json!(error.to_string());
                self.logger.log(
                    LogLevel::Warn,
                    Some("scheduler::timer"),
                    "Scheduled report execution skipped",
                    Some(payload),
                );
            }
        }
    }
}

fn timer_loop(shared: &SchedulerShared) {
    loop {
        let seen = shared.signal.generation();
        if shared.signal.is_stopped() {
            break;
        }

        let now = Utc::now();
        let (due, next_wake) = shared.take_due(now);
        for job in due {
            shared.fire(job, now);
        }

        let wait = next_wake
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(shared.max_idle_wait)
            .min(shared.max_idle_wait);
        if shared.signal.wait_since(seen, wait) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use uuid::Uuid;

    use crate::config::SchedulerConfig;
    use crate::logging::quiet_logger;
    use crate::storage::TempStorage;

    use super::{
        ExecutionRequest, JobRunner, JobType, RecurringSchedule, Scheduler, SchedulerError,
        TriggerError,
    };

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<ExecutionRequest>>,
    }

    impl Recorder {
        fn wait_for(&self, count: usize) -> Vec<ExecutionRequest> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let runs = self.runs.lock().expect("runs lock should work").clone();
                if runs.len() >= count || Instant::now() >= deadline {
                    return runs;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl JobRunner for Recorder {
        fn run(&self, request: &ExecutionRequest) {
            self.runs
                .lock()
                .expect("runs lock should work")
                .push(request.clone());
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            execution_threads: 2,
            queue_capacity: 16,
            max_idle_wait_ms: 50,
            utc_offset_minutes: 0,
        }
    }

    fn weekly(report_id: Uuid, job_id: Uuid, user_id: u32) -> RecurringSchedule {
        RecurringSchedule {
            report_id,
            job_id,
            job_type: JobType::Weekly,
            days_of_week: 0b0010101,
            days_of_month: 0,
            start_time: Some(Utc::now()),
            parameters: BTreeMap::from([("from".to_owned(), "2024-01-01".to_owned())]),
            user_id,
            comments: "weekly digest".to_owned(),
        }
    }

    #[test]
    fn concurrent_schedule_once_yields_distinct_jobs_and_runs() {
        let temp = TempStorage::new("scheduler-once");
        let recorder = Arc::new(Recorder::default());
        let scheduler = Arc::new(
            Scheduler::new(config(), temp.open(), recorder.clone(), quiet_logger())
                .expect("scheduler should build"),
        );
        scheduler.start().expect("scheduler should start");

        let report_id = Uuid::new_v4();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                std::thread::spawn(move || {
                    scheduler
                        .schedule_once(report_id, 3, BTreeMap::new())
                        .expect("schedule once should work")
                })
            })
            .collect();
        let ids: Vec<Uuid> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should join"))
            .collect();

        assert_ne!(ids[0], ids[1]);
        let runs = recorder.wait_for(2);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.report_id == report_id));
        assert!(ids.iter().all(|id| runs.iter().any(|run| run.job_id == *id)));
        assert!(scheduler.list_schedules(report_id, 0).is_empty());

        scheduler.stop().expect("scheduler should stop");
    }

    #[test]
    fn schedule_once_requires_running_scheduler() {
        let temp = TempStorage::new("scheduler-not-running");
        let scheduler = Scheduler::new(
            config(),
            temp.open(),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should build");

        assert!(matches!(
            scheduler.schedule_once(Uuid::new_v4(), 1, BTreeMap::new()),
            Err(SchedulerError::NotRunning)
        ));
    }

    #[test]
    fn recurring_schedules_are_listed_per_user_and_survive_restart() {
        let temp = TempStorage::new("scheduler-restore");
        let report_id = Uuid::new_v4();
        let alice_job = Uuid::new_v4();
        let bob_job = Uuid::new_v4();

        {
            let scheduler = Scheduler::new(
                config(),
                temp.open(),
                Arc::new(Recorder::default()),
                quiet_logger(),
            )
            .expect("scheduler should build");
            scheduler
                .schedule_recurring(weekly(report_id, alice_job, 1))
                .expect("alice schedule should persist");
            scheduler
                .schedule_recurring(weekly(report_id, bob_job, 2))
                .expect("bob schedule should persist");
            scheduler
                .schedule_recurring(weekly(Uuid::new_v4(), Uuid::new_v4(), 1))
                .expect("other report schedule should persist");

            assert_eq!(scheduler.list_schedules(report_id, 0).len(), 2);
            let alice = scheduler.list_schedules(report_id, 1);
            assert_eq!(alice.len(), 1);
            assert_eq!(alice[0].job_id, alice_job);
        }

        let restarted = Scheduler::new(
            config(),
            temp.reopen(),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should rebuild");
        let restored = restarted.list_schedules(report_id, 2);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].job_id, bob_job);
        assert_eq!(restored[0].job_type(), JobType::Weekly);
        assert_eq!(restored[0].comments, "weekly digest");
        assert!(restarted.next_due(bob_job).is_some());
    }

    #[test]
    fn rescheduling_keeps_job_id_and_creation_time() {
        let temp = TempStorage::new("scheduler-reschedule");
        let scheduler = Scheduler::new(
            config(),
            temp.open(),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should build");
        let report_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let first = scheduler
            .schedule_recurring(weekly(report_id, job_id, 1))
            .expect("first schedule should persist");
        let mut daily = weekly(report_id, job_id, 1);
        daily.job_type = JobType::Daily;
        let second = scheduler
            .schedule_recurring(daily)
            .expect("reschedule should persist");

        assert_eq!(second.created_at, first.created_at);
        let listed = scheduler.list_schedules(report_id, 0);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_type(), JobType::Daily);
    }

    #[test]
    fn delete_is_idempotent_and_scoped_to_report() {
        let temp = TempStorage::new("scheduler-delete");
        let scheduler = Scheduler::new(
            config(),
            temp.open(),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should build");
        let report_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        scheduler
            .schedule_recurring(weekly(report_id, job_id, 1))
            .expect("schedule should persist");

        assert!(!scheduler
            .delete_schedule(Uuid::new_v4(), job_id)
            .expect("foreign delete should not fail"));
        assert_eq!(scheduler.list_schedules(report_id, 0).len(), 1);

        assert!(scheduler
            .delete_schedule(report_id, job_id)
            .expect("delete should work"));
        assert!(!scheduler
            .delete_schedule(report_id, job_id)
            .expect("repeated delete should be a no-op"));
        assert!(scheduler.list_schedules(report_id, 0).is_empty());
    }

    #[test]
    fn past_one_shot_fires_once_and_is_removed() {
        let temp = TempStorage::new("scheduler-one-shot");
        let recorder = Arc::new(Recorder::default());
        let storage = temp.open();
        let scheduler = Scheduler::new(config(), Arc::clone(&storage), recorder.clone(), quiet_logger())
            .expect("scheduler should build");
        let report_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        let mut once = weekly(report_id, job_id, 4);
        once.job_type = JobType::Once;
        once.start_time = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler
            .schedule_recurring(once)
            .expect("one-shot should persist");
        scheduler.start().expect("scheduler should start");

        let runs = recorder.wait_for(1);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, job_id);
        assert_eq!(runs[0].user_id, 4);

        std::thread::sleep(Duration::from_millis(120));
        scheduler.stop().expect("scheduler should stop");
        assert_eq!(recorder.runs.lock().expect("runs lock should work").len(), 1);
        assert!(scheduler.list_schedules(report_id, 0).is_empty());
        assert!(storage
            .load_schedules()
            .expect("load should work")
            .is_empty());
    }

    #[test]
    fn invalid_trigger_is_rejected_without_persisting() {
        let temp = TempStorage::new("scheduler-invalid");
        let storage = temp.open();
        let scheduler = Scheduler::new(
            config(),
            Arc::clone(&storage),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should build");
        let mut request = weekly(Uuid::new_v4(), Uuid::new_v4(), 1);
        request.days_of_week = 0;

        assert!(matches!(
            scheduler.schedule_recurring(request),
            Err(SchedulerError::InvalidTrigger(TriggerError::InvalidDaysOfWeek { mask: 0 }))
        ));
        assert!(storage
            .load_schedules()
            .expect("load should work")
            .is_empty());
    }

    #[test]
    fn start_twice_fails_and_stop_is_idempotent() {
        let temp = TempStorage::new("scheduler-lifecycle");
        let scheduler = Scheduler::new(
            config(),
            temp.open(),
            Arc::new(Recorder::default()),
            quiet_logger(),
        )
        .expect("scheduler should build");
        scheduler.start().expect("scheduler should start");
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyRunning)
        ));
        scheduler.stop().expect("scheduler should stop");
        scheduler.stop().expect("second stop should be a no-op");
        assert!(!scheduler.is_running());
    }
}
