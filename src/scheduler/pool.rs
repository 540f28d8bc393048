use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::worker::panic_message;

use super::{ExecutionRequest, JobRunner, SchedulerError};

/// Fixed set of execution threads fed by a bounded queue.
pub struct ExecutionPool {
    sender: Mutex<Option<Sender<ExecutionRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl ExecutionPool {
    pub fn start(
        threads: usize,
        capacity: usize,
        runner: Arc<dyn JobRunner>,
        logger: Arc<Logger>,
    ) -> Result<Self, SchedulerError> {
        if threads == 0 || capacity == 0 {
            return Err(SchedulerError::InvalidPoolSize { threads, capacity });
        }

        let (sender, receiver) = bounded::<ExecutionRequest>(capacity);
        let closing = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let runner = Arc::clone(&runner);
            let logger = Arc::clone(&logger);
            let closing = Arc::clone(&closing);
            let handle = thread::Builder::new()
                .name(format!("report-exec-{index}"))
                .spawn(move || execution_loop(receiver, runner.as_ref(), &logger, &closing))
                .map_err(SchedulerError::SpawnFailed)?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            closing,
        })
    }

    pub fn submit(&self, request: ExecutionRequest) -> Result<(), SchedulerError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(SchedulerError::NotRunning);
        };

        match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) => Err(SchedulerError::QueueFull {
                job_id: request.job_id,
            }),
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::NotRunning),
        }
    }

    // Queued runs that have not started are dropped; running ones complete.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn execution_loop(
    receiver: Receiver<ExecutionRequest>,
    runner: &dyn JobRunner,
    logger: &Logger,
    closing: &AtomicBool,
) {
    while let Ok(request) = receiver.recv() {
        if closing.load(Ordering::SeqCst) {
            logger.log(
                LogLevel::Debug,
                Some("scheduler::pool"),
                "Dropping queued execution during shutdown",
                Some(json!({
                    "report_id": request.report_id.to_string(),
                    "job_id": request.job_id.to_string(),
                })),
            );
            continue;
        }

        if let Err(panic_payload) = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&request))) {
            logger.log(
                LogLevel::Error,
                Some("scheduler::pool"),
                "Report execution panicked",
                Some(json!({
                    "report_id": request.report_id.to_string(),
                    "job_id": request.job_id.to_string(),
                    "panic": panic_message(panic_payload.as_ref()),
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::logging::quiet_logger;
    use crate::scheduler::{ExecutionRequest, JobRunner, SchedulerError};

    use super::ExecutionPool;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            report_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            user_id: 1,
            parameters: BTreeMap::new(),
            requested_at: Utc::now(),
        }
    }

    struct Gate {
        started: Mutex<mpsc::Sender<Uuid>>,
        release: Mutex<mpsc::Receiver<()>>,
        completed: AtomicUsize,
    }

    impl JobRunner for Gate {
        fn run(&self, request: &ExecutionRequest) {
            let _ = self
                .started
                .lock()
                .expect("started lock should work")
                .send(request.job_id);
            let _ = self
                .release
                .lock()
                .expect("release lock should work")
                .recv_timeout(Duration::from_secs(5));
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanicsForUserOne(Mutex<mpsc::Sender<u32>>);

    impl JobRunner for PanicsForUserOne {
        fn run(&self, request: &ExecutionRequest) {
            if request.user_id == 1 {
                panic!("renderer exploded");
            }
            let _ = self
                .0
                .lock()
                .expect("runs lock should work")
                .send(request.user_id);
        }
    }

    #[test]
    fn full_queue_is_reported_and_shutdown_lets_running_job_finish() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
            completed: AtomicUsize::new(0),
        });
        let pool = ExecutionPool::start(1, 1, gate.clone(), quiet_logger())
            .expect("pool should start");

        let first = request();
        pool.submit(first.clone()).expect("first submit should work");
        assert_eq!(
            started_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("first job should start"),
            first.job_id
        );

        pool.submit(request()).expect("queue has room for one");
        let overflow = request();
        assert!(matches!(
            pool.submit(overflow.clone()),
            Err(SchedulerError::QueueFull { job_id }) if job_id == overflow.job_id
        ));

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let _ = release_tx.send(());
        });
        pool.shutdown();

        assert_eq!(gate.completed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.submit(request()),
            Err(SchedulerError::NotRunning)
        ));
    }

    #[test]
    fn panicking_run_does_not_kill_the_worker() {
        let (tx, rx) = mpsc::channel();
        let pool = ExecutionPool::start(
            1,
            4,
            Arc::new(PanicsForUserOne(Mutex::new(tx))),
            quiet_logger(),
        )
        .expect("pool should start");

        pool.submit(request()).expect("submit should work");
        let mut survivor = request();
        survivor.user_id = 2;
        pool.submit(survivor).expect("submit should work");

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2))
                .expect("second run should complete"),
            2
        );
        pool.shutdown();
    }

    #[test]
    fn rejects_empty_pool() {
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            ExecutionPool::start(0, 4, Arc::new(PanicsForUserOne(Mutex::new(tx))), quiet_logger()),
            Err(SchedulerError::InvalidPoolSize { .. })
        ));
    }
}
