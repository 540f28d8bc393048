use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Wakeable wait shared between a worker thread and its owner.
///
/// `stop` is sticky until `reset`; `wake` only interrupts the current wait.
#[derive(Default)]
pub struct StopSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

#[derive(Default)]
struct SignalState {
    stopped: bool,
    wakeups: u64,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        self.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn wake(&self) {
        let mut state = self.lock();
        state.wakeups = state.wakeups.wrapping_add(1);
        drop(state);
        self.condvar.notify_all();
    }

    /// Wake-up generation; pass it to [`StopSignal::wait_since`] so wakes
    /// issued between reading it and waiting are not lost.
    pub fn generation(&self) -> u64 {
        self.lock().wakeups
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let seen = self.generation();
        self.wait_since(seen, timeout)
    }

    // Returns true when the signal was stopped.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.stopped && state.wakeups == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.stopped
    }
}

#[derive(Debug)]
pub enum WorkerError {
    InvalidInterval { name: String },
    AlreadyRunning { name: String },
    SpawnFailed { name: String, source: std::io::Error },
    JoinFailed { name: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { name } => {
                write!(f, "background worker '{name}' needs an interval above 0ms")
            }
            Self::AlreadyRunning { name } => {
                write!(f, "background worker '{name}' is already running")
            }
            Self::SpawnFailed { name, source } => {
                write!(f, "background worker '{name}' thread spawn failed: {source}")
            }
            Self::JoinFailed { name } => {
                write!(f, "background worker '{name}' thread join failed")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

pub type WorkerTask = dyn Fn() -> Result<(), String> + Send + Sync;

/// Runs `task` every `interval` on its own thread until stopped.
pub struct BackgroundWorker {
    name: String,
    interval: Duration,
    task: Arc<WorkerTask>,
    logger: Arc<Logger>,
    signal: Arc<StopSignal>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        logger: Arc<Logger>,
        task: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Result<Self, WorkerError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(WorkerError::InvalidInterval { name });
        }

        Ok(Self {
            name,
            interval,
            task: Arc::new(task),
            logger,
            signal: Arc::new(StopSignal::new()),
            worker: None,
        })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.worker.is_some() {
            return Err(WorkerError::AlreadyRunning {
                name: self.name.clone(),
            });
        }

        self.signal.reset();
        let signal = Arc::clone(&self.signal);
        let task = Arc::clone(&self.task);
        let logger = Arc::clone(&self.logger);
        let name = self.name.clone();
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                logger.log(
                    LogLevel::Debug,
                    Some("worker::loop"),
                    "Background worker started",
                    Some(json!({ "worker": name, "interval_ms": interval.as_millis() as u64 })),
                );

                while !signal.wait_timeout(interval) {
                    run_iteration(&name, task.as_ref(), &logger);
                }

                logger.log(
                    LogLevel::Debug,
                    Some("worker::loop"),
                    "Background worker stopped",
                    Some(json!({ "worker": name })),
                );
            })
            .map_err(|source| WorkerError::SpawnFailed {
                name: self.name.clone(),
                source,
            })?;

        self.worker = Some(handle);
        Ok(())
    }

    // Blocks until the current iteration (if any) has finished.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        self.signal.stop();

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| WorkerError::JoinFailed {
                name: self.name.clone(),
            });
        }

        Ok(())
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn run_iteration(name: &str, task: &WorkerTask, logger: &Logger) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => logger.log(
            LogLevel::Error,
            Some("worker::iteration"),
            "Background worker iteration failed",
            Some(json!({ "worker": name, "error": error })),
        ),
        Err(panic_payload) => logger.log(
            LogLevel::Error,
            Some("worker::iteration"),
            "Background worker iteration panicked",
            Some(json!({ "worker": name, "panic": panic_message(panic_payload.as_ref()) })),
        ),
    }
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
