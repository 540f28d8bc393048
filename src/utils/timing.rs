use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs how long the enclosing scope took once it is dropped.
pub struct ScopedTimer<'a> {
    task: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedTimer<'a> {
    pub fn start(task: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            task,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            "Timed task finished",
            Some(json!({
                "task": self.task,
                "elapsed_ms": elapsed.as_millis() as u64,
                "elapsed": describe_duration(elapsed),
            })),
        );
    }
}

pub fn timed<T>(task: &str, context: Option<&str>, logger: &Logger, body: impl FnOnce() -> T) -> T {
    let _timer = ScopedTimer::start(task, context, logger);
    body()
}

fn describe_duration(duration: Duration) -> String {
    let millis = duration.as_secs_f64() * 1000.0;
    if millis < 1_000.0 {
        return format!("{millis:.2} ms");
    }

    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        return format!("{seconds:.2} s");
    }

    let minutes = (seconds / 60.0).floor();
    format!("{minutes:.0}m {:.2}s", seconds - minutes * 60.0)
}
