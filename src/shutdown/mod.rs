use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// SIGINT/SIGTERM latch. The same flag can be raised from inside the
/// process, which is how a finished self-debug run ends the server.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    /// Sleeps in `poll` steps until triggered or `tick` asks to stop.
    /// `tick` runs once per step; returning `false` raises the latch.
    pub fn wait(&self, poll: Duration, mut tick: impl FnMut() -> bool) {
        while !self.is_triggered() {
            if !tick() {
                self.request();
                break;
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ShutdownHooks;

    #[test]
    fn internal_request_raises_the_latch() {
        let hooks = ShutdownHooks::install().expect("hooks should install");
        assert!(!hooks.is_triggered());
        hooks.request();
        assert!(hooks.is_triggered());
    }

    #[test]
    fn wait_stops_when_tick_declines() {
        let hooks = ShutdownHooks::install().expect("hooks should install");
        let mut ticks = 0;
        hooks.wait(Duration::from_millis(1), || {
            ticks += 1;
            ticks < 3
        });
        assert_eq!(ticks, 3);
        assert!(hooks.is_triggered());
    }
}
