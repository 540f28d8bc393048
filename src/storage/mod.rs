mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

pub use backend::{OrphanedSource, StorageBackend};
pub use engine::{EngineSettings, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
pub use path::expand_home_path;
pub use sled_backend::SledStorage;

/// Scratch storage directory removed when dropped.
#[cfg(test)]
pub(crate) struct TempStorage {
    pub path: std::path::PathBuf,
}

#[cfg(test)]
impl TempStorage {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "reportd-storage-test-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        Self { path }
    }

    pub fn config(&self) -> crate::config::StorageConfig {
        crate::config::StorageConfig {
            engine: "sled".to_owned(),
            path: self.path.to_string_lossy().to_string(),
            self_debug_path: None,
            sled: crate::config::SledConfig::default(),
        }
    }

    pub fn open(&self) -> std::sync::Arc<StorageFacade> {
        let logger = crate::logging::quiet_logger();
        std::sync::Arc::new(
            StorageFacade::initialize(&self.config(), &logger).expect("storage init should work"),
        )
    }

    /// Opens the directory again once every handle of an earlier `open` has
    /// been dropped. sled releases its file lock from background threads,
    /// so the lock is retried for a short while.
    pub fn reopen(&self) -> std::sync::Arc<StorageFacade> {
        let logger = crate::logging::quiet_logger();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match StorageFacade::initialize(&self.config(), &logger) {
                Ok(storage) => return std::sync::Arc::new(storage),
                Err(error) if std::time::Instant::now() >= deadline => {
                    panic!("storage reopen should work: {error}")
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(20)),
            }
        }
    }
}

#[cfg(test)]
impl Drop for TempStorage {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
