use std::fs;

use serde_json::json;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::logging::{LogLevel, Logger};
use crate::notifications::Notification;
use crate::results::ReportResult;
use crate::scheduler::ScheduledJob;

use super::{
    expand_home_path, EngineSettings, OrphanedSource, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

pub struct StorageFacade {
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(config: &StorageConfig, logger: &Logger) -> Result<Self, StorageError> {
        let settings = EngineSettings::from_config(config)?;
        let data_path = expand_home_path(&config.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Opening storage",
            Some(json!({
                "configured_path": config.path,
                "resolved_path": data_path.display().to_string(),
                "settings": settings.log_payload(),
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match settings.engine {
            StorageEngine::Sled => Box::new(SledStorage::open(&data_path, &settings)?),
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage opened",
            Some(json!({
                "engine": settings.engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self { backend })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn load_schedules(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        self.backend.load_schedules()
    }

    pub fn upsert_schedule(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        self.backend.upsert_schedule(job)
    }

    pub fn remove_schedule(&self, job_id: Uuid) -> Result<bool, StorageError> {
        self.backend.remove_schedule(job_id)
    }

    pub fn insert_result(&self, result: &ReportResult, source: &[u8]) -> Result<(), StorageError> {
        self.backend.insert_result(result, source)
    }

    pub fn insert_result_metadata(&self, result: &ReportResult) -> Result<(), StorageError> {
        self.backend.insert_result_metadata(result)
    }

    #[cfg(test)]
    pub(crate) fn remove_result_metadata(&self, result: &ReportResult) -> Result<bool, StorageError> {
        self.backend.remove_result_metadata(result)
    }

    pub fn list_results(&self, report_id: Uuid) -> Result<Vec<ReportResult>, StorageError> {
        self.backend.list_results(report_id)
    }

    pub fn latest_result_with_source(
        &self,
        report_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<(ReportResult, Vec<u8>)>, StorageError> {
        self.backend.latest_result_with_source(report_id, job_id)
    }

    pub fn remove_results(&self, report_id: Uuid, job_id: Uuid) -> Result<usize, StorageError> {
        self.backend.remove_results(report_id, job_id)
    }

    pub fn list_orphaned_sources(&self) -> Result<Vec<OrphanedSource>, StorageError> {
        self.backend.list_orphaned_sources()
    }

    pub fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), StorageError> {
        self.backend.insert_notifications(notifications)
    }

    pub fn load_notifications(&self, job_id: Uuid) -> Result<Vec<Notification>, StorageError> {
        self.backend.load_notifications(job_id)
    }

    pub fn remove_notifications(&self, job_id: Uuid) -> Result<usize, StorageError> {
        self.backend.remove_notifications(job_id)
    }
}
