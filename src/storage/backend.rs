use uuid::Uuid;

use crate::notifications::Notification;
use crate::results::ReportResult;
use crate::scheduler::ScheduledJob;

use super::StorageError;

/// Result source bytes stored without matching metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanedSource {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub execution_ms: i64,
}

pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    fn load_schedules(&self) -> Result<Vec<ScheduledJob>, StorageError>;
    fn upsert_schedule(&self, job: &ScheduledJob) -> Result<(), StorageError>;
    fn remove_schedule(&self, job_id: Uuid) -> Result<bool, StorageError>;

    fn insert_result(&self, result: &ReportResult, source: &[u8]) -> Result<(), StorageError>;
    fn list_results(&self, report_id: Uuid) -> Result<Vec<ReportResult>, StorageError>;
    fn latest_result_with_source(
        &self,
        report_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<(ReportResult, Vec<u8>)>, StorageError>;
    fn remove_results(&self, report_id: Uuid, job_id: Uuid) -> Result<usize, StorageError>;
    fn list_orphaned_sources(&self) -> Result<Vec<OrphanedSource>, StorageError>;
    fn insert_result_metadata(&self, result: &ReportResult) -> Result<(), StorageError>;
    /// Drops only the metadata of one execution, leaving its source behind.
    #[cfg(test)]
    fn remove_result_metadata(&self, result: &ReportResult) -> Result<bool, StorageError>;

    fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), StorageError>;
    fn load_notifications(&self, job_id: Uuid) -> Result<Vec<Notification>, StorageError>;
    fn remove_notifications(&self, job_id: Uuid) -> Result<usize, StorageError>;
}
