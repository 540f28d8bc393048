use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::notifications::Notification;
use crate::results::ReportResult;
use crate::scheduler::ScheduledJob;

use super::{EngineSettings, OrphanedSource, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const KEYSPACE_VERSION: &str = "v1";
const SCHEDULE_PREFIX: &str = "v1:s:";
const RESULT_PREFIX: &str = "v1:r:";
const RESULT_SOURCE_PREFIX: &str = "v1:rs:";
const NOTIFICATION_PREFIX: &str = "v1:n:";

impl SledStorage {
    pub fn open(data_path: &Path, settings: &EngineSettings) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);
        if let Some(cache_capacity) = settings.cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }
        if let Some(mode) = settings.mode {
            config = config.mode(mode.as_sled());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
        record: &'static str,
    ) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry.map_err(StorageError::Sled)?;
            items.push(decode(value.as_ref(), record)?);
        }
        Ok(items)
    }

    fn remove_prefixes(&self, prefixes: &[String]) -> Result<Vec<sled::IVec>, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = Vec::new();
        for prefix in prefixes {
            for entry in self.db.scan_prefix(prefix.as_bytes()) {
                let (key, _) = entry.map_err(StorageError::Sled)?;
                batch.remove(key.clone());
                removed.push(key);
            }
        }

        if !removed.is_empty() {
            self.db.apply_batch(batch).map_err(StorageError::Sled)?;
            self.db.flush().map_err(StorageError::Sled)?;
        }
        Ok(removed)
    }
}

fn encode<T: Serialize>(value: &T, record: &'static str) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|source| StorageError::Serialize { record, source })
}

fn decode<T: DeserializeOwned>(raw: &[u8], record: &'static str) -> Result<T, StorageError> {
    serde_json::from_slice(raw).map_err(|source| StorageError::Deserialize { record, source })
}

fn schedule_key(job_id: Uuid) -> String {
    format!("{SCHEDULE_PREFIX}{job_id}")
}

// Execution time is zero-padded so keys of one job sort chronologically.
fn result_key(prefix: &str, report_id: Uuid, job_id: Uuid, execution_ms: i64) -> String {
    format!("{prefix}{report_id}:{job_id}:{:020}", execution_ms.max(0))
}

fn result_job_prefix(prefix: &str, report_id: Uuid, job_id: Uuid) -> String {
    format!("{prefix}{report_id}:{job_id}:")
}

fn notification_key(notification: &Notification) -> String {
    format!("{NOTIFICATION_PREFIX}{}:{}", notification.job_id, notification.id)
}

fn parse_source_key(key: &[u8]) -> Result<OrphanedSource, StorageError> {
    let text = String::from_utf8_lossy(key);
    let corrupt = || StorageError::CorruptKey {
        key: text.to_string(),
    };
    let parts: Vec<&str> = text.split(':').collect();
    let [version, "rs", report_id, job_id, execution_ms] = parts.as_slice() else {
        return Err(corrupt());
    };
    if *version != KEYSPACE_VERSION {
        return Err(corrupt());
    }

    Ok(OrphanedSource {
        report_id: Uuid::parse_str(report_id).map_err(|_| corrupt())?,
        job_id: Uuid::parse_str(job_id).map_err(|_| corrupt())?,
        execution_ms: execution_ms.parse().map_err(|_| corrupt())?,
    })
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn load_schedules(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let mut jobs: Vec<ScheduledJob> = self.scan_json(SCHEDULE_PREFIX, "scheduled job")?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn upsert_schedule(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        let value = encode(job, "scheduled job")?;
        self.db
            .insert(schedule_key(job.job_id).as_bytes(), value)
            .map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    fn remove_schedule(&self, job_id: Uuid) -> Result<bool, StorageError> {
        let removed = self
            .db
            .remove(schedule_key(job_id).as_bytes())
            .map_err(StorageError::Sled)?;
        if removed.is_some() {
            self.db.flush().map_err(StorageError::Sled)?;
        }
        Ok(removed.is_some())
    }

    fn insert_result(&self, result: &ReportResult, source: &[u8]) -> Result<(), StorageError> {
        let execution_ms = result.execution_time.timestamp_millis();
        let mut batch = sled::Batch::default();
        batch.insert(
            result_key(RESULT_PREFIX, result.report_id, result.job_id, execution_ms).as_bytes(),
            encode(result, "report result")?,
        );
        batch.insert(
            result_key(RESULT_SOURCE_PREFIX, result.report_id, result.job_id, execution_ms).as_bytes(),
            source,
        );

        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    fn insert_result_metadata(&self, result: &ReportResult) -> Result<(), StorageError> {
        let key = result_key(
            RESULT_PREFIX,
            result.report_id,
            result.job_id,
            result.execution_time.timestamp_millis(),
        );
        self.db
            .insert(key.as_bytes(), encode(result, "report result")?)
            .map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    #[cfg(test)]
    fn remove_result_metadata(&self, result: &ReportResult) -> Result<bool, StorageError> {
        let key = result_key(
            RESULT_PREFIX,
            result.report_id,
            result.job_id,
            result.execution_time.timestamp_millis(),
        );
        let removed = self.db.remove(key.as_bytes()).map_err(StorageError::Sled)?;
        Ok(removed.is_some())
    }

    fn list_results(&self, report_id: Uuid) -> Result<Vec<ReportResult>, StorageError> {
        self.scan_json(&format!("{RESULT_PREFIX}{report_id}:"), "report result")
    }

    fn latest_result_with_source(
        &self,
        report_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<(ReportResult, Vec<u8>)>, StorageError> {
        let prefix = result_job_prefix(RESULT_PREFIX, report_id, job_id);
        let Some(entry) = self.db.scan_prefix(prefix.as_bytes()).next_back() else {
            return Ok(None);
        };
        let (_, value) = entry.map_err(StorageError::Sled)?;
        let result: ReportResult = decode(value.as_ref(), "report result")?;

        let source_key = result_key(
            RESULT_SOURCE_PREFIX,
            report_id,
            job_id,
            result.execution_time.timestamp_millis(),
        );
        let source = self
            .db
            .get(source_key.as_bytes())
            .map_err(StorageError::Sled)?;

        Ok(source.map(|source| (result, source.to_vec())))
    }

    fn remove_results(&self, report_id: Uuid, job_id: Uuid) -> Result<usize, StorageError> {
        let meta_prefix = result_job_prefix(RESULT_PREFIX, report_id, job_id);
        let removed = self.remove_prefixes(&[
            meta_prefix.clone(),
            result_job_prefix(RESULT_SOURCE_PREFIX, report_id, job_id),
        ])?;
        Ok(removed
            .iter()
            .filter(|key| key.starts_with(meta_prefix.as_bytes()))
            .count())
    }

    fn list_orphaned_sources(&self) -> Result<Vec<OrphanedSource>, StorageError> {
        let mut orphaned = Vec::new();
        for entry in self.db.scan_prefix(RESULT_SOURCE_PREFIX.as_bytes()) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            let source = parse_source_key(key.as_ref())?;
            let meta_key = result_key(
                RESULT_PREFIX,
                source.report_id,
                source.job_id,
                source.execution_ms,
            );
            if !self
                .db
                .contains_key(meta_key.as_bytes())
                .map_err(StorageError::Sled)?
            {
                orphaned.push(source);
            }
        }
        Ok(orphaned)
    }

    fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for notification in notifications {
            batch.insert(
                notification_key(notification).as_bytes(),
                encode(notification, "notification")?,
            );
        }

        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    fn load_notifications(&self, job_id: Uuid) -> Result<Vec<Notification>, StorageError> {
        self.scan_json(&format!("{NOTIFICATION_PREFIX}{job_id}:"), "notification")
    }

    fn remove_notifications(&self, job_id: Uuid) -> Result<usize, StorageError> {
        let removed = self.remove_prefixes(&[format!("{NOTIFICATION_PREFIX}{job_id}:")])?;
        Ok(removed.len())
    }
}
