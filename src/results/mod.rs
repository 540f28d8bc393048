use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};
use crate::renderer::{RenderError, RenderFormat, Renderer};
use crate::storage::{StorageError, StorageFacade};
use crate::utils::timing::timed;

/// Outcome of one execution, keyed by (report, job, execution time).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResult {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub user_id: u32,
    pub execution_time: DateTime<Utc>,
    pub success: bool,
}

/// Execution times are kept at millisecond precision, the resolution of
/// both the storage keys and the wire timestamp type.
pub fn execution_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[derive(Debug)]
pub enum ResultStoreError {
    EmptySource { report_id: Uuid, job_id: Uuid },
    Storage(StorageError),
    Render(RenderError),
}

impl fmt::Display for ResultStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySource { report_id, job_id } => write!(
                f,
                "refusing to record result of job '{job_id}' (report '{report_id}') without a renderable source"
            ),
            Self::Storage(source) => write!(f, "result storage failed: {source}"),
            Self::Render(source) => write!(f, "result rendering failed: {source}"),
        }
    }
}

impl std::error::Error for ResultStoreError {}

pub struct ResultStore {
    storage: Arc<StorageFacade>,
    renderer: Arc<dyn Renderer>,
    logger: Arc<Logger>,
}

impl ResultStore {
    pub fn new(
        storage: Arc<StorageFacade>,
        renderer: Arc<dyn Renderer>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            storage,
            renderer,
            logger,
        }
    }

    /// Stores the result metadata and its source atomically.
    pub fn record(&self, result: &ReportResult, source: &[u8]) -> Result<(), ResultStoreError> {
        if source.is_empty() {
            return Err(ResultStoreError::EmptySource {
                report_id: result.report_id,
                job_id: result.job_id,
            });
        }

        self.storage
            .insert_result(result, source)
            .map_err(ResultStoreError::Storage)?;
        self.logger.log(
            LogLevel::Info,
            Some("results::record"),
            "Report result recorded",
            Some(json!({
                "report_id": result.report_id.to_string(),
                "job_id": result.job_id.to_string(),
                "user_id": result.user_id,
                "execution_time": result.execution_time.to_rfc3339(),
                "source_bytes": source.len(),
            })),
        );
        Ok(())
    }

    /// User 0 lists every owner's results; ordered by execution time.
    pub fn list_results(
        &self,
        report_id: Uuid,
        user_id: u32,
    ) -> Result<Vec<ReportResult>, ResultStoreError> {
        let mut results: Vec<ReportResult> = self
            .storage
            .list_results(report_id)
            .map_err(ResultStoreError::Storage)?
            .into_iter()
            .filter(|result| user_id == 0 || result.user_id == user_id)
            .collect();
        results.sort_by_key(|result| (result.execution_time, result.job_id));
        Ok(results)
    }

    /// Removes every execution of the job. Missing results are a no-op.
    pub fn delete_result(&self, report_id: Uuid, job_id: Uuid) -> Result<usize, ResultStoreError> {
        let removed = self
            .storage
            .remove_results(report_id, job_id)
            .map_err(ResultStoreError::Storage)?;
        self.logger.log(
            LogLevel::Info,
            Some("results::delete"),
            "Report results deleted",
            Some(json!({
                "report_id": report_id.to_string(),
                "job_id": job_id.to_string(),
                "removed": removed,
            })),
        );
        Ok(removed)
    }

    /// Renders the latest execution of the job from its stored source, so
    /// repeated calls return identical bytes. `None` when no result exists.
    pub fn render_result(
        &self,
        report_id: Uuid,
        job_id: Uuid,
        format: RenderFormat,
    ) -> Result<Option<Vec<u8>>, ResultStoreError> {
        let Some((result, source)) = self
            .storage
            .latest_result_with_source(report_id, job_id)
            .map_err(ResultStoreError::Storage)?
        else {
            return Ok(None);
        };

        let rendered = timed("results.render", Some("results::render"), &self.logger, || {
            self.renderer.render(&source, format)
        })
        .map_err(ResultStoreError::Render)?;

        self.logger.log(
            LogLevel::Debug,
            Some("results::render"),
            "Report result rendered",
            Some(json!({
                "report_id": report_id.to_string(),
                "job_id": job_id.to_string(),
                "execution_time": result.execution_time.to_rfc3339(),
                "format": format.as_str(),
                "bytes": rendered.len(),
            })),
        );
        Ok(Some(rendered))
    }

    /// Recreates metadata for stored sources that lost it. Returns how many
    /// results were repaired.
    pub fn validate(&self) -> Result<usize, ResultStoreError> {
        let orphaned = self
            .storage
            .list_orphaned_sources()
            .map_err(ResultStoreError::Storage)?;

        for source in &orphaned {
            let execution_time =
                DateTime::from_timestamp_millis(source.execution_ms).unwrap_or_default();
            self.logger.log(
                LogLevel::Warn,
                Some("results::validate"),
                "Result source without metadata; recreating result",
                Some(json!({
                    "report_id": source.report_id.to_string(),
                    "job_id": source.job_id.to_string(),
                    "execution_time": execution_time.to_rfc3339(),
                })),
            );
            self.storage
                .insert_result_metadata(&ReportResult {
                    report_id: source.report_id,
                    job_id: source.job_id,
                    user_id: 0,
                    execution_time,
                    success: true,
                })
                .map_err(ResultStoreError::Storage)?;
        }

        Ok(orphaned.len())
    }
}
