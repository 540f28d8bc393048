use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;

use crate::catalog::ReportCatalog;
use crate::connector::Broadcaster;
use crate::logging::{LogLevel, Logger};
use crate::notifications::FanOut;
use crate::renderer::{FillRequest, Renderer};
use crate::results::{execution_timestamp, ReportResult, ResultStore};
use crate::wire::protocol::RS_RESULTS_MODIFIED;

use super::{ExecutionRequest, JobRunner};

/// Runs one report execution: fill, record, announce, notify.
pub struct ReportExecutor {
    catalog: Arc<dyn ReportCatalog>,
    renderer: Arc<dyn Renderer>,
    results: Arc<ResultStore>,
    fanout: Arc<FanOut>,
    broadcaster: Arc<dyn Broadcaster>,
    logger: Arc<Logger>,
    locale: String,
}

impl ReportExecutor {
    pub fn new(
        catalog: Arc<dyn ReportCatalog>,
        renderer: Arc<dyn Renderer>,
        results: Arc<ResultStore>,
        fanout: Arc<FanOut>,
        broadcaster: Arc<dyn Broadcaster>,
        logger: Arc<Logger>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            renderer,
            results,
            fanout,
            broadcaster,
            logger,
            locale: locale.into(),
        }
    }

    fn fail(&self, request: &ExecutionRequest, message: &str, error: String) {
        self.logger.log(
            LogLevel::Error,
            Some("scheduler::execute"),
            message,
            Some(json!({
                "report_id": request.report_id.to_string(),
                "job_id": request.job_id.to_string(),
                "user_id": request.user_id,
                "error": error,
            })),
        );
    }
}

impl JobRunner for ReportExecutor {
    // A failure before the result is recorded leaves nothing behind.
    fn run(&self, request: &ExecutionRequest) {
        let started = Instant::now();
        let Some(definition) = self.catalog.get_definition(request.report_id, &self.locale) else {
            self.fail(
                request,
                "Report execution skipped",
                "report is not deployed".to_owned(),
            );
            return;
        };

        let executed_at = execution_timestamp(Utc::now());
        let source = match self.renderer.fill(&FillRequest {
            report_id: request.report_id,
            job_id: request.job_id,
            user_id: request.user_id,
            report_name: &definition.name,
            parameters: &request.parameters,
            executed_at,
        }) {
            Ok(source) => source,
            Err(error) => {
                self.fail(request, "Report fill failed", error.to_string());
                return;
            }
        };

        let result = ReportResult {
            report_id: request.report_id,
            job_id: request.job_id,
            user_id: request.user_id,
            execution_time: executed_at,
            success: true,
        };
        if let Err(error) = self.results.record(&result, &source) {
            self.fail(request, "Report result could not be recorded", error.to_string());
            return;
        }

        self.broadcaster.notify(RS_RESULTS_MODIFIED);
        let delivery = self.fanout.deliver(&result);

        self.logger.log(
            LogLevel::Info,
            Some("scheduler::execute"),
            "Report execution completed",
            Some(json!({
                "report_id": request.report_id.to_string(),
                "job_id": request.job_id.to_string(),
                "user_id": request.user_id,
                "report_name": definition.name,
                "duration_ms": started.elapsed().as_millis() as u64,
                "notifications_delivered": delivery.delivered,
                "notifications_failed": delivery.failed,
            })),
        );
    }
}
