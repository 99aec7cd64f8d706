//! Report generation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use vest_models::{NotificationPayload, QueueName, ReportPayload};
use vest_queue::QueueRegistry;

use crate::error::{WorkerError, WorkerResult};
use crate::processor::{JobContext, JobProcessor};
use crate::processors::enqueue_once;
use crate::services::render::render;
use crate::services::reports::{validate_parameters, ArtifactStore, ReportDataSource};

/// Collects, renders and stores a report, then optionally tells the user.
pub struct ReportProcessor {
    source: Arc<dyn ReportDataSource>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<QueueRegistry>,
    timeout: Duration,
}

impl ReportProcessor {
    pub fn new(
        source: Arc<dyn ReportDataSource>,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<QueueRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            artifacts,
            registry,
            timeout,
        }
    }

    async fn build(&self, payload: &ReportPayload) -> WorkerResult<(Vec<u8>, usize)> {
        let data = self
            .source
            .collect(payload.report_type, &payload.parameters)
            .await?;
        let rows = data.rows.len();

        let format = payload.format;
        let bytes = tokio::task::spawn_blocking(move || render(format, &data))
            .await
            .map_err(|e| WorkerError::ResourceExhausted(format!("render task failed: {}", e)))??;
        Ok((bytes, rows))
    }
}

#[async_trait]
impl JobProcessor for ReportProcessor {
    fn queue(&self) -> QueueName {
        QueueName::ReportGeneration
    }

    async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value> {
        let payload: ReportPayload = ctx.payload_as()?;

        let missing = payload.missing_parameters();
        if !missing.is_empty() {
            return Err(WorkerError::validation(format!(
                "{} report requires: {}",
                payload.report_type,
                missing.join(", ")
            )));
        }
        validate_parameters(payload.report_type, &payload.parameters)?;

        ctx.logger.log_progress(&format!(
            "generating {} report as {}",
            payload.report_type,
            payload.format.extension()
        ));
        let (bytes, rows) = tokio::time::timeout(self.timeout, self.build(&payload)).await??;

        let key = format!(
            "{}/{}.{}",
            payload.report_type,
            ctx.job_id,
            payload.format.extension()
        );
        let location = self
            .artifacts
            .put(&key, payload.format.content_type(), &bytes)
            .await?;
        ctx.logger
            .log_progress(&format!("stored {} bytes at {}", bytes.len(), location));

        let notified = match &payload.notify_user_id {
            Some(user_id) => {
                let notification = NotificationPayload {
                    user_id: user_id.clone(),
                    title: "Report ready".to_string(),
                    message: format!("Your {} report is ready.", payload.report_type),
                    kind: "report-ready".to_string(),
                    link: Some(location.clone()),
                };
                enqueue_once(
                    &self.registry,
                    QueueName::Notification,
                    serde_json::to_value(&notification)?,
                    format!("report-ready:{}", ctx.job_id),
                )
                .await?;
                true
            }
            None => false,
        };

        Ok(json!({
            "reportType": payload.report_type,
            "format": payload.format,
            "location": location,
            "bytes": bytes.len(),
            "rows": rows,
            "notified": notified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::investments::tests::investment;
    use crate::services::investments::{InMemoryInvestments, Investment, Property};
    use crate::services::reports::{FsArtifactStore, InvestmentReportSource};
    use crate::services::render::ReportData;
    use serde_json::{Map, Value};
    use vest_models::{Job, JobOptions, ReportType};

    struct SlowSource;

    #[async_trait]
    impl ReportDataSource for SlowSource {
        async fn collect(&self, _: ReportType, _: &Map<String, Value>) -> WorkerResult<ReportData> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ReportData::default())
        }
    }

    fn setup(dir: &tempfile::TempDir) -> (Arc<QueueRegistry>, ReportProcessor) {
        let repo = Arc::new(InMemoryInvestments::new());
        repo.add_property(Property {
            id: 7,
            name: "Harbor Lofts".to_string(),
        });
        repo.add_investment(Investment { property_id: 7, ..investment(1, "u1", 100.0) });

        let registry = Arc::new(QueueRegistry::in_memory());
        let processor = ReportProcessor::new(
            Arc::new(InvestmentReportSource::new(repo.clone(), repo)),
            Arc::new(FsArtifactStore::new(dir.path())),
            registry.clone(),
            Duration::from_secs(5),
        );
        (registry, processor)
    }

    fn job(payload: Value) -> Job {
        Job::new(QueueName::ReportGeneration, payload, JobOptions::default())
    }

    #[tokio::test]
    async fn test_generates_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, processor) = setup(&dir);
        let job = job(json!({
            "reportType": "portfolio-summary",
            "format": "csv",
            "parameters": {"userId": "u1"},
            "notifyUserId": "u1"
        }));

        let result = processor.process(&JobContext::new(&job)).await.unwrap();

        let location = result["location"].as_str().unwrap();
        assert!(location.ends_with(&format!("portfolio-summary/{}.csv", job.id)));
        let csv = std::fs::read_to_string(location).unwrap();
        assert!(csv.starts_with("property,stakePercent,received\r\n"));
        assert!(csv.contains("Harbor Lofts"));
        assert_eq!(
            registry.get_queue_stats("notification").await.unwrap().waiting_count,
            1
        );
    }

    #[tokio::test]
    async fn test_missing_parameter_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let (_, processor) = setup(&dir);
        let job = job(json!({
            "reportType": "investor-statement",
            "parameters": {"startDate": "2026-01-01", "endDate": "2026-03-31"}
        }));

        let err = processor.process(&JobContext::new(&job)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(ref msg) if msg.contains("userId")));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_collection_times_out_as_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let processor = ReportProcessor::new(
            Arc::new(SlowSource),
            Arc::new(FsArtifactStore::new(dir.path())),
            Arc::new(QueueRegistry::in_memory()),
            Duration::from_millis(20),
        );
        let job = job(json!({"reportType": "portfolio-summary", "parameters": {"userId": "u1"}}));

        let err = processor.process(&JobContext::new(&job)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
