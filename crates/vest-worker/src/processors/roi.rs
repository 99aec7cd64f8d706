//! ROI distribution.
//!
//! Computes every investor's share of a property distribution, records the
//! distribution once per `(propertyId, periodId)` and emits one email job
//! per credited investor. A retry after partial success neither credits
//! investors twice nor sends a second email: the record is keyed by period
//! and each email job carries a deduplication key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use vest_models::{CalculationMethod, EmailPayload, QueueName, RoiDistributionPayload};
use vest_queue::QueueRegistry;

use crate::error::{WorkerError, WorkerResult};
use crate::processor::{JobContext, JobProcessor};
use crate::processors::enqueue_once;
use crate::services::investments::{
    allocate_fixed, allocate_pro_rata, to_cents, Distribution, DistributionRecord,
    DistributionRepository, Property, PropertyRepository, RecordOutcome,
};

pub struct RoiDistributionProcessor {
    properties: Arc<dyn PropertyRepository>,
    distributions: Arc<dyn DistributionRepository>,
    registry: Arc<QueueRegistry>,
}

impl RoiDistributionProcessor {
    pub fn new(
        properties: Arc<dyn PropertyRepository>,
        distributions: Arc<dyn DistributionRepository>,
        registry: Arc<QueueRegistry>,
    ) -> Self {
        Self {
            properties,
            distributions,
            registry,
        }
    }

    async fn compute(
        &self,
        payload: &RoiDistributionPayload,
        total_cents: i64,
    ) -> WorkerResult<(Property, Vec<Distribution>)> {
        let property = self
            .properties
            .get_property(payload.property_id)
            .await?
            .ok_or_else(|| WorkerError::not_found(format!("property {}", payload.property_id)))?;
        let investments = self.properties.investments_for(property.id).await?;

        let shares = match payload.calculation_method {
            CalculationMethod::ProRata => allocate_pro_rata(total_cents, &investments)?,
            CalculationMethod::Fixed => {
                allocate_fixed(total_cents, &investments, &payload.fixed_amounts)?
            }
        };

        let distributions = investments
            .into_iter()
            .zip(shares)
            .map(|(investment, amount_cents)| Distribution {
                investment_id: investment.id,
                investor_id: investment.investor_id,
                investor_email: investment.investor_email,
                investor_name: investment.investor_name,
                amount_cents,
            })
            .collect();
        Ok((property, distributions))
    }

    /// The record stored for this period, which may predate this attempt.
    async fn stored_record(&self, property_id: i64, period_id: &str) -> WorkerResult<DistributionRecord> {
        self.distributions
            .distributions_for(property_id)
            .await?
            .into_iter()
            .find(|r| r.period_id == period_id)
            .ok_or_else(|| {
                WorkerError::Connection(format!(
                    "distribution {}/{} reported as recorded but not readable",
                    property_id, period_id
                ))
            })
    }

    async fn notify_investors(
        &self,
        property: &Property,
        record: &DistributionRecord,
    ) -> WorkerResult<(usize, usize)> {
        let mut queued = 0;
        let mut skipped = 0;

        for line in record.distributions.iter().filter(|d| d.amount_cents > 0) {
            let email = EmailPayload::new(
                line.investor_email.clone(),
                "Distribution credited: {{propertyName}}",
                "roi-distribution",
            )
            .with_var("name", line.investor_name.clone())
            .with_var("amount", format!("{:.2}", line.amount()))
            .with_var("propertyName", property.name.clone())
            .with_var("periodId", record.period_id.clone());

            let key = format!("roi:{}:{}:{}", record.property_id, record.period_id, line.investor_id);
            if enqueue_once(&self.registry, QueueName::Email, serde_json::to_value(&email)?, key).await? {
                queued += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((queued, skipped))
    }
}

#[async_trait]
impl JobProcessor for RoiDistributionProcessor {
    fn queue(&self) -> QueueName {
        QueueName::RoiDistribution
    }

    async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value> {
        let payload: RoiDistributionPayload = ctx.payload_as()?;
        if payload.property_id <= 0 {
            return Err(WorkerError::validation("propertyId must be positive"));
        }
        let total_cents = to_cents(payload.total_amount)?;
        if total_cents == 0 {
            return Err(WorkerError::validation("totalAmount must be greater than zero"));
        }

        let (property, distributions) = self.compute(&payload, total_cents).await?;
        let period_id = payload
            .period_id
            .clone()
            .unwrap_or_else(|| ctx.job_id.to_string());

        ctx.logger.log_progress(&format!(
            "distributing {:.2} across {} investment(s) of property {} for period {}",
            total_cents as f64 / 100.0,
            distributions.len(),
            property.id,
            period_id
        ));

        let record = DistributionRecord {
            property_id: property.id,
            period_id: period_id.clone(),
            method: payload.calculation_method,
            total_cents,
            distributions,
            recorded_at: Utc::now(),
        };

        let outcome = self.distributions.record_distribution(record.clone()).await?;
        let record = match outcome {
            RecordOutcome::Recorded => record,
            RecordOutcome::AlreadyRecorded => {
                ctx.logger.log_warning(&format!(
                    "distribution for period {} already recorded, not crediting again",
                    period_id
                ));
                self.stored_record(property.id, &period_id).await?
            }
        };

        let (emails_queued, emails_skipped) = if payload.notify_investors {
            self.notify_investors(&property, &record).await?
        } else {
            (0, 0)
        };

        let lines: Vec<serde_json::Value> = record
            .distributions
            .iter()
            .map(|d| json!({"investorId": d.investor_id, "amount": d.amount()}))
            .collect();

        Ok(json!({
            "propertyId": property.id,
            "periodId": record.period_id,
            "totalAmount": record.total_cents as f64 / 100.0,
            "recorded": outcome == RecordOutcome::Recorded,
            "distributions": lines,
            "emailsQueued": emails_queued,
            "emailsSkipped": emails_skipped,
        }))
    }
}
