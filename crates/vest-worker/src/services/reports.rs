//! Report data collection and artifact storage.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Map, Value};
use tracing::debug;
use vest_models::ReportType;

use crate::error::{WorkerError, WorkerResult};
use crate::services::investments::{DistributionRecord, DistributionRepository, PropertyRepository};
use crate::services::render::ReportData;

/// Gathers the rows of a report.
#[async_trait]
pub trait ReportDataSource: Send + Sync {
    async fn collect(
        &self,
        report_type: ReportType,
        parameters: &Map<String, Value>,
    ) -> WorkerResult<ReportData>;
}

/// Persists rendered artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, returning the artifact location.
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> WorkerResult<String>;
}

/// Artifacts on the local filesystem under a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> WorkerResult<String> {
        if key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(WorkerError::validation(format!("invalid artifact key '{}'", key)));
        }

        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!(path = %path.display(), content_type, size = bytes.len(), "Stored artifact");
        Ok(path.display().to_string())
    }
}

/// Read a required string parameter.
pub fn param_str<'a>(parameters: &'a Map<String, Value>, name: &str) -> WorkerResult<&'a str> {
    match parameters.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        _ => Err(WorkerError::validation(format!("missing parameter '{}'", name))),
    }
}

/// Read a required integer parameter given as a number or a numeric string.
pub fn param_i64(parameters: &Map<String, Value>, name: &str) -> WorkerResult<i64> {
    let parsed = match parameters.get(name) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| WorkerError::validation(format!("parameter '{}' must be an integer", name)))
}

pub fn param_date(parameters: &Map<String, Value>, name: &str) -> WorkerResult<NaiveDate> {
    let raw = param_str(parameters, name)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        WorkerError::validation(format!("parameter '{}' must be a YYYY-MM-DD date, got '{}'", name, raw))
    })
}

/// Check parameter values beyond presence.
pub fn validate_parameters(report_type: ReportType, parameters: &Map<String, Value>) -> WorkerResult<()> {
    match report_type {
        ReportType::InvestorStatement => {
            let start = param_date(parameters, "startDate")?;
            let end = param_date(parameters, "endDate")?;
            if start > end {
                return Err(WorkerError::validation("startDate is after endDate"));
            }
        }
        ReportType::PropertyPerformance | ReportType::DistributionHistory => {
            param_i64(parameters, "propertyId")?;
        }
        ReportType::TaxDocument => {
            let year = param_i64(parameters, "taxYear")?;
            if !(1900..=2100).contains(&year) {
                return Err(WorkerError::validation(format!("taxYear {} is out of range", year)));
            }
        }
        ReportType::PortfolioSummary => {}
    }
    Ok(())
}

fn cents(amount_cents: i64) -> Value {
    json!(amount_cents as f64 / 100.0)
}

/// Reports built from the investment repositories.
pub struct InvestmentReportSource {
    properties: Arc<dyn PropertyRepository>,
    distributions: Arc<dyn DistributionRepository>,
}

impl InvestmentReportSource {
    pub fn new(
        properties: Arc<dyn PropertyRepository>,
        distributions: Arc<dyn DistributionRepository>,
    ) -> Self {
        Self {
            properties,
            distributions,
        }
    }

    async fn property_name(&self, property_id: i64) -> WorkerResult<String> {
        Ok(self
            .properties
            .get_property(property_id)
            .await?
            .map(|p| p.name)
            .unwrap_or_else(|| format!("Property {}", property_id)))
    }

    /// Every credit to `investor_id`, with the record it belongs to.
    async fn credits_of(&self, investor_id: &str) -> WorkerResult<Vec<(DistributionRecord, i64)>> {
        let mut property_ids: Vec<i64> = self
            .properties
            .investments_of_investor(investor_id)
            .await?
            .into_iter()
            .map(|i| i.property_id)
            .collect();
        property_ids.sort_unstable();
        property_ids.dedup();

        let mut credits = Vec::new();
        for property_id in property_ids {
            for record in self.distributions.distributions_for(property_id).await? {
                let amount: i64 = record
                    .distributions
                    .iter()
                    .filter(|d| d.investor_id == investor_id)
                    .map(|d| d.amount_cents)
                    .sum();
                if amount > 0 {
                    credits.push((record, amount));
                }
            }
        }
        credits.sort_by_key(|(record, _)| record.recorded_at);
        Ok(credits)
    }

    async fn investor_statement(&self, parameters: &Map<String, Value>) -> WorkerResult<ReportData> {
        let user_id = param_str(parameters, "userId")?;
        let start = param_date(parameters, "startDate")?;
        let end = param_date(parameters, "endDate")?;

        let mut data = ReportData::new(
            format!("Investor Statement {} to {}", start, end),
            &["date", "property", "period", "amount"],
        );
        let mut total = 0;
        for (record, amount) in self.credits_of(user_id).await? {
            let day = record.recorded_at.date_naive();
            if day < start || day > end {
                continue;
            }
            total += amount;
            data.push_row(vec![
                json!(day.to_string()),
                json!(self.property_name(record.property_id).await?),
                json!(record.period_id),
                cents(amount),
            ]);
        }
        Ok(data.with_summary("userId", user_id).with_summary("total", cents(total)))
    }

    async fn property_performance(&self, parameters: &Map<String, Value>) -> WorkerResult<ReportData> {
        let property_id = param_i64(parameters, "propertyId")?;
        let property = self
            .properties
            .get_property(property_id)
            .await?
            .ok_or_else(|| WorkerError::not_found(format!("property {}", property_id)))?;
        let investors = self.properties.investments_for(property_id).await?.len();

        let mut data = ReportData::new(
            format!("Property Performance: {}", property.name),
            &["period", "method", "distributed", "investors"],
        );
        let mut total = 0;
        for record in self.distributions.distributions_for(property_id).await? {
            total += record.total_cents;
            data.push_row(vec![
                json!(record.period_id),
                json!(record.method),
                cents(record.total_cents),
                json!(record.distributions.len()),
            ]);
        }
        Ok(data
            .with_summary("investors", investors)
            .with_summary("totalDistributed", cents(total)))
    }

    async fn portfolio_summary(&self, parameters: &Map<String, Value>) -> WorkerResult<ReportData> {
        let user_id = param_str(parameters, "userId")?;
        let investments = self.properties.investments_of_investor(user_id).await?;
        let credits = self.credits_of(user_id).await?;

        let mut data = ReportData::new(
            "Portfolio Summary",
            &["property", "stakePercent", "received"],
        );
        let mut total = 0;
        for investment in &investments {
            let received: i64 = credits
                .iter()
                .filter(|(record, _)| record.property_id == investment.property_id)
                .map(|(_, amount)| amount)
                .sum();
            total += received;
            data.push_row(vec![
                json!(self.property_name(investment.property_id).await?),
                json!(investment.stake_percent),
                cents(received),
            ]);
        }
        Ok(data
            .with_summary("properties", investments.len())
            .with_summary("totalReceived", cents(total)))
    }

    async fn distribution_history(&self, parameters: &Map<String, Value>) -> WorkerResult<ReportData> {
        let property_id = param_i64(parameters, "propertyId")?;
        let name = self.property_name(property_id).await?;

        let mut data = ReportData::new(
            format!("Distribution History: {}", name),
            &["date", "period", "investor", "amount"],
        );
        let mut total = 0;
        for record in self.distributions.distributions_for(property_id).await? {
            for line in &record.distributions {
                total += line.amount_cents;
                data.push_row(vec![
                    json!(record.recorded_at.date_naive().to_string()),
                    json!(record.period_id),
                    json!(line.investor_name),
                    cents(line.amount_cents),
                ]);
            }
        }
        Ok(data.with_summary("total", cents(total)))
    }

    async fn tax_document(&self, parameters: &Map<String, Value>) -> WorkerResult<ReportData> {
        let user_id = param_str(parameters, "userId")?;
        let year = param_i64(parameters, "taxYear")?;

        let mut data = ReportData::new(
            format!("Tax Document {}", year),
            &["date", "property", "income"],
        );
        let mut total = 0;
        for (record, amount) in self.credits_of(user_id).await? {
            if i64::from(record.recorded_at.year()) != year {
                continue;
            }
            total += amount;
            data.push_row(vec![
                json!(record.recorded_at.date_naive().to_string()),
                json!(self.property_name(record.property_id).await?),
                cents(amount),
            ]);
        }
        Ok(data
            .with_summary("userId", user_id)
            .with_summary("taxYear", year)
            .with_summary("totalIncome", cents(total)))
    }
}

#[async_trait]
impl ReportDataSource for InvestmentReportSource {
    async fn collect(
        &self,
        report_type: ReportType,
        parameters: &Map<String, Value>,
    ) -> WorkerResult<ReportData> {
        match report_type {
            ReportType::InvestorStatement => self.investor_statement(parameters).await,
            ReportType::PropertyPerformance => self.property_performance(parameters).await,
            ReportType::PortfolioSummary => self.portfolio_summary(parameters).await,
            ReportType::DistributionHistory => self.distribution_history(parameters).await,
            ReportType::TaxDocument => self.tax_document(parameters).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::investments::tests::investment;
    use crate::services::investments::{Distribution, InMemoryInvestments, Property};
    use chrono::{TimeZone, Utc};
    use vest_models::CalculationMethod;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> Arc<InMemoryInvestments> {
        let repo = Arc::new(InMemoryInvestments::new());
        repo.add_property(Property {
            id: 1,
            name: "Elm Street".to_string(),
        });
        repo.add_investment(investment(1, "a", 60.0));
        repo.add_investment(investment(2, "b", 40.0));
        repo.record_distribution(DistributionRecord {
            property_id: 1,
            period_id: "2026-Q1".to_string(),
            method: CalculationMethod::ProRata,
            total_cents: 1_000,
            distributions: vec![
                Distribution {
                    investment_id: 1,
                    investor_id: "a".to_string(),
                    investor_email: "a@example.com".to_string(),
                    investor_name: "a".to_string(),
                    amount_cents: 600,
                },
                Distribution {
                    investment_id: 2,
                    investor_id: "b".to_string(),
                    investor_email: "b@example.com".to_string(),
                    investor_name: "b".to_string(),
                    amount_cents: 400,
                },
            ],
            recorded_at: Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap(),
        })
        .await
        .unwrap();
        repo
    }

    #[test]
    fn test_validate_parameters() {
        assert!(validate_parameters(
            ReportType::InvestorStatement,
            &params(json!({"userId": "a", "startDate": "2026-02-01", "endDate": "2026-01-01"}))
        )
        .is_err());
        assert!(validate_parameters(ReportType::TaxDocument, &params(json!({"taxYear": "2026"}))).is_ok());
        assert!(validate_parameters(ReportType::TaxDocument, &params(json!({"taxYear": 12}))).is_err());
        assert!(validate_parameters(ReportType::PropertyPerformance, &params(json!({"propertyId": "x"}))).is_err());
    }

    #[tokio::test]
    async fn test_investor_statement_filters_by_date() {
        let repo = seeded().await;
        let source = InvestmentReportSource::new(repo.clone(), repo);

        let inside = source
            .collect(
                ReportType::InvestorStatement,
                &params(json!({"userId": "a", "startDate": "2026-01-01", "endDate": "2026-12-31"})),
            )
            .await
            .unwrap();
        assert_eq!(inside.rows.len(), 1);
        assert_eq!(inside.summary["total"], 6.0);

        let outside = source
            .collect(
                ReportType::InvestorStatement,
                &params(json!({"userId": "a", "startDate": "2025-01-01", "endDate": "2025-12-31"})),
            )
            .await
            .unwrap();
        assert!(outside.rows.is_empty());
    }

    #[tokio::test]
    async fn test_property_performance_unknown_property() {
        let repo = seeded().await;
        let source = InvestmentReportSource::new(repo.clone(), repo);

        let err = source
            .collect(ReportType::PropertyPerformance, &params(json!({"propertyId": 99})))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fs_artifact_store_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let location = store
            .put("tax-document/job-1.csv", "text/csv", b"a,b\r\n")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&location).unwrap(), b"a,b\r\n");
        assert!(store.put("../escape.csv", "text/csv", b"").await.is_err());
    }
}
