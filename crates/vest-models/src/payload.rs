//! Typed payloads for the job processors.
//!
//! The queue treats payloads as opaque JSON; processors deserialize them into
//! these types and validate them before doing any work.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(addr) => vec![addr],
        OneOrMany::Many(addrs) => addrs,
    })
}

/// Email dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    /// Recipient addresses (a single string is accepted)
    #[serde(deserialize_with = "one_or_many")]
    #[validate(length(min = 1, message = "at least one recipient is required"))]
    pub to: Vec<String>,
    /// Subject line
    #[validate(length(min = 1, max = 998))]
    pub subject: String,
    /// Registered template name
    #[validate(length(min = 1))]
    pub template: String,
    /// Variables substituted into the template
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            template: template.into(),
            context: serde_json::Map::new(),
        }
    }

    /// Add a template variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// How a distribution is split across investments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CalculationMethod {
    /// Each investor receives `totalAmount * stake / 100`
    ProRata,
    /// Each investor receives an explicit override amount
    Fixed,
}

/// ROI distribution request for one property and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoiDistributionPayload {
    pub property_id: i64,
    pub total_amount: f64,
    pub calculation_method: CalculationMethod,
    /// Idempotency period; defaults to the job id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_id: Option<String>,
    /// Per-investor amounts for the fixed method, keyed by investor id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixed_amounts: BTreeMap<String, f64>,
    /// Emit one email job per credited investor
    #[serde(default = "default_true")]
    pub notify_investors: bool,
}

fn default_true() -> bool {
    true
}

impl RoiDistributionPayload {
    pub fn pro_rata(property_id: i64, total_amount: f64) -> Self {
        Self {
            property_id,
            total_amount,
            calculation_method: CalculationMethod::ProRata,
            period_id: None,
            fixed_amounts: BTreeMap::new(),
            notify_investors: true,
        }
    }

    /// Set the idempotency period.
    pub fn with_period(mut self, period_id: impl Into<String>) -> Self {
        self.period_id = Some(period_id.into());
        self
    }
}

/// Kinds of report the generator knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    InvestorStatement,
    PropertyPerformance,
    PortfolioSummary,
    DistributionHistory,
    TaxDocument,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::InvestorStatement => "investor-statement",
            ReportType::PropertyPerformance => "property-performance",
            ReportType::PortfolioSummary => "portfolio-summary",
            ReportType::DistributionHistory => "distribution-history",
            ReportType::TaxDocument => "tax-document",
        }
    }

    /// Parameters that must be present for this report type.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            ReportType::InvestorStatement => &["userId", "startDate", "endDate"],
            ReportType::PropertyPerformance => &["propertyId"],
            ReportType::PortfolioSummary => &["userId"],
            ReportType::DistributionHistory => &["propertyId"],
            ReportType::TaxDocument => &["userId", "taxYear"],
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of a rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Pdf,
    Csv,
    Excel,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Csv => "csv",
            ReportFormat::Excel => "xls",
            ReportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "application/pdf",
            ReportFormat::Csv => "text/csv",
            ReportFormat::Excel => "application/vnd.ms-excel",
            ReportFormat::Json => "application/json",
        }
    }
}

/// Report generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub report_type: ReportType,
    #[serde(default)]
    pub format: ReportFormat,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// User to notify once the artifact is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_user_id: Option<String>,
}

impl ReportPayload {
    pub fn new(report_type: ReportType, format: ReportFormat) -> Self {
        Self {
            report_type,
            format,
            parameters: serde_json::Map::new(),
            notify_user_id: None,
        }
    }

    /// Add a report parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Required parameters missing (absent, null or blank) from this request.
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        self.report_type
            .required_parameters()
            .iter()
            .copied()
            .filter(|name| match self.parameters.get(*name) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .collect()
    }
}

/// In-app notification for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1))]
    pub message: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

fn default_kind() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_accepts_single_recipient_string() {
        let payload: EmailPayload = serde_json::from_value(json!({
            "to": "investor@example.com",
            "subject": "Welcome",
            "template": "welcome",
            "context": {"name": "Ada"}
        }))
        .unwrap();

        assert_eq!(payload.to, vec!["investor@example.com".to_string()]);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_email_requires_context() {
        let result = serde_json::from_value::<EmailPayload>(json!({
            "to": ["investor@example.com"],
            "subject": "Welcome",
            "template": "welcome"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_email_validation_rejects_empty_recipients() {
        let mut payload = EmailPayload::new("a@example.com", "Hi", "welcome");
        payload.to.clear();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_roi_payload_wire_format() {
        let payload: RoiDistributionPayload = serde_json::from_value(json!({
            "propertyId": 1,
            "totalAmount": 100000,
            "calculationMethod": "pro-rata"
        }))
        .unwrap();

        assert_eq!(payload.calculation_method, CalculationMethod::ProRata);
        assert!(payload.notify_investors);
        assert!(payload.period_id.is_none());
    }

    #[test]
    fn test_report_missing_parameters() {
        let payload = ReportPayload::new(ReportType::InvestorStatement, ReportFormat::Pdf)
            .with_param("startDate", "2026-01-01")
            .with_param("endDate", "")
            .with_param("userId", serde_json::Value::Null);

        assert_eq!(payload.missing_parameters(), vec!["userId", "endDate"]);
    }

    #[test]
    fn test_report_format_metadata() {
        assert_eq!(ReportFormat::Excel.extension(), "xls");
        assert_eq!(ReportFormat::Csv.content_type(), "text/csv");
        let format: ReportFormat = serde_json::from_value(json!("excel")).unwrap();
        assert_eq!(format, ReportFormat::Excel);
    }
}
