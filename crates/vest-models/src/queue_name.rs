//! The closed set of queue names.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a string is not one of the declared queue names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid queue name: {0}")]
pub struct InvalidQueueName(pub String);

/// Job category. Every queue in the system is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Email,
    RoiDistribution,
    ReportGeneration,
    Notification,
    DataImport,
    DataExport,
}

impl QueueName {
    /// Every declared queue, in registry initialization order.
    pub const ALL: [QueueName; 6] = [
        QueueName::Email,
        QueueName::RoiDistribution,
        QueueName::ReportGeneration,
        QueueName::Notification,
        QueueName::DataImport,
        QueueName::DataExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Email => "email",
            QueueName::RoiDistribution => "roi-distribution",
            QueueName::ReportGeneration => "report-generation",
            QueueName::Notification => "notification",
            QueueName::DataImport => "data-import",
            QueueName::DataExport => "data-export",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = InvalidQueueName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| InvalidQueueName(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_declared_names() {
        for name in QueueName::ALL {
            assert_eq!(name.as_str().parse::<QueueName>().unwrap(), name);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_name() {
        let err = "payments".parse::<QueueName>().unwrap_err();
        assert_eq!(err, InvalidQueueName("payments".to_string()));
        // Names are case-sensitive
        assert!("Email".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&QueueName::RoiDistribution).unwrap();
        assert_eq!(json, "\"roi-distribution\"");
    }
}
