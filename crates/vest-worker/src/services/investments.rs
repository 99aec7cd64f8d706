//! Properties, investments and recorded distributions.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vest_models::CalculationMethod;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investment {
    pub id: i64,
    pub property_id: i64,
    pub investor_id: String,
    pub investor_email: String,
    pub investor_name: String,
    /// Ownership share in percent
    pub stake_percent: f64,
    /// Amount paid under the fixed method when no per-job override is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_amount: Option<f64>,
}

/// One investor's share of a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub investment_id: i64,
    pub investor_id: String,
    pub investor_email: String,
    pub investor_name: String,
    pub amount_cents: i64,
}

impl Distribution {
    pub fn amount(&self) -> f64 {
        self.amount_cents as f64 / 100.0
    }
}

/// A distribution run for one property and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRecord {
    pub property_id: i64,
    pub period_id: String,
    pub method: CalculationMethod,
    pub total_cents: i64,
    pub distributions: Vec<Distribution>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// A record for the same property and period already exists
    AlreadyRecorded,
}

#[async_trait]
pub trait PropertyRepository: Send + Sync {
    async fn get_property(&self, property_id: i64) -> WorkerResult<Option<Property>>;

    async fn investments_for(&self, property_id: i64) -> WorkerResult<Vec<Investment>>;

    async fn investments_of_investor(&self, investor_id: &str) -> WorkerResult<Vec<Investment>>;
}

/// Persistence of distributions, unique per `(property_id, period_id)`.
#[async_trait]
pub trait DistributionRepository: Send + Sync {
    /// Store the record and credit investors in one step. Returns
    /// [`RecordOutcome::AlreadyRecorded`] without changes on a duplicate key.
    async fn record_distribution(&self, record: DistributionRecord) -> WorkerResult<RecordOutcome>;

    async fn distributions_for(&self, property_id: i64) -> WorkerResult<Vec<DistributionRecord>>;
}

#[derive(Debug, Default)]
struct Tables {
    properties: HashMap<i64, Property>,
    investments: Vec<Investment>,
    distributions: BTreeMap<(i64, String), DistributionRecord>,
}

/// Initial contents of an [`InMemoryInvestments`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentSeed {
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub investments: Vec<Investment>,
}

/// In-process repository.
#[derive(Debug, Default)]
pub struct InMemoryInvestments {
    tables: RwLock<Tables>,
}

impl InMemoryInvestments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: InvestmentSeed) -> Self {
        let repo = Self::new();
        for property in seed.properties {
            repo.add_property(property);
        }
        for investment in seed.investments {
            repo.add_investment(investment);
        }
        repo
    }

    /// Load a JSON seed file (`{"properties": [...], "investments": [...]}`).
    pub async fn load_seed_file(path: impl AsRef<std::path::Path>) -> WorkerResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        let seed: InvestmentSeed = serde_json::from_slice(&bytes)?;
        Ok(Self::from_seed(seed))
    }

    pub fn add_property(&self, property: Property) {
        self.write().properties.insert(property.id, property);
    }

    pub fn add_investment(&self, investment: Investment) {
        self.write().investments.push(investment);
    }

    /// Sum credited to an investor across every recorded distribution.
    pub fn credited_cents(&self, investor_id: &str) -> i64 {
        self.read()
            .distributions
            .values()
            .flat_map(|record| record.distributions.iter())
            .filter(|d| d.investor_id == investor_id)
            .map(|d| d.amount_cents)
            .sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PropertyRepository for InMemoryInvestments {
    async fn get_property(&self, property_id: i64) -> WorkerResult<Option<Property>> {
        Ok(self.read().properties.get(&property_id).cloned())
    }

    async fn investments_for(&self, property_id: i64) -> WorkerResult<Vec<Investment>> {
        let mut investments: Vec<Investment> = self
            .read()
            .investments
            .iter()
            .filter(|i| i.property_id == property_id)
            .cloned()
            .collect();
        investments.sort_by_key(|i| i.id);
        Ok(investments)
    }

    async fn investments_of_investor(&self, investor_id: &str) -> WorkerResult<Vec<Investment>> {
        let mut investments: Vec<Investment> = self
            .read()
            .investments
            .iter()
            .filter(|i| i.investor_id == investor_id)
            .cloned()
            .collect();
        investments.sort_by_key(|i| i.id);
        Ok(investments)
    }
}

#[async_trait]
impl DistributionRepository for InMemoryInvestments {
    async fn record_distribution(&self, record: DistributionRecord) -> WorkerResult<RecordOutcome> {
        let mut tables = self.write();
        let key = (record.property_id, record.period_id.clone());
        if tables.distributions.contains_key(&key) {
            return Ok(RecordOutcome::AlreadyRecorded);
        }
        tables.distributions.insert(key, record);
        Ok(RecordOutcome::Recorded)
    }

    async fn distributions_for(&self, property_id: i64) -> WorkerResult<Vec<DistributionRecord>> {
        Ok(self
            .read()
            .distributions
            .values()
            .filter(|r| r.property_id == property_id)
            .cloned()
            .collect())
    }
}

/// Largest amount accepted, in cents. Keeps every cent exact in an `f64`.
pub const MAX_AMOUNT_CENTS: i64 = 1_000_000_000_000_000;

/// Convert a currency amount to integer cents.
pub fn to_cents(amount: f64) -> WorkerResult<i64> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(WorkerError::validation(format!(
            "amount must be a non-negative number, got {}",
            amount
        )));
    }
    let cents = (amount * 100.0).round();
    if cents > MAX_AMOUNT_CENTS as f64 {
        return Err(WorkerError::validation(format!(
            "amount {} exceeds the maximum of {} cents",
            amount, MAX_AMOUNT_CENTS
        )));
    }
    Ok(cents as i64)
}

fn sum_cents(shares: &[i64]) -> WorkerResult<i64> {
    shares
        .iter()
        .try_fold(0i64, |acc, &share| acc.checked_add(share))
        .ok_or_else(|| WorkerError::business_rule("distribution total overflows"))
}

/// Split `total_cents` by stake. Shares are floored to the cent and the
/// leftover cents go to the largest fractional remainders, so the result
/// sums exactly to the stake-weighted total.
pub fn allocate_pro_rata(total_cents: i64, investments: &[Investment]) -> WorkerResult<Vec<i64>> {
    if investments.is_empty() {
        return Err(WorkerError::business_rule("property has no investments"));
    }
    if !(0..=MAX_AMOUNT_CENTS).contains(&total_cents) {
        return Err(WorkerError::validation(format!(
            "total of {} cents is out of range",
            total_cents
        )));
    }

    let mut stake_sum = 0.0;
    for investment in investments {
        if !investment.stake_percent.is_finite() || investment.stake_percent < 0.0 {
            return Err(WorkerError::business_rule(format!(
                "investment {} has invalid stake {}",
                investment.id, investment.stake_percent
            )));
        }
        stake_sum += investment.stake_percent;
    }
    if stake_sum > 100.0 + 1e-9 {
        return Err(WorkerError::business_rule(format!(
            "stakes sum to {}%, more than 100%",
            stake_sum
        )));
    }

    let total = total_cents as f64;
    let exact: Vec<f64> = investments
        .iter()
        .map(|i| total * i.stake_percent / 100.0)
        .collect();
    let mut shares: Vec<i64> = exact.iter().map(|x| x.floor() as i64).collect();

    let target = (total * stake_sum / 100.0).round() as i64;
    let mut leftover = target - sum_cents(&shares)?;

    let mut order: Vec<usize> = (0..exact.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = exact[a] - exact[a].floor();
        let fb = exact[b] - exact[b].floor();
        fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
    });
    for index in order.into_iter().cycle().take(exact.len() * 2) {
        if leftover <= 0 {
            break;
        }
        shares[index] += 1;
        leftover -= 1;
    }

    Ok(shares)
}

/// Amounts for the fixed method: the per-job override for the investor,
/// else the investment's own fixed amount.
pub fn allocate_fixed(
    total_cents: i64,
    investments: &[Investment],
    overrides: &BTreeMap<String, f64>,
) -> WorkerResult<Vec<i64>> {
    if investments.is_empty() {
        return Err(WorkerError::business_rule("property has no investments"));
    }

    let mut shares = Vec::with_capacity(investments.len());
    for investment in investments {
        let amount = overrides
            .get(&investment.investor_id)
            .copied()
            .or(investment.fixed_amount)
            .ok_or_else(|| {
                WorkerError::business_rule(format!(
                    "no fixed amount for investor {}",
                    investment.investor_id
                ))
            })?;
        shares.push(to_cents(amount)?);
    }

    let sum = sum_cents(&shares)?;
    if sum > total_cents {
        return Err(WorkerError::business_rule(format!(
            "fixed amounts ({} cents) exceed total ({} cents)",
            sum, total_cents
        )));
    }
    Ok(shares)
}
