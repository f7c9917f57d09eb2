//! Trading configuration: risk limits, per-market capital multipliers,
//! thresholds, and the capital partition across tracked portfolios.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Market;

/// Stop-loss / take-profit limits. Read-only at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Liquidate when the position has lost this fraction of its cost
    pub loss_ratio_limit: Decimal,

    /// Liquidate when the position has gained this fraction of its cost
    pub profit_ratio_limit: Decimal,

    /// Liquidate when the absolute loss exceeds this fraction of trade capital
    pub loss_abs_fraction_of_capital: Decimal,

    /// Liquidate when the absolute gain exceeds this fraction of trade capital
    pub profit_abs_fraction_of_capital: Decimal,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            loss_ratio_limit: dec!(0.10),
            profit_ratio_limit: dec!(0.20),
            loss_abs_fraction_of_capital: dec!(0.01),
            profit_abs_fraction_of_capital: dec!(0.04),
        }
    }
}

/// How detected changes are acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// Move live holdings toward the reference weights
    #[default]
    TargetWeight,
    /// Report changes without trading
    NotifyOnly,
}

impl ReconcilePolicy {
    pub fn trades(&self) -> bool {
        matches!(self, ReconcilePolicy::TargetWeight)
    }
}

/// Configuration for reconciliation and risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub risk: RiskThresholds,

    /// Capital multiplier per non-base market (e.g. HK -> 7.85)
    pub fx: HashMap<Market, Decimal>,

    /// Minimum ratio move, in percentage points, for a change to count
    pub noise_threshold: Decimal,

    /// Drift tolerance (fraction of trade capital) inside which no order is placed
    pub dead_band: Decimal,

    /// Discount applied to immediate sells so they cross the spread
    pub slippage: Decimal,

    pub policy: ReconcilePolicy,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            risk: RiskThresholds::default(),
            fx: HashMap::from([(Market::Hk, dec!(7.85))]),
            noise_threshold: dec!(1),
            dead_band: dec!(0.05),
            slippage: dec!(0.005),
            policy: ReconcilePolicy::TargetWeight,
        }
    }
}

impl TradingConfig {
    pub fn fx_multiplier(&self, market: Market) -> Decimal {
        self.fx.get(&market).copied().unwrap_or(Decimal::ONE)
    }

    /// Capital available to trade in `market` for a portfolio allocation.
    pub fn trade_capital(&self, allocation: Decimal, market: Market) -> Decimal {
        allocation * self.fx_multiplier(market)
    }
}

fn parse_market(s: &str) -> Result<Market> {
    match s.trim().to_uppercase().as_str() {
        "HK" => Ok(Market::Hk),
        "US" => Ok(Market::Us),
        other => bail!("Unknown market '{}'", other),
    }
}

/// Parse `HK|7.85,US|1` into per-market multipliers.
pub fn parse_fx(list: &str) -> Result<HashMap<Market, Decimal>> {
    pairs(list)?
        .into_iter()
        .map(|(market, value)| {
            let rate: Decimal = value
                .parse()
                .with_context(|| format!("Invalid multiplier for {}: '{}'", market, value))?;
            if rate <= Decimal::ZERO {
                bail!("Multiplier for {} must be positive", market);
            }
            Ok((parse_market(&market)?, rate))
        })
        .collect()
}

/// A tracked reference portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
}

/// Parse `id|name,id|name`. A bare id is its own name.
pub fn parse_portfolios(list: &str) -> Result<Vec<Portfolio>> {
    let mut portfolios: Vec<Portfolio> = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, name) = item.split_once('|').unwrap_or((item, item));
        let id = id.trim();
        if id.is_empty() {
            bail!("Empty portfolio id in '{}'", item);
        }
        if portfolios.iter().any(|p| p.id == id) {
            bail!("Portfolio {} listed twice", id);
        }
        portfolios.push(Portfolio {
            id: id.to_string(),
            name: name.trim().to_string(),
        });
    }
    Ok(portfolios)
}

fn pairs(list: &str) -> Result<Vec<(String, String)>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            item.split_once('|')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("Expected 'key|value', got '{}'", item))
        })
        .collect()
}

/// Fixed partition of account capital across tracked portfolios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalAllocation {
    amounts: HashMap<String, Decimal>,
    total: Decimal,
}

impl CapitalAllocation {
    /// Resolve allocations from `id|amount` pairs. Portfolios without an explicit
    /// amount share the unallocated remainder equally.
    pub fn resolve(portfolios: &[Portfolio], explicit: &str, total: Decimal) -> Result<Self> {
        if total <= Decimal::ZERO {
            bail!("Total capital must be positive, got {}", total);
        }

        let mut amounts = HashMap::new();
        for (id, value) in pairs(explicit)? {
            if !portfolios.iter().any(|p| p.id == id) {
                bail!("Allocation given for untracked portfolio {}", id);
            }
            let amount: Decimal = value
                .parse()
                .with_context(|| format!("Invalid allocation for {}: '{}'", id, value))?;
            if amount < Decimal::ZERO {
                bail!("Allocation for {} is negative", id);
            }
            amounts.insert(id, amount);
        }

        let allocated: Decimal = amounts.values().copied().sum();
        if allocated > total {
            bail!(
                "Allocations sum to {} which exceeds total capital {}",
                allocated,
                total
            );
        }

        let unassigned: Vec<&Portfolio> = portfolios
            .iter()
            .filter(|p| !amounts.contains_key(&p.id))
            .collect();
        if !unassigned.is_empty() {
            // Truncated so the shares never sum past the total
            let share = ((total - allocated) / Decimal::from(unassigned.len()))
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
            for p in unassigned {
                amounts.insert(p.id.clone(), share);
            }
        }

        Ok(Self { amounts, total })
    }

    /// Capital allocated to a portfolio (zero if unknown).
    pub fn get(&self, portfolio_id: &str) -> Decimal {
        self.amounts.get(portfolio_id).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn allocated(&self) -> Decimal {
        self.amounts.values().copied().sum()
    }
}
