//! A detected change between two snapshots of the same portfolio.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::record::PositionRecord;

/// How an instrument's weight moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Open,
    Close,
    Buy,
    Sell,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Open => "OPEN",
            ChangeKind::Close => "CLOSE",
            ChangeKind::Buy => "BUY",
            ChangeKind::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub old: Option<PositionRecord>,
    pub new: Option<PositionRecord>,
    pub kind: ChangeKind,
}

impl Change {
    /// Classify a transition. Returns `None` when both sides are absent.
    pub fn between(old: Option<PositionRecord>, new: Option<PositionRecord>) -> Option<Self> {
        let kind = match (&old, &new) {
            (None, None) => return None,
            (None, Some(_)) => ChangeKind::Open,
            (Some(_), None) => ChangeKind::Close,
            (Some(o), Some(n)) => {
                if n.total_ratio > o.total_ratio {
                    ChangeKind::Buy
                } else {
                    ChangeKind::Sell
                }
            }
        };
        Some(Self { old, new, kind })
    }

    /// The record describing the instrument (new side preferred).
    pub fn record(&self) -> Option<&PositionRecord> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn old_ratio(&self) -> Decimal {
        self.old.as_ref().map(|r| r.total_ratio).unwrap_or(Decimal::ZERO)
    }

    pub fn new_ratio(&self) -> Decimal {
        self.new.as_ref().map(|r| r.total_ratio).unwrap_or(Decimal::ZERO)
    }

    /// Target weight as a fraction of capital (0 for closes).
    pub fn target_fraction(&self) -> Decimal {
        self.new_ratio() / Decimal::ONE_HUNDRED
    }

    /// One-line human summary used in change reports.
    pub fn summary(&self) -> String {
        let Some(r) = self.record() else {
            return self.kind.as_str().to_string();
        };
        format!(
            "{} {} {}: {:.2}% -> {:.2}% @ {:.3}",
            self.kind.as_str(),
            r.instrument_name,
            r.symbol(),
            self.old_ratio(),
            self.new_ratio(),
            r.current_price
        )
    }
}
