//! Reference-portfolio holdings and the snapshots they are captured into.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Exchange an instrument is listed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Hk,
    #[default]
    Us,
    Unknown,
}

impl Market {
    /// Map the feed's numeric market code.
    pub fn from_feed_code(code: i64) -> Self {
        match code {
            1 => Market::Hk,
            2 => Market::Us,
            _ => Market::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Hk => "HK",
            Market::Us => "US",
            Market::Unknown => "",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One holding of the reference portfolio, already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Exchange-local code (e.g. "700", "AAPL")
    pub instrument_code: String,

    /// Display name reported by the feed
    #[serde(default)]
    pub instrument_name: String,

    pub market: Market,

    /// Percent of the market's tracked universe (0-100)
    pub total_ratio: Decimal,

    /// Last price reported by the feed
    pub current_price: Decimal,

    /// Reference portfolio's average cost
    pub cost_price: Decimal,
}

impl PositionRecord {
    /// Brokerage symbol, `<code>.<MARKET>`.
    pub fn symbol(&self) -> String {
        symbol_for(&self.instrument_code, self.market)
    }

    /// Target weight as a fraction of capital.
    pub fn target_fraction(&self) -> Decimal {
        self.total_ratio / Decimal::ONE_HUNDRED
    }
}

/// Build the brokerage symbol for a code listed on `market`.
pub fn symbol_for(code: &str, market: Market) -> String {
    match market {
        Market::Unknown => code.to_string(),
        m => format!("{}.{}", code, m),
    }
}

/// Point-in-time capture of a reference portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub portfolio_id: String,
    pub captured_at: DateTime<Utc>,
    pub record_items: Vec<PositionRecord>,
}

impl Snapshot {
    /// Build a snapshot, keeping the first record for each instrument code.
    pub fn new(portfolio_id: impl Into<String>, records: Vec<PositionRecord>) -> Self {
        let portfolio_id = portfolio_id.into();
        let mut seen = HashSet::new();
        let mut record_items = Vec::with_capacity(records.len());

        for record in records {
            if seen.insert(record.instrument_code.clone()) {
                record_items.push(record);
            } else {
                warn!(
                    portfolio = %portfolio_id,
                    code = %record.instrument_code,
                    "Duplicate instrument in snapshot, dropping"
                );
            }
        }

        Self {
            portfolio_id,
            captured_at: Utc::now(),
            record_items,
        }
    }

    pub fn get(&self, code: &str) -> Option<&PositionRecord> {
        self.record_items.iter().find(|r| r.instrument_code == code)
    }

    /// Markets this snapshot holds instruments in.
    pub fn markets(&self) -> HashSet<Market> {
        self.record_items.iter().map(|r| r.market).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.record_items.is_empty()
    }
}
