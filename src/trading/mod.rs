//! Replication core: diffing, reconciliation, risk exits, and order tracking.

mod config;
mod diff;
pub mod market_hours;
mod order_book;
mod reconciler;
mod risk;

pub use config::{
    parse_fx, parse_portfolios, CapitalAllocation, Portfolio, ReconcilePolicy, RiskThresholds,
    TradingConfig,
};
pub use diff::diff;
pub use order_book::{OrderBook, OrderBookConfig};
pub use reconciler::{apply_precedence, Reconciler};
pub use risk::{RiskManager, TrackedInstrument};
