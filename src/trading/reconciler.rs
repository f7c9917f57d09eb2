//! Position reconciler: turns reference changes plus live brokerage state into
//! order intents.
//!
//! For each change the reconciler computes the live weight of the instrument
//! within the portfolio's trade capital and compares it to the reference
//! weight. Drifts inside the dead-band are left alone; anything larger is
//! sized to the whole-share target quantity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{bounded, BrokerGateway};
use crate::models::{Change, ChangeKind, OrderIntent};

use super::config::TradingConfig;

/// Live figures the sizing rules operate on.
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub trade_capital: Decimal,
    pub live_qty: i64,
    pub price: Decimal,
}

impl Sizing {
    /// Live holding as a fraction of trade capital.
    pub fn current_ratio(&self) -> Decimal {
        Decimal::from(self.live_qty) * self.price / self.trade_capital
    }

    /// Whole shares needed to reach `target` (a fraction of trade capital).
    pub fn target_qty(&self, target: Decimal) -> i64 {
        (self.trade_capital * target / self.price)
            .floor()
            .to_i64()
            .unwrap_or(0)
    }
}

/// Decide the order (if any) that moves one instrument toward its target.
pub fn plan(change: &Change, sizing: Sizing, dead_band: Decimal) -> Option<OrderIntent> {
    if sizing.trade_capital <= Decimal::ZERO || sizing.price <= Decimal::ZERO {
        return None;
    }
    let symbol = change.record()?.symbol();
    let target = change.target_fraction();

    let drift = (sizing.current_ratio() - target).abs();
    if drift < dead_band {
        debug!(symbol = %symbol, drift = %drift, "Inside dead-band, no order");
        return None;
    }

    let target_qty = sizing.target_qty(target);
    let delta = target_qty - sizing.live_qty;

    match change.kind {
        ChangeKind::Open if target_qty > 0 && sizing.live_qty == 0 => {
            Some(OrderIntent::buy(symbol, target_qty, sizing.price))
        }
        ChangeKind::Close if sizing.live_qty > 0 => {
            Some(OrderIntent::sell(symbol, sizing.live_qty, sizing.price))
        }
        ChangeKind::Buy if delta > 0 => Some(OrderIntent::buy(symbol, delta, sizing.price)),
        ChangeKind::Sell if delta < 0 => Some(OrderIntent::sell(symbol, -delta, sizing.price)),
        _ => None,
    }
}

/// Drop reconciliation intents for instruments a risk exit already covers.
pub fn apply_precedence(intents: Vec<OrderIntent>, liquidated: &HashSet<String>) -> Vec<OrderIntent> {
    intents
        .into_iter()
        .filter(|intent| {
            let keep = !liquidated.contains(&intent.symbol);
            if !keep {
                info!(symbol = %intent.symbol, "Risk exit in progress, skipping rebalance");
            }
            keep
        })
        .collect()
}

pub struct Reconciler {
    gateway: Arc<dyn BrokerGateway>,
    config: TradingConfig,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn BrokerGateway>, config: TradingConfig, call_timeout: Duration) -> Self {
        Self {
            gateway,
            config,
            call_timeout,
        }
    }

    /// Build intents for one portfolio's changes.
    pub async fn reconcile(&self, allocation: Decimal, changes: &[Change]) -> Result<Vec<OrderIntent>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let holdings: HashMap<String, i64> =
            bounded(self.call_timeout, "Positions request", self.gateway.positions())
                .await?
                .into_iter()
                .map(|p| (p.symbol, p.quantity))
                .collect();

        let symbols: Vec<String> = changes
            .iter()
            .filter_map(|c| c.record().map(|r| r.symbol()))
            .collect();
        let quotes = match bounded(self.call_timeout, "Quote batch", self.gateway.quotes(&symbols)).await {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "Quote batch failed, using reference prices");
                HashMap::new()
            }
        };

        let mut intents = Vec::new();
        for change in changes {
            let Some(record) = change.record() else {
                continue;
            };
            let symbol = record.symbol();

            let price = match quotes.get(&symbol) {
                Some(p) => *p,
                None => {
                    debug!(symbol = %symbol, "No live quote, using reference price");
                    record.current_price
                }
            }
            .round_dp(2);

            let sizing = Sizing {
                trade_capital: self.config.trade_capital(allocation, record.market),
                live_qty: holdings.get(&symbol).copied().unwrap_or(0),
                price,
            };

            match plan(change, sizing, self.config.dead_band) {
                Some(intent) => {
                    info!(
                        change = %change.kind.as_str(),
                        symbol = %intent.symbol,
                        side = %intent.side,
                        quantity = intent.quantity,
                        price = %intent.limit_price,
                        "Reconciliation intent"
                    );
                    intents.push(intent);
                }
                None => debug!(symbol = %symbol, kind = %change.kind.as_str(), "No order needed"),
            }
        }

        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::models::{Market, OrderSide, PositionRecord};
    use rust_decimal_macros::dec;

    fn record(code: &str, ratio: Decimal, price: Decimal) -> PositionRecord {
        PositionRecord {
            instrument_code: code.to_string(),
            instrument_name: code.to_string(),
            market: Market::Us,
            total_ratio: ratio,
            current_price: price,
            cost_price: price,
        }
    }

    fn buy_change(from: Decimal, to: Decimal) -> Change {
        Change::between(
            Some(record("X", from, dec!(100))),
            Some(record("X", to, dec!(100))),
        )
        .unwrap()
    }

    #[test]
    fn test_dead_band_suppresses_small_drift() {
        let change = buy_change(dec!(10), dec!(20));
        // 16 shares at 100 on 10,000 capital is 16%
        let sizing = Sizing {
            trade_capital: dec!(10000),
            live_qty: 16,
            price: dec!(100),
        };
        assert!(plan(&change, sizing, dec!(0.05)).is_none());
    }

    #[test]
    fn test_drift_past_dead_band_buys_shortfall() {
        let change = buy_change(dec!(10), dec!(20));
        let sizing = Sizing {
            trade_capital: dec!(10000),
            live_qty: 14,
            price: dec!(100),
        };
        let intent = plan(&change, sizing, dec!(0.05)).unwrap();
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.quantity, 6);
        assert_eq!(intent.symbol, "X.US");
    }

    #[test]
    fn test_open_requires_flat_position() {
        let change = Change::between(None, Some(record("Y", dec!(15), dec!(50)))).unwrap();
        let flat = Sizing {
            trade_capital: dec!(10000),
            live_qty: 0,
            price: dec!(50),
        };
        assert_eq!(plan(&change, flat, dec!(0.05)).unwrap().quantity, 30);

        let held = Sizing { live_qty: 2, ..flat };
        assert!(plan(&change, held, dec!(0.05)).is_none());
    }

    #[test]
    fn test_sell_only_when_over_target() {
        let change = Change::between(
            Some(record("X", dec!(30), dec!(100))),
            Some(record("X", dec!(10), dec!(100))),
        )
        .unwrap();
        let sizing = Sizing {
            trade_capital: dec!(10000),
            live_qty: 30,
            price: dec!(100),
        };
        let intent = plan(&change, sizing, dec!(0.05)).unwrap();
        assert_eq!(intent.side, OrderSide::Sell);
        assert_eq!(intent.quantity, 20);
    }

    #[test]
    fn test_zero_price_yields_nothing() {
        let change = buy_change(dec!(10), dec!(20));
        let sizing = Sizing {
            trade_capital: dec!(10000),
            live_qty: 0,
            price: Decimal::ZERO,
        };
        assert!(plan(&change, sizing, dec!(0.05)).is_none());
    }

    #[test]
    fn test_precedence_drops_liquidated_symbols() {
        let intents = vec![
            OrderIntent::buy("X.US", 5, dec!(10)),
            OrderIntent::buy("Y.US", 5, dec!(10)),
        ];
        let liquidated = HashSet::from(["X.US".to_string()]);
        let kept = apply_precedence(intents, &liquidated);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].symbol, "Y.US");
    }

    #[tokio::test]
    async fn test_close_and_open_end_to_end() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("X.US", 40, dec!(25)).await;
        broker.set_price("X.US", dec!(30)).await;
        broker.set_price("Y.US", dec!(50)).await;

        let changes = vec![
            Change::between(Some(record("X", dec!(10), dec!(30))), None).unwrap(),
            Change::between(None, Some(record("Y", dec!(15), dec!(50)))).unwrap(),
        ];

        let reconciler = Reconciler::new(broker, TradingConfig::default(), Duration::from_secs(1));
        let intents = reconciler.reconcile(dec!(10000), &changes).await.unwrap();

        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0], OrderIntent::sell("X.US", 40, dec!(30)));
        assert_eq!(intents[1], OrderIntent::buy("Y.US", 30, dec!(50)));
    }

    #[tokio::test]
    async fn test_quote_failure_falls_back_to_reference_price() {
        let broker = Arc::new(PaperBroker::new());
        broker.fail_quotes_for("Y.US").await;

        let changes = vec![Change::between(None, Some(record("Y", dec!(15), dec!(50.004)))).unwrap()];
        let reconciler = Reconciler::new(broker, TradingConfig::default(), Duration::from_secs(1));
        let intents = reconciler.reconcile(dec!(10000), &changes).await.unwrap();

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].limit_price, dec!(50.00));
        assert_eq!(intents[0].quantity, 30);
    }

    #[tokio::test]
    async fn test_hk_capital_uses_multiplier() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_price("700.HK", dec!(300)).await;

        let mut r = record("700", dec!(10), dec!(300));
        r.market = Market::Hk;
        let changes = vec![Change::between(None, Some(r)).unwrap()];

        let reconciler = Reconciler::new(broker, TradingConfig::default(), Duration::from_secs(1));
        let intents = reconciler.reconcile(dec!(10000), &changes).await.unwrap();

        // 10,000 * 7.85 * 0.10 / 300 = 26.16
        assert_eq!(intents[0].quantity, 26);
    }
}
