//! Stop-loss / take-profit scanning over live brokerage positions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::api::{bounded, BrokerGateway, BrokerPosition};
use crate::models::{OrderIntent, Urgency};

use super::config::RiskThresholds;

/// Why a position is being force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskTrigger {
    StopLoss,
    TakeProfit,
}

impl RiskTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTrigger::StopLoss => "stop-loss",
            RiskTrigger::TakeProfit => "take-profit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskVerdict {
    pub trigger: RiskTrigger,
    pub pnl_ratio: Decimal,
    pub pnl_abs: Decimal,
}

/// Risk context for an instrument some tracked portfolio holds.
#[derive(Debug, Clone)]
pub struct TrackedInstrument {
    pub trade_capital: Decimal,
    /// Reference feed price, used when the live quote is unavailable
    pub reference_price: Decimal,
}

/// A liquidation the risk manager wants placed.
#[derive(Debug, Clone)]
pub struct RiskExit {
    pub intent: OrderIntent,
    pub verdict: RiskVerdict,
}

pub struct RiskManager {
    gateway: Arc<dyn BrokerGateway>,
    thresholds: RiskThresholds,
    call_timeout: Duration,
}

impl RiskManager {
    pub fn new(gateway: Arc<dyn BrokerGateway>, thresholds: RiskThresholds, call_timeout: Duration) -> Self {
        Self {
            gateway,
            thresholds,
            call_timeout,
        }
    }

    /// Check one position against the limits.
    pub fn evaluate(
        &self,
        position: &BrokerPosition,
        price: Decimal,
        trade_capital: Decimal,
    ) -> Option<RiskVerdict> {
        let cost = position.cost_price;
        if cost <= Decimal::ZERO || price <= Decimal::ZERO || position.quantity <= 0 {
            return None;
        }

        let pnl_ratio = (price - cost) / cost;
        let pnl_abs = (price - cost) * Decimal::from(position.quantity);
        let capital_share = if trade_capital > Decimal::ZERO {
            pnl_abs.abs() / trade_capital
        } else {
            Decimal::ZERO
        };

        let t = &self.thresholds;
        let trigger = if pnl_abs < Decimal::ZERO
            && (pnl_ratio <= -t.loss_ratio_limit || capital_share > t.loss_abs_fraction_of_capital)
        {
            RiskTrigger::StopLoss
        } else if pnl_abs > Decimal::ZERO
            && (pnl_ratio >= t.profit_ratio_limit || capital_share > t.profit_abs_fraction_of_capital)
        {
            RiskTrigger::TakeProfit
        } else {
            return None;
        };

        Some(RiskVerdict {
            trigger,
            pnl_ratio,
            pnl_abs,
        })
    }

    /// Scan live positions in tracked instruments and return forced exits.
    pub async fn scan(&self, universe: &HashMap<String, TrackedInstrument>) -> Result<Vec<RiskExit>> {
        let positions: Vec<BrokerPosition> =
            bounded(self.call_timeout, "Positions request", self.gateway.positions())
                .await?
                .into_iter()
                .filter(|p| universe.contains_key(&p.symbol))
                .collect();

        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        let quotes = match bounded(self.call_timeout, "Quote batch", self.gateway.quotes(&symbols)).await {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "Quote batch failed, using reference prices");
                HashMap::new()
            }
        };

        let mut exits = Vec::new();
        for position in &positions {
            let Some(tracked) = universe.get(&position.symbol) else {
                continue;
            };
            if position.sellable_quantity <= 0 {
                debug!(symbol = %position.symbol, "Nothing sellable, skipping risk check");
                continue;
            }

            let price = quotes
                .get(&position.symbol)
                .copied()
                .unwrap_or(tracked.reference_price)
                .round_dp(2);

            if let Some(verdict) = self.evaluate(position, price, tracked.trade_capital) {
                warn!(
                    symbol = %position.symbol,
                    trigger = verdict.trigger.as_str(),
                    pnl_ratio = %verdict.pnl_ratio.round_dp(4),
                    pnl = %verdict.pnl_abs.round_dp(2),
                    quantity = position.sellable_quantity,
                    "Risk limit breached, liquidating"
                );
                let intent = OrderIntent::sell(&position.symbol, position.sellable_quantity, price)
                    .with_urgency(Urgency::Immediate);
                exits.push(RiskExit { intent, verdict });
            }
        }

        Ok(exits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::models::{Change, Market, OrderSide, PositionRecord};
    use crate::trading::config::TradingConfig;
    use crate::trading::reconciler::{apply_precedence, Reconciler};
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn manager(gateway: Arc<dyn BrokerGateway>) -> RiskManager {
        RiskManager::new(gateway, RiskThresholds::default(), Duration::from_secs(1))
    }

    fn position(qty: i64, cost: Decimal) -> BrokerPosition {
        BrokerPosition {
            symbol: "X.US".into(),
            quantity: qty,
            sellable_quantity: qty,
            cost_price: cost,
        }
    }

    fn tracked(capital: Decimal, price: Decimal) -> HashMap<String, TrackedInstrument> {
        HashMap::from([(
            "X.US".to_string(),
            TrackedInstrument {
                trade_capital: capital,
                reference_price: price,
            },
        )])
    }

    #[test]
    fn test_ratio_limits() {
        let risk = manager(Arc::new(PaperBroker::new()));
        // Huge capital so only the ratio tests matter
        let capital = dec!(100000000);

        let loss = risk.evaluate(&position(10, dec!(100)), dec!(90), capital).unwrap();
        assert_eq!(loss.trigger, RiskTrigger::StopLoss);
        assert_eq!(loss.pnl_ratio, dec!(-0.1));
        assert!(risk.evaluate(&position(10, dec!(100)), dec!(91), capital).is_none());

        let gain = risk.evaluate(&position(10, dec!(100)), dec!(120), capital).unwrap();
        assert_eq!(gain.trigger, RiskTrigger::TakeProfit);
        assert!(risk.evaluate(&position(10, dec!(100)), dec!(119), capital).is_none());
    }

    #[test]
    fn test_absolute_limits() {
        let risk = manager(Arc::new(PaperBroker::new()));
        // 2% price drop on 100 shares = 200 loss, 2% of 10,000 capital
        let v = risk.evaluate(&position(100, dec!(100)), dec!(98), dec!(10000)).unwrap();
        assert_eq!(v.trigger, RiskTrigger::StopLoss);
        assert_eq!(v.pnl_abs, dec!(-200));

        // 300 gain is 3% of capital, under the 4% profit limit
        assert!(risk.evaluate(&position(100, dec!(100)), dec!(103), dec!(10000)).is_none());
        // 500 gain is 5%
        let v = risk.evaluate(&position(100, dec!(100)), dec!(105), dec!(10000)).unwrap();
        assert_eq!(v.trigger, RiskTrigger::TakeProfit);
    }

    #[test]
    fn test_missing_prices_skip() {
        let risk = manager(Arc::new(PaperBroker::new()));
        assert!(risk.evaluate(&position(10, Decimal::ZERO), dec!(50), dec!(1000)).is_none());
        assert!(risk.evaluate(&position(10, dec!(50)), Decimal::ZERO, dec!(1000)).is_none());
    }

    #[tokio::test]
    async fn test_scan_ignores_untracked_positions() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("X.US", 10, dec!(100)).await;
        broker.set_position("OTHER.US", 10, dec!(100)).await;
        broker.set_price("X.US", dec!(80)).await;
        broker.set_price("OTHER.US", dec!(10)).await;

        let exits = manager(broker).scan(&tracked(dec!(1000000), dec!(80))).await.unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].intent.symbol, "X.US");
        assert_eq!(exits[0].intent.urgency, Urgency::Immediate);
        assert_eq!(exits[0].intent.quantity, 10);
    }

    #[tokio::test]
    async fn test_liquidation_overrides_rebalance() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("X.US", 10, dec!(100)).await;
        broker.set_price("X.US", dec!(85)).await;

        let record = |ratio| PositionRecord {
            instrument_code: "X".into(),
            instrument_name: "X".into(),
            market: Market::Us,
            total_ratio: ratio,
            current_price: dec!(85),
            cost_price: dec!(100),
        };
        let change = Change::between(Some(record(dec!(5))), Some(record(dec!(20)))).unwrap();

        let reconciler = Reconciler::new(broker.clone(), TradingConfig::default(), Duration::from_secs(1));
        let rebalance = reconciler.reconcile(dec!(10000), &[change]).await.unwrap();
        assert_eq!(rebalance.len(), 1);
        assert_eq!(rebalance[0].side, OrderSide::Buy);

        let exits = manager(broker).scan(&tracked(dec!(10000), dec!(85))).await.unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].verdict.trigger, RiskTrigger::StopLoss);

        let liquidated: HashSet<String> = exits.iter().map(|e| e.intent.symbol.clone()).collect();
        assert!(apply_precedence(rebalance, &liquidated).is_empty());
    }
}
