//! In-memory brokerage account used for dry runs.
//!
//! Orders rest as `New` until their status is looked up; with auto-fill
//! enabled that lookup fills them at the limit price and updates holdings.

use std::collections::HashMap;
#[cfg(test)]
use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::{LiveOrder, OrderSide, OrderStatus};

use super::broker::{BrokerGateway, BrokerPosition};

/// An order resting in the paper account.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: Decimal,
    pub status: OrderStatus,
}

#[derive(Default)]
struct PaperState {
    positions: HashMap<String, BrokerPosition>,
    prices: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
    #[cfg(test)]
    faults: Faults,
}

/// Injected failures for exercising retry and isolation paths.
#[cfg(test)]
#[derive(Default)]
struct Faults {
    failing_submits: u32,
    failing_quotes: HashSet<String>,
    failing_lookups: HashSet<String>,
    submit_attempts: u32,
}

/// Simulated brokerage account.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    auto_fill: bool,
}

impl PaperBroker {
    /// Paper account that fills orders on their first status lookup.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            auto_fill: true,
        }
    }
}

#[cfg(test)]
impl PaperBroker {
    /// Paper account whose orders only move when told to.
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            auto_fill: false,
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn set_position(&self, symbol: &str, quantity: i64, cost_price: Decimal) {
        self.state.lock().await.positions.insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                quantity,
                sellable_quantity: quantity,
                cost_price,
            },
        );
    }

    /// Make the next `n` submissions fail.
    pub async fn fail_next_submits(&self, n: u32) {
        self.state.lock().await.faults.failing_submits = n;
    }

    pub async fn fail_quotes_for(&self, symbol: &str) {
        self.state.lock().await.faults.failing_quotes.insert(symbol.to_string());
    }

    pub async fn fail_lookups_for(&self, order_id: &str) {
        self.state.lock().await.faults.failing_lookups.insert(order_id.to_string());
    }

    /// Force an order into `status` without touching holdings.
    pub async fn set_order_status(&self, order_id: &str, status: OrderStatus) {
        if let Some(order) = self.state.lock().await.orders.get_mut(order_id) {
            order.status = status;
        }
    }

    pub async fn orders(&self) -> Vec<PaperOrder> {
        self.state.lock().await.orders.values().cloned().collect()
    }

    pub async fn open_orders_for(&self, symbol: &str) -> Vec<PaperOrder> {
        self.state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn submit_attempts(&self) -> u32 {
        self.state.lock().await.faults.submit_attempts
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperState {
    fn apply_fill(&mut self, order: &PaperOrder) {
        let pos = self
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                symbol: order.symbol.clone(),
                quantity: 0,
                sellable_quantity: 0,
                cost_price: Decimal::ZERO,
            });

        match order.side {
            OrderSide::Buy => {
                let held_cost = Decimal::from(pos.quantity) * pos.cost_price;
                let new_qty = pos.quantity + order.quantity;
                if new_qty > 0 {
                    pos.cost_price =
                        (held_cost + Decimal::from(order.quantity) * order.price) / Decimal::from(new_qty);
                }
                pos.quantity = new_qty;
                pos.sellable_quantity += order.quantity;
            }
            OrderSide::Sell => {
                pos.quantity = (pos.quantity - order.quantity).max(0);
                pos.sellable_quantity = (pos.sellable_quantity - order.quantity).max(0);
            }
        }

        if pos.quantity == 0 {
            self.positions.remove(&order.symbol);
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.state.lock().await.positions.values().cloned().collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Decimal> {
        let state = self.state.lock().await;
        #[cfg(test)]
        if state.faults.failing_quotes.contains(symbol) {
            bail!("Quote unavailable for {}", symbol);
        }
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("No quote for {}", symbol))
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        price: Decimal,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        {
            state.faults.submit_attempts += 1;
            if state.faults.failing_submits > 0 {
                state.faults.failing_submits -= 1;
                bail!("Paper broker rejected submission for {}", symbol);
            }
        }
        if quantity <= 0 {
            bail!("Invalid quantity {} for {}", quantity, symbol);
        }

        let id = uuid::Uuid::new_v4().to_string();
        state.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                symbol: symbol.to_string(),
                side,
                quantity,
                price,
                status: OrderStatus::New,
            },
        );

        info!(order_id = %id, symbol = %symbol, side = %side, quantity, price = %price, "[PAPER] Order accepted");
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("Unknown order {}", order_id))?;

        if !order.status.is_terminal() {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        if state.faults.failing_lookups.contains(order_id) {
            bail!("Order lookup failed for {}", order_id);
        }

        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown order {}", order_id))?;

        if self.auto_fill && !order.status.is_terminal() {
            state.apply_fill(&order);
            if let Some(o) = state.orders.get_mut(order_id) {
                o.status = OrderStatus::Filled;
            }
            return Ok(OrderStatus::Filled);
        }

        Ok(order.status)
    }

    async fn open_orders(&self) -> Result<Vec<LiveOrder>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| LiveOrder {
                broker_order_id: o.id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                quantity: o.quantity,
                status: o.status,
                submitted_at: Utc::now(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_auto_fill_updates_positions() {
        let broker = PaperBroker::new();
        broker.set_position("AAPL.US", 10, dec!(100)).await;

        let id = broker
            .submit_order("AAPL.US", OrderSide::Buy, 10, dec!(120))
            .await
            .unwrap();
        assert_eq!(broker.order_status(&id).await.unwrap(), OrderStatus::Filled);

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].quantity, 20);
        assert_eq!(positions[0].cost_price, dec!(110));
    }

    #[tokio::test]
    async fn test_sell_all_removes_position() {
        let broker = PaperBroker::new();
        broker.set_position("700.HK", 100, dec!(300)).await;

        let id = broker
            .submit_order("700.HK", OrderSide::Sell, 100, dec!(320))
            .await
            .unwrap();
        broker.order_status(&id).await.unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_orders_stay_open_until_canceled() {
        let broker = PaperBroker::manual();
        let id = broker
            .submit_order("AAPL.US", OrderSide::Buy, 1, dec!(1))
            .await
            .unwrap();
        assert_eq!(broker.order_status(&id).await.unwrap(), OrderStatus::New);
        assert_eq!(broker.open_orders().await.unwrap().len(), 1);

        broker.cancel_order(&id).await.unwrap();
        assert_eq!(broker.order_status(&id).await.unwrap(), OrderStatus::Canceled);
        assert!(broker.open_orders_for("AAPL.US").await.is_empty());
    }
}
