//! Order intents and the live orders tracked by the order book.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently an intent must be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Forced exit, placed as a marketable limit
    Immediate,
    /// Rebalance, placed at the live price
    Normal,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Immediate => "immediate",
            Urgency::Normal => "normal",
        }
    }
}

/// A single order the engine wants placed. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    /// Brokerage symbol (`700.HK`, `AAPL.US`)
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: Decimal,
    pub urgency: Urgency,
}

impl OrderIntent {
    pub fn buy(symbol: impl Into<String>, quantity: i64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            quantity,
            limit_price: price,
            urgency: Urgency::Normal,
        }
    }

    pub fn sell(symbol: impl Into<String>, quantity: i64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Sell,
            quantity,
            limit_price: price,
            urgency: Urgency::Normal,
        }
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn notional(&self) -> Decimal {
        Decimal::from(self.quantity) * self.limit_price
    }
}

/// Broker-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartialFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "New",
            OrderStatus::PartialFilled => "PartialFilled",
            OrderStatus::Filled => "Filled",
            OrderStatus::Canceled => "Canceled",
            OrderStatus::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order the broker has accepted and that is not yet terminal.
#[derive(Debug, Clone)]
pub struct LiveOrder {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartialFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_intent_notional() {
        let intent = OrderIntent::buy("AAPL.US", 30, dec!(50));
        assert_eq!(intent.notional(), dec!(1500));
        assert_eq!(intent.urgency, Urgency::Normal);
        assert_eq!(
            intent.with_urgency(Urgency::Immediate).urgency,
            Urgency::Immediate
        );
    }
}
