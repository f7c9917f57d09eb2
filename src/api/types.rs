//! Wire types for the reference feed and the HTTP brokerage gateway.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{OrderSide, OrderStatus};

/// Envelope returned by the reference feed. `data` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEnvelope {
    pub data: Option<FeedData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedData {
    #[serde(default)]
    pub record_items: Vec<FeedRecord>,
    #[serde(default)]
    pub market_items: Vec<FeedMarket>,
}

/// Raw holding as reported by the feed (prices in nano-units).
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    pub stock_code: String,
    #[serde(default)]
    pub stock_name: String,
    #[serde(default)]
    pub market: i64,
    #[serde(default)]
    pub total_ratio: Decimal,
    pub current_price: Option<Decimal>,
    pub cost_price: Option<Decimal>,
}

/// Aggregate ratio of one market inside the reference portfolio.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedMarket {
    pub market: i64,
    pub ratio: Decimal,
}

/// Position row from `GET /positions`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PositionResponse {
    pub symbol: String,
    pub quantity: i64,
    #[serde(default)]
    pub available_quantity: i64,
    pub cost_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteResponse {
    pub symbol: String,
    pub last_done: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: String,
    pub order_type: &'static str,
    pub time_in_force: &'static str,
    pub remark: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOrderResponse {
    pub order_id: String,
}

/// Order detail from `GET /orders/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetailResponse {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default)]
    pub quantity: i64,
    pub status: String,
}

impl OrderDetailResponse {
    /// Collapse broker status strings into the tracked state machine.
    pub fn parsed_status(&self) -> Option<OrderStatus> {
        parse_broker_status(&self.status)
    }
}

/// Broker statuses outside the tracked set map to their nearest equivalent;
/// pending-new style states are still `New`.
pub fn parse_broker_status(raw: &str) -> Option<OrderStatus> {
    let status = match raw.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
        "new" | "waittonew" | "notreported" | "pendingnew" | "submitted" => OrderStatus::New,
        "partialfilled" | "partiallyfilled" => OrderStatus::PartialFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "cancelled" | "expired" | "partialwithdrawal" => OrderStatus::Canceled,
        "rejected" | "failed" => OrderStatus::Rejected,
        _ => return None,
    };
    Some(status)
}
