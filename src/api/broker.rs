//! Brokerage gateway seam.
//!
//! The engine never talks to a broker SDK directly; every component receives
//! an injected `Arc<dyn BrokerGateway>`. Implementations:
//! - [`HttpBroker`](super::HttpBroker): JSON REST gateway
//! - [`PaperBroker`](super::PaperBroker): in-memory account for dry runs and tests

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{LiveOrder, OrderSide, OrderStatus};

/// A holding in the local brokerage account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
    pub sellable_quantity: i64,
    pub cost_price: Decimal,
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Human-friendly name for logs.
    fn name(&self) -> &str;

    async fn positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Last traded price for a symbol.
    async fn quote(&self, symbol: &str) -> Result<Decimal>;

    /// Batched quotes. Symbols whose lookup fails are absent from the result.
    async fn quotes(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let lookups = symbols.iter().map(|s| async move { (s.clone(), self.quote(s).await) });
        Ok(join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(symbol, price)| price.ok().map(|p| (symbol, p)))
            .collect())
    }

    /// Place a limit order; returns the broker order id.
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        price: Decimal,
    ) -> Result<String>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus>;

    /// Orders still working at the broker, used to seed the order book.
    async fn open_orders(&self) -> Result<Vec<LiveOrder>> {
        Ok(Vec::new())
    }
}

/// Enforce a bounded wait on a gateway call; elapsed calls count as failures.
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {:?}", what, limit)),
    }
}
