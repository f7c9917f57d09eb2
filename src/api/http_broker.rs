//! JSON REST brokerage gateway.
//!
//! Endpoints (relative to the base URL):
//! - `GET    /positions`          account holdings
//! - `GET    /quote?symbol=`      last traded price
//! - `POST   /orders`             submit a limit order
//! - `DELETE /orders/{id}`        cancel
//! - `GET    /orders/{id}`        order detail
//! - `GET    /orders?status=open` working orders

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{LiveOrder, OrderSide, OrderStatus};

use super::broker::{BrokerGateway, BrokerPosition};
use super::types::{
    parse_broker_status, OrderDetailResponse, PositionResponse, QuoteResponse,
    SubmitOrderRequest, SubmitOrderResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for a brokerage account.
pub struct HttpBroker {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(&self.api_key).context("Invalid API key header")?,
        );
        headers.insert(
            HeaderName::from_static("x-timestamp"),
            HeaderValue::from_str(&Utc::now().timestamp_millis().to_string())?,
        );
        Ok(headers)
    }

    async fn checked(resp: Response, what: &str) -> Result<Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed: {} - {}", what, status, text));
        }
        Ok(resp)
    }

    async fn order_detail(&self, order_id: &str) -> Result<OrderDetailResponse> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let resp = self.http.get(&url).headers(self.auth_headers()?).send().await?;
        Self::checked(resp, "Order lookup")
            .await?
            .json()
            .await
            .context("Failed to parse order detail")
    }
}

#[async_trait]
impl BrokerGateway for HttpBroker {
    fn name(&self) -> &str {
        "http"
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/positions", self.base_url);
        let resp = self.http.get(&url).headers(self.auth_headers()?).send().await?;
        let rows: Vec<PositionResponse> = Self::checked(resp, "Positions request")
            .await?
            .json()
            .await
            .context("Failed to parse positions")?;

        Ok(rows
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                quantity: p.quantity,
                sellable_quantity: p.available_quantity,
                cost_price: p.cost_price,
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/quote", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("symbol", symbol)])
            .headers(self.auth_headers()?)
            .send()
            .await?;
        let quote: QuoteResponse = Self::checked(resp, "Quote request")
            .await?
            .json()
            .await
            .context("Failed to parse quote")?;

        debug!(symbol = %quote.symbol, price = %quote.last_done, "Quote");
        Ok(quote.last_done)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        price: Decimal,
    ) -> Result<String> {
        let body = SubmitOrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: price.to_string(),
            order_type: "LO",
            time_in_force: "Day",
            remark: format!("Auto {} {} shares", side.as_str().to_lowercase(), quantity),
        };

        let url = format!("{}/orders", self.base_url);
        let resp = self
            .http
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await?;
        let placed: SubmitOrderResponse = Self::checked(resp, "Order placement")
            .await?
            .json()
            .await
            .context("Failed to parse order response")?;

        Ok(placed.order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let resp = self.http.delete(&url).headers(self.auth_headers()?).send().await?;
        Self::checked(resp, "Order cancel").await?;
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus> {
        let detail = self.order_detail(order_id).await?;
        detail
            .parsed_status()
            .ok_or_else(|| anyhow!("Unknown order status '{}' for {}", detail.status, order_id))
    }

    async fn open_orders(&self) -> Result<Vec<LiveOrder>> {
        let url = format!("{}/orders", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("status", "open")])
            .headers(self.auth_headers()?)
            .send()
            .await?;
        let rows: Vec<OrderDetailResponse> = Self::checked(resp, "Open orders request")
            .await?
            .json()
            .await
            .context("Failed to parse open orders")?;

        Ok(rows
            .into_iter()
            .filter_map(|o| {
                let status = parse_broker_status(&o.status)?;
                (!status.is_terminal()).then(|| LiveOrder {
                    broker_order_id: o.order_id,
                    symbol: o.symbol,
                    side: o.side,
                    quantity: o.quantity,
                    status,
                    submitted_at: Utc::now(),
                })
            })
            .collect())
    }
}
