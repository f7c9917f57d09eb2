//! Reference feed client: fetches a portfolio's current holdings and
//! normalizes them into a [`Snapshot`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::models::{Market, PositionRecord, Snapshot};

use super::types::{FeedData, FeedEnvelope};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Feed prices are integers scaled by 10^9.
const PRICE_SCALE: u64 = 1_000_000_000;

/// Client for the reference portfolio feed (read-only).
#[derive(Clone)]
pub struct FeedClient {
    client: Client,
    url: String,
    retry_delay: Duration,
}

impl FeedClient {
    /// Create a feed client for `url`. Transient failures are retried for up to
    /// three retry delays.
    pub fn new(url: impl Into<String>, retry_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            retry_delay,
        })
    }

    /// Fetch and normalize the current holdings of `portfolio_id`.
    pub async fn fetch(&self, portfolio_id: &str) -> Result<Snapshot> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_delay.max(Duration::from_millis(10)) / 4)
            .with_max_elapsed_time(Some(self.retry_delay * 3))
            .build();

        let data = retry(policy, || async {
            self.fetch_once(portfolio_id).await.map_err(|e| match e {
                FetchFailure::Transient(err) => {
                    warn!(portfolio = %portfolio_id, error = %err, "Feed request failed, retrying");
                    backoff::Error::transient(err)
                }
                FetchFailure::Rejected(err) | FetchFailure::Shape(err) => backoff::Error::permanent(err),
            })
        })
        .await?;

        let snapshot = normalize(portfolio_id, data);
        info!(
            portfolio = %portfolio_id,
            records = snapshot.record_items.len(),
            "Fetched reference snapshot"
        );
        Ok(snapshot)
    }

    async fn fetch_once(&self, portfolio_id: &str) -> std::result::Result<FeedData, FetchFailure> {
        debug!(url = %self.url, portfolio = %portfolio_id, "Fetching reference feed");

        let response = self
            .client
            .get(&self.url)
            .query(&[("portfolio_id", portfolio_id), ("language", "0")])
            .send()
            .await
            .context("Failed to reach reference feed")
            .map_err(FetchFailure::Transient)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("Feed request failed: {} - {}", status, body);
            let retryable = status.is_server_error()
                || status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(if retryable {
                FetchFailure::Transient(err)
            } else {
                FetchFailure::Rejected(err)
            });
        }

        let envelope: FeedEnvelope = response
            .json()
            .await
            .context("Failed to parse feed response")
            .map_err(FetchFailure::Shape)?;

        envelope.data.ok_or_else(|| {
            FetchFailure::Shape(anyhow!(
                "Feed response for portfolio {} is missing 'data'",
                portfolio_id
            ))
        })
    }
}

enum FetchFailure {
    /// Timeouts, connection errors, 5xx responses
    Transient(anyhow::Error),
    /// Client errors; asking again will not help
    Rejected(anyhow::Error),
    /// Response arrived but does not look like a feed payload
    Shape(anyhow::Error),
}

/// Convert raw feed data into a snapshot: prices are unscaled and ratios are
/// re-expressed as percent of their market's aggregate ratio.
pub fn normalize(portfolio_id: &str, data: FeedData) -> Snapshot {
    let market_ratio: HashMap<i64, Decimal> = data
        .market_items
        .iter()
        .map(|m| (m.market, m.ratio))
        .collect();

    let records = data
        .record_items
        .into_iter()
        .map(|raw| {
            let aggregate = market_ratio.get(&raw.market).copied().unwrap_or(Decimal::ONE);
            let total_ratio = if aggregate.is_zero() {
                Decimal::ZERO
            } else {
                (raw.total_ratio / aggregate * Decimal::ONE_HUNDRED).round_dp(2)
            };

            PositionRecord {
                instrument_code: raw.stock_code,
                instrument_name: raw.stock_name,
                market: Market::from_feed_code(raw.market),
                total_ratio,
                current_price: unscale_price(raw.current_price),
                cost_price: unscale_price(raw.cost_price),
            }
        })
        .collect();

    Snapshot::new(portfolio_id, records)
}

fn unscale_price(raw: Option<Decimal>) -> Decimal {
    raw.map(|p| (p / Decimal::from(PRICE_SCALE)).round_dp(2))
        .unwrap_or(Decimal::ZERO)
}
