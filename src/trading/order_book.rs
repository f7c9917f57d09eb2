//! Order lifecycle tracker.
//!
//! Keeps a ledger of the orders this process has open at the broker, keyed by
//! broker order id. Status transitions come only from the background poller;
//! callers submit and cancel. A submission for an instrument that still has an
//! open order first cancels it and waits for the poller to clear it, so an
//! instrument never has two working orders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{bounded, BrokerGateway};
use crate::db::Database;
use crate::models::{LiveOrder, OrderIntent, OrderSide, OrderStatus, Urgency};
use crate::notify::Notifier;

/// Order book timing and pricing.
#[derive(Debug, Clone)]
pub struct OrderBookConfig {
    /// Submission attempts before giving up
    pub max_retries: u32,

    /// Fixed pause between submission attempts
    pub retry_delay: Duration,

    /// How long a cancel-before-resubmit may take to be confirmed
    pub cancel_timeout: Duration,

    /// Background status sweep interval
    pub poll_interval: Duration,

    /// Bound on any single gateway call
    pub call_timeout: Duration,

    /// Price concession for immediate orders
    pub slippage: Decimal,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            call_timeout: Duration::from_secs(15),
            slippage: dec!(0.005),
        }
    }
}

#[derive(Clone)]
pub struct OrderBook {
    gateway: Arc<dyn BrokerGateway>,
    notifier: Arc<dyn Notifier>,
    ledger: Arc<Mutex<HashMap<String, LiveOrder>>>,
    config: OrderBookConfig,
    db: Option<Database>,
}

impl OrderBook {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        notifier: Arc<dyn Notifier>,
        config: OrderBookConfig,
    ) -> Self {
        Self {
            gateway,
            notifier,
            ledger: Arc::new(Mutex::new(HashMap::new())),
            config,
            db: None,
        }
    }

    /// Audit submissions and terminal transitions to `order_log`.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Seed the ledger with orders still working at the broker.
    pub async fn hydrate(&self) -> Result<usize> {
        let open = bounded(self.config.call_timeout, "Open orders request", self.gateway.open_orders()).await?;
        let count = open.len();

        let mut ledger = self.ledger.lock().await;
        for order in open {
            debug!(order_id = %order.broker_order_id, symbol = %order.symbol, "Tracking existing order");
            ledger.insert(order.broker_order_id.clone(), order);
        }

        info!(count, "Order book hydrated");
        Ok(count)
    }

    /// Id of an open order for `symbol`, if any.
    pub async fn check_instrument(&self, symbol: &str) -> Option<String> {
        self.ledger
            .lock()
            .await
            .values()
            .find(|o| o.symbol == symbol && !o.status.is_terminal())
            .map(|o| o.broker_order_id.clone())
    }

    pub async fn open_orders(&self) -> Vec<LiveOrder> {
        self.ledger.lock().await.values().cloned().collect()
    }

    /// Price an intent is placed at.
    pub fn placement_price(&self, intent: &OrderIntent) -> Decimal {
        let price = match (intent.urgency, intent.side) {
            (Urgency::Immediate, OrderSide::Sell) => intent.limit_price * (Decimal::ONE - self.config.slippage),
            (Urgency::Immediate, OrderSide::Buy) => intent.limit_price * (Decimal::ONE + self.config.slippage),
            (Urgency::Normal, _) => intent.limit_price,
        };
        price.round_dp(2)
    }

    /// Place an order, replacing any open order for the same instrument.
    ///
    /// Submission is retried with a fixed delay. When every attempt fails the
    /// notifier is told and the error is returned.
    pub async fn submit(&self, intent: &OrderIntent, portfolio_id: Option<&str>) -> Result<String> {
        if intent.quantity <= 0 {
            bail!("Refusing to submit {} {} with quantity {}", intent.side, intent.symbol, intent.quantity);
        }

        self.clear_instrument(&intent.symbol).await?;

        let price = self.placement_price(intent);
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let call = self
                .gateway
                .submit_order(&intent.symbol, intent.side, intent.quantity, price);

            match bounded(self.config.call_timeout, "Order submission", call).await {
                Ok(order_id) => {
                    self.track(&order_id, intent).await;
                    info!(
                        order_id = %order_id,
                        symbol = %intent.symbol,
                        side = %intent.side,
                        quantity = intent.quantity,
                        price = %price,
                        urgency = intent.urgency.as_str(),
                        "Order submitted"
                    );

                    if let Some(db) = &self.db {
                        if let Err(e) = db.record_order(&order_id, portfolio_id, intent, price).await {
                            warn!(order_id = %order_id, error = %e, "Failed to log order");
                        }
                    }
                    return Ok(order_id);
                }
                Err(e) => {
                    warn!(
                        symbol = %intent.symbol,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Order submission failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("no submission attempt was made"));
        error!(symbol = %intent.symbol, error = %error, "Order abandoned after retries");

        let subject = format!("Order failed: {} {}", intent.side, intent.symbol);
        let body = format!(
            "symbol: {}\nside: {}\nquantity: {}\nprice: {}\nattempts: {}\nerror: {:#}",
            intent.symbol, intent.side, intent.quantity, price, attempts, error
        );
        self.notifier.notify(&subject, &body).await;

        Err(error.context(format!(
            "Submitting {} {} x{} failed after {} attempts",
            intent.side, intent.symbol, intent.quantity, attempts
        )))
    }

    /// Request cancellation. Unknown or already-terminal orders are a no-op.
    pub async fn cancel(&self, order_id: &str) -> Result<()> {
        let open = self
            .ledger
            .lock()
            .await
            .get(order_id)
            .map(|o| !o.status.is_terminal())
            .unwrap_or(false);

        if !open {
            debug!(order_id = %order_id, "Cancel ignored, order not open");
            return Ok(());
        }

        bounded(self.config.call_timeout, "Order cancel", self.gateway.cancel_order(order_id)).await?;
        info!(order_id = %order_id, "Cancel requested");
        Ok(())
    }

    /// One pass over the ledger. Returns how many orders reached a terminal state.
    pub async fn poll_once(&self) -> usize {
        let tracked: Vec<(String, OrderStatus)> = self
            .ledger
            .lock()
            .await
            .iter()
            .map(|(id, o)| (id.clone(), o.status))
            .collect();

        let mut finished = 0;
        for (order_id, previous) in tracked {
            let status = match bounded(
                self.config.call_timeout,
                "Order lookup",
                self.gateway.order_status(&order_id),
            )
            .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "Order lookup failed, keeping entry");
                    continue;
                }
            };

            if status == previous {
                continue;
            }

            if status.is_terminal() {
                if let Some(order) = self.ledger.lock().await.remove(&order_id) {
                    info!(order_id = %order_id, symbol = %order.symbol, status = %status, "Order finished");
                }
                finished += 1;
            } else if let Some(order) = self.ledger.lock().await.get_mut(&order_id) {
                debug!(order_id = %order_id, from = %previous, to = %status, "Order status changed");
                order.status = status;
            }

            if let Some(db) = &self.db {
                if let Err(e) = db.update_order_status(&order_id, status).await {
                    warn!(order_id = %order_id, error = %e, "Failed to log order status");
                }
            }
        }

        finished
    }

    /// Run `poll_once` on the configured interval until shutdown.
    pub fn start_poller(&self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let book = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(book.config.poll_interval);
            while !shutdown.load(Ordering::SeqCst) {
                ticker.tick().await;
                book.poll_once().await;
            }
            debug!("Order poller stopped");
        })
    }

    async fn track(&self, order_id: &str, intent: &OrderIntent) {
        self.ledger.lock().await.insert(
            order_id.to_string(),
            LiveOrder {
                broker_order_id: order_id.to_string(),
                symbol: intent.symbol.clone(),
                side: intent.side,
                quantity: intent.quantity,
                status: OrderStatus::New,
                submitted_at: chrono::Utc::now(),
            },
        );
    }

    /// Cancel every open order for `symbol` and wait until the poller has
    /// seen them all terminate.
    async fn clear_instrument(&self, symbol: &str) -> Result<()> {
        let open: Vec<String> = self
            .ledger
            .lock()
            .await
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .map(|o| o.broker_order_id.clone())
            .collect();

        if open.is_empty() {
            return Ok(());
        }

        for order_id in &open {
            info!(order_id = %order_id, symbol = %symbol, "Cancelling open order before resubmitting");
            // May race a fill; the wait below decides
            if let Err(e) = self.cancel(order_id).await {
                warn!(order_id = %order_id, error = %e, "Cancel request failed");
            }
        }

        let step = self.config.poll_interval.min(Duration::from_millis(250));
        let cleared = tokio::time::timeout(self.config.cancel_timeout, async {
            while self.check_instrument(symbol).await.is_some() {
                tokio::time::sleep(step).await;
            }
        })
        .await;

        if cleared.is_err() {
            bail!(
                "Cancel of open {} order not confirmed within {:?}, new order abandoned",
                symbol,
                self.config.cancel_timeout
            );
        }
        Ok(())
    }
}
