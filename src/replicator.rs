//! Replicator: the scheduler loop tying feed, diff, reconciliation, risk and
//! the order book together.
//!
//! Each tick:
//! - Scan live positions for stop-loss / take-profit exits
//! - For every tracked portfolio, fetch the reference snapshot and diff it
//!   against the stored one
//! - Report changes and (under the target-weight policy) reconcile them
//! - Advance the stored snapshot only when every order was placed

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{BrokerGateway, FeedClient};
use crate::db::Database;
use crate::models::{Change, Market, Snapshot};
use crate::notify::Notifier;
use crate::trading::{
    apply_precedence, diff, market_hours, CapitalAllocation, OrderBook, OrderBookConfig, Portfolio,
    Reconciler, RiskManager, TrackedInstrument, TradingConfig,
};

/// Replicator configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub portfolios: Vec<Portfolio>,
    pub allocation: CapitalAllocation,
    pub trading: TradingConfig,
    pub order_book: OrderBookConfig,

    /// Tick interval while a tracked market is open
    pub poll_interval: Duration,

    /// Tick interval while every tracked market is closed
    pub idle_interval: Duration,

    /// Bound on any single gateway call
    pub call_timeout: Duration,
}

/// What happened to one portfolio during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortfolioOutcome {
    /// First observation, stored as the diff baseline
    Baseline,
    Unchanged,
    /// Changes detected and every resulting order placed
    Applied { changes: usize, orders: usize },
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub liquidations: usize,
    pub outcomes: HashMap<String, PortfolioOutcome>,
    pub failures: usize,
}

pub struct Replicator {
    config: ReplicatorConfig,
    db: Database,
    feed: FeedClient,
    order_book: OrderBook,
    reconciler: Reconciler,
    risk: RiskManager,
    notifier: Arc<dyn Notifier>,

    // Runtime state
    snapshots: Arc<RwLock<HashMap<String, Snapshot>>>,
    poller: Option<JoinHandle<()>>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        db: Database,
        feed: FeedClient,
        gateway: Arc<dyn BrokerGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let order_book = OrderBook::new(gateway.clone(), notifier.clone(), config.order_book.clone())
            .with_database(db.clone());
        let reconciler = Reconciler::new(gateway.clone(), config.trading.clone(), config.call_timeout);
        let risk = RiskManager::new(gateway, config.trading.risk.clone(), config.call_timeout);

        Self {
            config,
            db,
            feed,
            order_book,
            reconciler,
            risk,
            notifier,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            poller: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Restore stored snapshots, adopt the broker's open orders and start the
    /// order poller.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing replicator...");

        {
            let mut snapshots = self.snapshots.write().await;
            for portfolio in &self.config.portfolios {
                match self.db.load_snapshot(&portfolio.id).await {
                    Ok(Some(snapshot)) => {
                        info!(
                            portfolio = %portfolio.id,
                            records = snapshot.record_items.len(),
                            captured_at = %snapshot.captured_at,
                            "Restored snapshot"
                        );
                        snapshots.insert(portfolio.id.clone(), snapshot);
                    }
                    Ok(None) => info!(portfolio = %portfolio.id, "No stored snapshot, will capture baseline"),
                    Err(e) => warn!(portfolio = %portfolio.id, error = %e, "Stored snapshot unreadable, will capture baseline"),
                }
            }
        }

        if let Err(e) = self.order_book.hydrate().await {
            warn!(error = %e, "Could not load open orders from broker");
        }

        self.poller = Some(self.order_book.start_poller(self.shutdown.clone()));

        info!(
            portfolios = self.config.portfolios.len(),
            capital = %self.config.allocation.total(),
            policy = ?self.config.trading.policy,
            "Replicator initialized"
        );
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval = self.config.poll_interval.as_secs(),
            idle_interval = self.config.idle_interval.as_secs(),
            "Starting replicator run loop"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            wake.notify_one();
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            let report = self.tick().await;
            if report.failures > 0 {
                warn!(failures = report.failures, "Tick finished with failures");
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let wait = self.next_interval().await;
            debug!(secs = wait.as_secs(), "Waiting for next tick");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.stop().await;
        Ok(())
    }

    /// One scheduler pass. Never fails; problems are counted in the report.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let liquidated = match self.run_risk().await {
            Ok(symbols) => symbols,
            Err(e) => {
                error!(error = %e, "Risk scan failed");
                report.failures += 1;
                HashSet::new()
            }
        };
        report.liquidations = liquidated.len();

        for portfolio in &self.config.portfolios {
            match self.process_portfolio(portfolio, &liquidated).await {
                Ok(outcome) => {
                    report.outcomes.insert(portfolio.id.clone(), outcome);
                }
                Err(e) => {
                    error!(portfolio = %portfolio.id, error = %e, "Portfolio pass failed");
                    report.failures += 1;
                }
            }
        }

        report
    }

    /// Sleep length until the next tick, from the markets currently tracked.
    pub async fn next_interval(&self) -> Duration {
        let mut markets: HashSet<Market> = self
            .snapshots
            .read()
            .await
            .values()
            .flat_map(|s| s.markets())
            .filter(|m| *m != Market::Unknown)
            .collect();
        if markets.is_empty() {
            markets.insert(Market::Us);
        }

        market_hours::poll_interval(
            &markets,
            Utc::now(),
            self.config.poll_interval,
            self.config.idle_interval,
        )
    }

    /// Stop the poller and wait for it to exit.
    pub async fn stop(&mut self) {
        info!("Shutting down replicator...");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.poller.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Order poller ended abnormally");
            }
        }

        let open = self.order_book.open_orders().await;
        if !open.is_empty() {
            info!(count = open.len(), "Orders still working at shutdown");
        }
    }

    /// Risk context for every instrument in a stored snapshot.
    async fn risk_universe(&self) -> HashMap<String, TrackedInstrument> {
        let snapshots = self.snapshots.read().await;
        let mut universe = HashMap::new();

        for portfolio in &self.config.portfolios {
            let Some(snapshot) = snapshots.get(&portfolio.id) else {
                continue;
            };
            let allocation = self.config.allocation.get(&portfolio.id);

            for record in &snapshot.record_items {
                universe.entry(record.symbol()).or_insert_with(|| TrackedInstrument {
                    trade_capital: self.config.trading.trade_capital(allocation, record.market),
                    reference_price: record.current_price,
                });
            }
        }

        universe
    }

    /// Place risk exits. Returns the symbols whose exit order was accepted;
    /// a failed exit leaves the symbol to this tick's rebalance.
    async fn run_risk(&self) -> Result<HashSet<String>> {
        let universe = self.risk_universe().await;
        if universe.is_empty() {
            return Ok(HashSet::new());
        }

        let exits = self.risk.scan(&universe).await?;
        let mut liquidated = HashSet::new();

        for exit in exits {
            let intent = &exit.intent;

            match self.order_book.submit(intent, None).await {
                Ok(order_id) => {
                    liquidated.insert(intent.symbol.clone());
                    let subject = format!("Risk exit: {} {}", exit.verdict.trigger.as_str(), intent.symbol);
                    let body = format!(
                        "Sold {} {} @ {} (pnl {:.2}, {:.2}%), order {}",
                        intent.quantity,
                        intent.symbol,
                        intent.limit_price,
                        exit.verdict.pnl_abs,
                        exit.verdict.pnl_ratio * Decimal::ONE_HUNDRED,
                        order_id
                    );
                    self.notifier.notify(&subject, &body).await;
                }
                Err(e) => error!(symbol = %intent.symbol, error = %e, "Risk exit not placed"),
            }
        }

        Ok(liquidated)
    }

    async fn process_portfolio(
        &self,
        portfolio: &Portfolio,
        liquidated: &HashSet<String>,
    ) -> Result<PortfolioOutcome> {
        let allocation = self.config.allocation.get(&portfolio.id);
        let snapshot = self.feed.fetch(&portfolio.id).await?;

        let previous = self.snapshots.read().await.get(&portfolio.id).cloned();
        let Some(previous) = previous else {
            self.persist(portfolio, snapshot).await?;
            info!(portfolio = %portfolio.id, "Baseline snapshot captured");
            return Ok(PortfolioOutcome::Baseline);
        };

        let changes = diff(Some(&previous), &snapshot, self.config.trading.noise_threshold);
        if changes.is_empty() {
            debug!(portfolio = %portfolio.id, "No changes");
            return Ok(PortfolioOutcome::Unchanged);
        }

        info!(portfolio = %portfolio.id, changes = changes.len(), "Reference holdings changed");
        self.report_changes(portfolio, &changes).await;

        let mut placed = 0;
        if self.config.trading.policy.trades() {
            let intents = self.reconciler.reconcile(allocation, &changes).await?;
            let intents = apply_precedence(intents, liquidated);

            let mut failed = 0;
            for intent in &intents {
                match self.order_book.submit(intent, Some(&portfolio.id)).await {
                    Ok(_) => placed += 1,
                    Err(e) => {
                        error!(portfolio = %portfolio.id, symbol = %intent.symbol, error = %e, "Order not placed");
                        failed += 1;
                    }
                }
            }

            if failed > 0 {
                bail!(
                    "{} of {} orders failed for portfolio {}, snapshot not advanced",
                    failed,
                    intents.len(),
                    portfolio.id
                );
            }
        }

        let count = changes.len();
        self.persist(portfolio, snapshot).await?;

        Ok(PortfolioOutcome::Applied {
            changes: count,
            orders: placed,
        })
    }

    async fn persist(&self, portfolio: &Portfolio, snapshot: Snapshot) -> Result<()> {
        let allocation = self.config.allocation.get(&portfolio.id);
        self.db.save_snapshot(&snapshot, &portfolio.name, allocation).await?;
        self.snapshots.write().await.insert(portfolio.id.clone(), snapshot);
        Ok(())
    }

    async fn report_changes(&self, portfolio: &Portfolio, changes: &[Change]) {
        let subject = format!(
            "[{}] holdings changed - {}",
            portfolio.name,
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let body = changes.iter().map(Change::summary).collect::<Vec<_>>().join("\n");
        self.notifier.notify(&subject, &body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperBroker;
    use crate::notify::RecordingNotifier;
    use crate::trading::{parse_portfolios, ReconcilePolicy};
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Feed body with US holdings given as (code, ratio fraction, price).
    fn feed_body(items: &[(&str, &str, u64)]) -> Value {
        let records: Vec<Value> = items
            .iter()
            .map(|(code, ratio, price)| {
                json!({
                    "stock_code": code,
                    "stock_name": code,
                    "market": 2,
                    "total_ratio": ratio,
                    "current_price": price * 1_000_000_000,
                    "cost_price": price * 1_000_000_000
                })
            })
            .collect();
        json!({ "data": { "record_items": records, "market_items": [{ "market": 2, "ratio": 1 }] } })
    }

    async fn serve(server: &MockServer, portfolio: &str, status: u16, body: Value) {
        Mock::given(method("GET"))
            .and(query_param("portfolio_id", portfolio))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    struct Harness {
        replicator: Replicator,
        broker: Arc<PaperBroker>,
        notifier: Arc<RecordingNotifier>,
        db: Database,
    }

    async fn harness(server: &MockServer, portfolios: &str, policy: ReconcilePolicy) -> Harness {
        let portfolios = parse_portfolios(portfolios).unwrap();
        let allocation = CapitalAllocation::resolve(&portfolios, "", dec!(10000) * Decimal::from(portfolios.len())).unwrap();
        let mut trading = TradingConfig::default();
        trading.policy = policy;

        let config = ReplicatorConfig {
            portfolios,
            allocation,
            trading,
            order_book: OrderBookConfig {
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
                cancel_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                call_timeout: Duration::from_secs(1),
                slippage: dec!(0.005),
            },
            poll_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(1),
        };

        let db = Database::in_memory().await.unwrap();
        let feed = FeedClient::new(server.uri(), Duration::from_millis(20)).unwrap();
        let broker = Arc::new(PaperBroker::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let replicator = Replicator::new(config, db.clone(), feed, broker.clone(), notifier.clone());

        Harness {
            replicator,
            broker,
            notifier,
            db,
        }
    }

    #[tokio::test]
    async fn test_cold_start_then_close_and_open() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.1", 30)])).await;
        let h = harness(&server, "p1|Alpha", ReconcilePolicy::TargetWeight).await;

        h.broker.set_position("X.US", 40, dec!(29)).await;
        h.broker.set_price("X.US", dec!(30)).await;
        h.broker.set_price("Y.US", dec!(50)).await;

        let first = h.replicator.tick().await;
        assert_eq!(first.outcomes["p1"], PortfolioOutcome::Baseline);
        assert!(h.broker.orders().await.is_empty());
        assert_eq!(h.db.load_snapshot("p1").await.unwrap().unwrap().record_items.len(), 1);

        server.reset().await;
        serve(&server, "p1", 200, feed_body(&[("Y", "0.15", 50)])).await;

        let second = h.replicator.tick().await;
        assert_eq!(second.failures, 0);
        assert_eq!(second.liquidations, 0);
        assert_eq!(
            second.outcomes["p1"],
            PortfolioOutcome::Applied { changes: 2, orders: 2 }
        );

        let orders = h.broker.orders().await;
        let sell = orders.iter().find(|o| o.symbol == "X.US").unwrap();
        assert_eq!((sell.side, sell.quantity), (OrderSide::Sell, 40));
        let buy = orders.iter().find(|o| o.symbol == "Y.US").unwrap();
        assert_eq!((buy.side, buy.quantity), (OrderSide::Buy, 30));

        let stored = h.db.load_snapshot("p1").await.unwrap().unwrap();
        assert_eq!(stored.record_items[0].instrument_code, "Y");

        let sent = h.notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.starts_with("[Alpha] holdings changed"));
        assert!(sent[0].1.contains("CLOSE X X.US"));
    }

    #[tokio::test]
    async fn test_feed_failure_is_isolated() {
        let server = MockServer::start().await;
        serve(&server, "p1", 500, json!({})).await;
        serve(&server, "p2", 200, feed_body(&[("X", "0.1", 30)])).await;
        let h = harness(&server, "p1|Alpha,p2|Beta", ReconcilePolicy::TargetWeight).await;

        let report = h.replicator.tick().await;
        assert_eq!(report.failures, 1);
        assert!(!report.outcomes.contains_key("p1"));
        assert_eq!(report.outcomes["p2"], PortfolioOutcome::Baseline);
        assert!(h.db.load_snapshot("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_order_keeps_old_snapshot() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.1", 30)])).await;
        let h = harness(&server, "p1|Alpha", ReconcilePolicy::TargetWeight).await;
        h.replicator.tick().await;

        server.reset().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.1", 30), ("Y", "0.15", 50)])).await;
        h.broker.fail_next_submits(2).await;

        let report = h.replicator.tick().await;
        assert_eq!(report.failures, 1);

        let stored = h.db.load_snapshot("p1").await.unwrap().unwrap();
        assert_eq!(stored.record_items.len(), 1);

        // Change report plus order failure alert
        let sent = h.notifier.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[1].0.contains("Order failed"));
        drop(sent);

        // Same change is retried on the next tick
        let retry = h.replicator.tick().await;
        assert_eq!(retry.outcomes["p1"], PortfolioOutcome::Applied { changes: 1, orders: 1 });
    }

    #[tokio::test]
    async fn test_notify_only_never_trades() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.1", 30)])).await;
        let h = harness(&server, "p1|Alpha", ReconcilePolicy::NotifyOnly).await;
        h.replicator.tick().await;

        server.reset().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.3", 30)])).await;

        let report = h.replicator.tick().await;
        assert_eq!(report.outcomes["p1"], PortfolioOutcome::Applied { changes: 1, orders: 0 });
        assert!(h.broker.orders().await.is_empty());
        assert_eq!(
            h.db.load_snapshot("p1").await.unwrap().unwrap().record_items[0].total_ratio,
            dec!(30)
        );
    }

    #[tokio::test]
    async fn test_risk_exit_preempts_rebalance() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.05", 100)])).await;
        let h = harness(&server, "p1|Alpha", ReconcilePolicy::TargetWeight).await;
        h.replicator.tick().await;

        h.broker.set_position("X.US", 10, dec!(100)).await;
        h.broker.set_price("X.US", dec!(85)).await;

        server.reset().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.2", 85)])).await;

        let report = h.replicator.tick().await;
        assert_eq!(report.liquidations, 1);
        assert_eq!(report.outcomes["p1"], PortfolioOutcome::Applied { changes: 1, orders: 0 });

        let orders = h.broker.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, 10);
        assert_eq!(orders[0].price, dec!(84.58));
    }

    #[tokio::test]
    async fn test_failed_risk_exit_does_not_swallow_rebalance() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.05", 100)])).await;
        let h = harness(&server, "p1|Alpha", ReconcilePolicy::TargetWeight).await;
        h.replicator.tick().await;

        h.broker.set_position("X.US", 10, dec!(100)).await;
        h.broker.set_price("X.US", dec!(85)).await;
        // Both attempts of the exit are rejected
        h.broker.fail_next_submits(2).await;

        server.reset().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.2", 85)])).await;

        let report = h.replicator.tick().await;
        assert_eq!(report.liquidations, 0);
        assert_eq!(report.outcomes["p1"], PortfolioOutcome::Applied { changes: 1, orders: 1 });

        // 20% of 10000 at 85 is 23 shares, 10 already held
        let orders = h.broker.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].quantity, 13);

        let stored = h.db.load_snapshot("p1").await.unwrap().unwrap();
        assert_eq!(stored.get("X").unwrap().total_ratio, dec!(20));
    }

    #[tokio::test]
    async fn test_initialize_restores_snapshots() {
        let server = MockServer::start().await;
        serve(&server, "p1", 200, feed_body(&[("X", "0.1", 30)])).await;
        let mut h = harness(&server, "p1|Alpha", ReconcilePolicy::TargetWeight).await;

        let stored = Snapshot::new("p1", Vec::new());
        h.db.save_snapshot(&stored, "Alpha", dec!(10000)).await.unwrap();

        h.replicator.initialize().await.unwrap();
        let report = h.replicator.tick().await;
        // Stored (empty) snapshot is the baseline, so X shows up as an open
        assert_eq!(report.outcomes["p1"], PortfolioOutcome::Applied { changes: 1, orders: 1 });
        h.replicator.stop().await;
    }
}
