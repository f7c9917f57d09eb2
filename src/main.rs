//! Portfolio Mirror
//!
//! Follows one or more reference portfolios and keeps a brokerage account's
//! holdings converging toward their weights, with stop-loss / take-profit
//! exits and a tracked order lifecycle.

mod api;
mod db;
mod models;
mod notify;
mod replicator;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BrokerGateway, FeedClient, HttpBroker, PaperBroker};
use crate::db::Database;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::replicator::{Replicator, ReplicatorConfig};
use crate::trading::{
    diff, parse_fx, parse_portfolios, CapitalAllocation, OrderBookConfig, Portfolio,
    ReconcilePolicy, RiskThresholds, TradingConfig,
};

/// Reference-portfolio replication CLI.
#[derive(Parser)]
#[command(name = "mirror")]
#[command(about = "Mirror reference portfolio allocations onto a brokerage account", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./mirror.db?mode=rwc", global = true)]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// In-memory simulated account
    Paper,
    /// JSON REST brokerage gateway
    Http,
}

/// Settings shared by every command; each may also come from the environment.
#[derive(Args, Debug, Clone)]
struct Settings {
    /// Reference feed endpoint
    #[arg(long, env = "FEED_URL", global = true)]
    feed_url: Option<String>,

    /// Tracked portfolios as `id|name,id|name`
    #[arg(long, env = "PORTFOLIO_ID_NAMES", default_value = "", global = true)]
    portfolios: String,

    /// Explicit capital per portfolio as `id|amount,...`; the rest is split equally
    #[arg(long, env = "PORTFOLIO_ID_BALANCES", default_value = "", global = true)]
    allocations: String,

    /// Total account capital
    #[arg(long, env = "TOTAL_BALANCE", default_value = "100000", global = true)]
    total_capital: Decimal,

    /// Seconds between ticks while a tracked market is open
    #[arg(long, env = "POLLING_INTERVAL_SECONDS", default_value = "30", global = true)]
    poll_interval: u64,

    /// Seconds between ticks while every tracked market is closed
    #[arg(long, env = "IDLE_INTERVAL_SECONDS", default_value = "3600", global = true)]
    idle_interval: u64,

    /// Liquidate at this fractional loss on cost
    #[arg(long, env = "STOP_LOSS_RATIO", default_value = "0.10", global = true)]
    stop_loss_ratio: Decimal,

    /// Liquidate at this fractional gain on cost
    #[arg(long, env = "STOP_PROFIT_RATIO", default_value = "0.20", global = true)]
    stop_profit_ratio: Decimal,

    /// Liquidate when the loss exceeds this fraction of trade capital
    #[arg(long, env = "LOSS_THRESHOLD", default_value = "0.01", global = true)]
    loss_threshold: Decimal,

    /// Liquidate when the gain exceeds this fraction of trade capital
    #[arg(long, env = "PROFIT_THRESHOLD", default_value = "0.04", global = true)]
    profit_threshold: Decimal,

    /// Order submission attempts
    #[arg(long, env = "MAX_RETRIES", default_value = "3", global = true)]
    max_retries: u32,

    /// Seconds between submission attempts (also paces feed retries)
    #[arg(long, env = "RETRY_DELAY_SECONDS", default_value = "5", global = true)]
    retry_delay: u64,

    /// Ratio moves (percentage points) at or below this are ignored
    #[arg(long, env = "NOISE_THRESHOLD", default_value = "1", global = true)]
    noise_threshold: Decimal,

    /// Drift (fraction of trade capital) tolerated without trading
    #[arg(long, env = "DEAD_BAND", default_value = "0.05", global = true)]
    dead_band: Decimal,

    /// Capital multiplier per market as `MARKET|factor,...`
    #[arg(long, env = "MARKET_FX", default_value = "HK|7.85", global = true)]
    fx: String,

    /// Brokerage backend
    #[arg(long, env = "BROKER", value_enum, default_value = "paper", global = true)]
    broker: BrokerKind,

    #[arg(long, env = "BROKER_URL", global = true)]
    broker_url: Option<String>,

    #[arg(long, env = "BROKER_API_KEY", global = true, hide_env_values = true)]
    broker_api_key: Option<String>,

    /// Webhook receiving change and failure alerts (logged when unset)
    #[arg(long, env = "NOTIFY_WEBHOOK", global = true)]
    notify_webhook: Option<String>,

    /// What to do with detected changes
    #[arg(long, env = "POLICY", value_enum, default_value = "target-weight", global = true)]
    policy: ReconcilePolicy,

    /// Seconds any single gateway call may take
    #[arg(long, env = "CALL_TIMEOUT_SECONDS", default_value = "15", global = true)]
    call_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication loop
    Run {
        /// Trade against the in-memory paper account regardless of --broker
        #[arg(long)]
        dry_run: bool,
    },

    /// Fetch a portfolio once and show changes against the stored snapshot
    Diff {
        /// Reference portfolio id
        portfolio_id: String,
    },

    /// Show stored snapshots and recent orders
    Status,

    /// Show effective configuration
    Config,
}

impl Settings {
    fn tracked(&self) -> Result<Vec<Portfolio>> {
        parse_portfolios(&self.portfolios).context("Invalid --portfolios")
    }

    fn trading_config(&self) -> Result<TradingConfig> {
        Ok(TradingConfig {
            risk: RiskThresholds {
                loss_ratio_limit: self.stop_loss_ratio,
                profit_ratio_limit: self.stop_profit_ratio,
                loss_abs_fraction_of_capital: self.loss_threshold,
                profit_abs_fraction_of_capital: self.profit_threshold,
            },
            fx: parse_fx(&self.fx).context("Invalid --fx")?,
            noise_threshold: self.noise_threshold,
            dead_band: self.dead_band,
            policy: self.policy,
            ..TradingConfig::default()
        })
    }

    fn replicator_config(&self) -> Result<ReplicatorConfig> {
        let portfolios = self.tracked()?;
        if portfolios.is_empty() {
            bail!("No portfolios configured. Set --portfolios or PORTFOLIO_ID_NAMES.");
        }
        let allocation = CapitalAllocation::resolve(&portfolios, &self.allocations, self.total_capital)?;
        let trading = self.trading_config()?;
        let call_timeout = Duration::from_secs(self.call_timeout);

        let order_book = OrderBookConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay),
            call_timeout,
            slippage: trading.slippage,
            ..OrderBookConfig::default()
        };

        Ok(ReplicatorConfig {
            portfolios,
            allocation,
            trading,
            order_book,
            poll_interval: Duration::from_secs(self.poll_interval),
            idle_interval: Duration::from_secs(self.idle_interval),
            call_timeout,
        })
    }

    fn feed(&self) -> Result<FeedClient> {
        let url = self
            .feed_url
            .as_deref()
            .context("No feed URL configured. Set --feed-url or FEED_URL.")?;
        FeedClient::new(url, Duration::from_secs(self.retry_delay))
    }

    fn gateway(&self, dry_run: bool) -> Result<Arc<dyn BrokerGateway>> {
        if dry_run || self.broker == BrokerKind::Paper {
            return Ok(Arc::new(PaperBroker::new()));
        }

        let url = self
            .broker_url
            .as_deref()
            .context("--broker http requires --broker-url")?;
        let key = self.broker_api_key.clone().unwrap_or_default();
        Ok(Arc::new(HttpBroker::new(url, key)?))
    }

    fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        Ok(match &self.notify_webhook {
            Some(url) => Arc::new(WebhookNotifier::new(url.as_str())?),
            None => Arc::new(LogNotifier),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = &cli.settings;

    match cli.command {
        Commands::Run { dry_run } => {
            let config = settings.replicator_config()?;
            let db = Database::new(&cli.database).await?;
            let gateway = settings.gateway(dry_run)?;

            info!(
                broker = gateway.name(),
                portfolios = config.portfolios.len(),
                dry_run = dry_run,
                "Starting replicator"
            );

            println!("\n=== Portfolio Mirror ===");
            println!("Broker:           {}", gateway.name());
            println!("Policy:           {:?}", config.trading.policy);
            println!("Polling interval: {}s (idle {}s)", settings.poll_interval, settings.idle_interval);
            for p in &config.portfolios {
                println!("Tracking:         {} ({}) with ${}", p.id, p.name, config.allocation.get(&p.id));
            }
            println!("\nPress Ctrl+C to stop.\n");

            let mut replicator = Replicator::new(config, db, settings.feed()?, gateway, settings.notifier()?);
            replicator.initialize().await?;

            if let Err(e) = replicator.run().await {
                tracing::error!(error = %e, "Replicator error");
            }
        }

        Commands::Diff { portfolio_id } => {
            let db = Database::new(&cli.database).await?;
            let trading = settings.trading_config()?;
            let current = settings.feed()?.fetch(&portfolio_id).await?;
            let stored = db.load_snapshot(&portfolio_id).await?;

            let Some(stored) = stored else {
                println!("No stored snapshot for {}; this fetch would become the baseline:", portfolio_id);
                println!("\n{:<12} {:<24} {:>6} {:>9} {:>10}", "SYMBOL", "NAME", "MKT", "RATIO%", "PRICE");
                println!("{}", "-".repeat(65));
                for r in &current.record_items {
                    println!(
                        "{:<12} {:<24} {:>6} {:>9.2} {:>10.2}",
                        r.symbol(),
                        truncate(&r.instrument_name, 22),
                        r.market.as_str(),
                        r.total_ratio,
                        r.current_price
                    );
                }
                return Ok(());
            };

            let changes = diff(Some(&stored), &current, trading.noise_threshold);
            println!(
                "\n{} change(s) for {} since {}",
                changes.len(),
                portfolio_id,
                stored.captured_at.format("%Y-%m-%d %H:%M:%S")
            );
            for change in &changes {
                println!("  {}", change.summary());
            }
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let snapshots = db.list_snapshots().await?;

            if snapshots.is_empty() {
                println!("No snapshots stored yet. Run 'mirror run' to capture baselines.");
            } else {
                println!("\n=== Snapshots ===");
                println!("{:<16} {:<20} {:>12} {:>8}  {}", "PORTFOLIO", "NAME", "CAPITAL", "ITEMS", "CAPTURED");
                println!("{}", "-".repeat(84));
                for row in &snapshots {
                    let items = row.to_snapshot().map(|s| s.record_items.len()).unwrap_or(0);
                    println!(
                        "{:<16} {:<20} {:>12.2} {:>8}  {}",
                        truncate(&row.portfolio_id, 16),
                        truncate(&row.portfolio_name, 18),
                        row.capital,
                        items,
                        row.captured_at
                    );
                }
            }

            let (total, filled, dead) = db.order_stats().await.unwrap_or((0, 0, 0));
            println!("\n=== Orders ===");
            println!("Total:            {}", total);
            println!("Filled:           {}", filled);
            println!("Canceled/Rejected: {}", dead);

            let recent = db.recent_orders(20).await?;
            if !recent.is_empty() {
                println!("\n{:<12} {:<5} {:>8} {:>10} {:<10} {:<14} {}", "SYMBOL", "SIDE", "QTY", "PRICE", "URGENCY", "STATUS", "SUBMITTED");
                for o in &recent {
                    println!(
                        "{:<12} {:<5} {:>8} {:>10.2} {:<10} {:<14} {}",
                        o.symbol, o.side, o.quantity, o.price, o.urgency, o.status, o.submitted_at
                    );
                }
            }
        }

        Commands::Config => {
            let trading = settings.trading_config()?;
            let portfolios = settings.tracked()?;

            println!("\n=== Reference Feed ===\n");
            println!("  URL:                  {}", settings.feed_url.as_deref().unwrap_or("(unset)"));
            println!("  Poll Interval:        {}s", settings.poll_interval);
            println!("  Idle Interval:        {}s", settings.idle_interval);

            println!("\n=== Capital ===\n");
            println!("  Total:                ${}", settings.total_capital);
            match CapitalAllocation::resolve(&portfolios, &settings.allocations, settings.total_capital) {
                Ok(allocation) => {
                    for p in &portfolios {
                        println!("  {:<20} ${}", truncate(&format!("{} ({})", p.id, p.name), 20), allocation.get(&p.id));
                    }
                    println!("  Unallocated:          ${}", allocation.total() - allocation.allocated());
                }
                Err(e) => println!("  Invalid allocation:   {:#}", e),
            }
            let mut fx: Vec<_> = trading.fx.iter().collect();
            fx.sort_by_key(|(m, _)| m.as_str());
            for (market, rate) in fx {
                println!("  {} multiplier:        {}", market, rate);
            }

            println!("\n=== Reconciliation ===\n");
            println!("  Policy:               {:?}", trading.policy);
            println!("  Noise Threshold:      {} pts", trading.noise_threshold);
            println!("  Dead-band:            {}%", trading.dead_band * dec!(100));
            println!("  Max Retries:          {}", settings.max_retries);
            println!("  Retry Delay:          {}s", settings.retry_delay);

            println!("\n=== Risk ===\n");
            println!("  Stop Loss:            {}%", trading.risk.loss_ratio_limit * dec!(100));
            println!("  Take Profit:          {}%", trading.risk.profit_ratio_limit * dec!(100));
            println!("  Loss vs Capital:      {}%", trading.risk.loss_abs_fraction_of_capital * dec!(100));
            println!("  Gain vs Capital:      {}%", trading.risk.profit_abs_fraction_of_capital * dec!(100));
            println!("  Exit Slippage:        {}%", trading.slippage * dec!(100));

            println!("\n=== Broker ===\n");
            println!("  Backend:              {:?}", settings.broker);
            println!("  URL:                  {}", settings.broker_url.as_deref().unwrap_or("(unset)"));
        }
    }

    Ok(())
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
