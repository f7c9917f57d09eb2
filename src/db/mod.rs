//! SQLite persistence: the snapshot store and the order audit log.
//!
//! Stores what the engine needs to resume after a restart:
//! - The last reference snapshot per portfolio (the diff baseline)
//! - Every order the engine placed and its final status

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{OrderIntent, OrderStatus, PositionRecord, Snapshot};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Snapshot row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSnapshot {
    pub portfolio_id: String,
    pub portfolio_name: String,
    pub capital: f64,
    pub captured_at: String,
    pub record_items: String,
}

impl StoredSnapshot {
    /// Decode the persisted record items back into a snapshot.
    pub fn to_snapshot(&self) -> Result<Snapshot> {
        let record_items: Vec<PositionRecord> = serde_json::from_str(&self.record_items)
            .with_context(|| format!("Corrupt snapshot for portfolio {}", self.portfolio_id))?;
        let captured_at = DateTime::parse_from_rfc3339(&self.captured_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Snapshot {
            portfolio_id: self.portfolio_id.clone(),
            captured_at,
            record_items,
        })
    }
}

/// Order audit row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub broker_order_id: String,
    pub portfolio_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub price: f64,
    pub urgency: String,
    pub status: String,
    pub submitted_at: String,
    pub updated_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database; a single connection keeps one shared schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                portfolio_id TEXT PRIMARY KEY,
                portfolio_name TEXT NOT NULL DEFAULT '',
                capital REAL NOT NULL DEFAULT 0,
                captured_at TEXT NOT NULL,
                record_items TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_log (
                broker_order_id TEXT PRIMARY KEY,
                portfolio_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                urgency TEXT NOT NULL,
                status TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_order_log_symbol ON order_log(symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Snapshots ====================

    /// Replace the stored snapshot for a portfolio in a single statement.
    pub async fn save_snapshot(
        &self,
        snapshot: &Snapshot,
        portfolio_name: &str,
        capital: Decimal,
    ) -> Result<()> {
        let record_items =
            serde_json::to_string(&snapshot.record_items).context("Failed to encode snapshot")?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (portfolio_id, portfolio_name, capital, captured_at, record_items)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(portfolio_id) DO UPDATE SET
                portfolio_name = excluded.portfolio_name,
                capital = excluded.capital,
                captured_at = excluded.captured_at,
                record_items = excluded.record_items
            "#,
        )
        .bind(&snapshot.portfolio_id)
        .bind(portfolio_name)
        .bind(capital.to_f64().unwrap_or(0.0))
        .bind(snapshot.captured_at.to_rfc3339())
        .bind(record_items)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save snapshot for {}", snapshot.portfolio_id))?;

        Ok(())
    }

    /// Load the stored snapshot for a portfolio, if any.
    pub async fn load_snapshot(&self, portfolio_id: &str) -> Result<Option<Snapshot>> {
        let row = self.get_stored_snapshot(portfolio_id).await?;
        row.map(|r| r.to_snapshot()).transpose()
    }

    pub async fn get_stored_snapshot(&self, portfolio_id: &str) -> Result<Option<StoredSnapshot>> {
        let row = sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM snapshots WHERE portfolio_id = ?",
        )
        .bind(portfolio_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<StoredSnapshot>> {
        let rows = sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM snapshots ORDER BY portfolio_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ==================== Order log ====================

    /// Record a freshly accepted order.
    pub async fn record_order(
        &self,
        broker_order_id: &str,
        portfolio_id: Option<&str>,
        intent: &OrderIntent,
        price: Decimal,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO order_log
                (broker_order_id, portfolio_id, symbol, side, quantity, price, urgency, status, submitted_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(broker_order_id)
        .bind(portfolio_id)
        .bind(&intent.symbol)
        .bind(intent.side.as_str())
        .bind(intent.quantity)
        .bind(price.to_f64().unwrap_or(0.0))
        .bind(intent.urgency.as_str())
        .bind(OrderStatus::New.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_order_status(&self, broker_order_id: &str, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE order_log SET status = ?, updated_at = ? WHERE broker_order_id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(broker_order_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn recent_orders(&self, limit: i64) -> Result<Vec<StoredOrder>> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM order_log ORDER BY submitted_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// (total, filled, canceled or rejected)
    pub async fn order_stats(&self) -> Result<(i64, i64, i64)> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM order_log")
            .fetch_one(&self.pool)
            .await?;
        let filled: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM order_log WHERE status = 'Filled'")
                .fetch_one(&self.pool)
                .await?;
        let dead: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM order_log WHERE status IN ('Canceled', 'Rejected')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((total.0, filled.0, dead.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Market;
    use rust_decimal_macros::dec;

    fn snapshot(ratio: Decimal) -> Snapshot {
        Snapshot::new(
            "p1",
            vec![PositionRecord {
                instrument_code: "AAPL".into(),
                instrument_name: "Apple".into(),
                market: Market::Us,
                total_ratio: ratio,
                current_price: dec!(190.12),
                cost_price: dec!(150),
            }],
        )
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_snapshot("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_replaced_wholesale() {
        let db = Database::in_memory().await.unwrap();
        db.save_snapshot(&snapshot(dec!(10)), "Alpha", dec!(10000)).await.unwrap();
        db.save_snapshot(&snapshot(dec!(25.5)), "Alpha", dec!(12000)).await.unwrap();

        let loaded = db.load_snapshot("p1").await.unwrap().unwrap();
        assert_eq!(loaded.record_items.len(), 1);
        assert_eq!(loaded.record_items[0].total_ratio, dec!(25.5));
        assert_eq!(loaded.record_items[0].current_price, dec!(190.12));

        let stored = db.list_snapshots().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].portfolio_name, "Alpha");
        assert_eq!(stored[0].capital, 12000.0);
    }

    #[tokio::test]
    async fn test_order_log_status_updates() {
        let db = Database::in_memory().await.unwrap();
        let intent = OrderIntent::buy("AAPL.US", 30, dec!(50));
        db.record_order("o-1", Some("p1"), &intent, dec!(50)).await.unwrap();
        db.update_order_status("o-1", OrderStatus::Filled).await.unwrap();

        let orders = db.recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "Filled");
        assert_eq!(orders[0].quantity, 30);
        assert_eq!(db.order_stats().await.unwrap(), (1, 1, 0));
    }
}
