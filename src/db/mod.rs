//! SQLite persistence for everything the keeper must survive a restart:
//! maintenance counts, correction attempts, take-profit audit rows,
//! profit extremes, anchor positions, and served ops requests.
//!
//! Each entity type has exactly one logical writer role. Maintenance
//! counts increment through a single atomic upsert; profit extremes are
//! last-writer-wins.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::errors::KeeperError;
use crate::models::{AnchorPosition, AnchorStatus, MaintenanceRecord, ProfitExtremes};

/// Database connection pool and repository methods.
pub struct Database {
    pool: SqlitePool,
}

/// Stored correction attempt row (append-only log).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredCorrectionAttempt {
    pub id: String,
    pub account: String,
    pub inst_id: String,
    pub pos_side: String,
    pub target_margin: f64,
    pub attempt: i64,
    pub deviation: f64,
    pub action: String,
    pub requested_size: f64,
    pub result: String,
    pub message: Option<String>,
    pub created_at: String,
}

/// Stored take-profit audit row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredTakeProfit {
    pub id: i64,
    pub account: String,
    pub inst_id: String,
    pub pos_side: String,
    pub profit_rate: f64,
    pub close_size: f64,
    pub rule: String,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredMaintenance {
    account: String,
    inst_id: String,
    pos_side: String,
    date: String,
    count: i64,
    last_maintenance: Option<String>,
}

impl StoredMaintenance {
    fn into_model(self) -> MaintenanceRecord {
        MaintenanceRecord {
            account: self.account,
            inst_id: self.inst_id,
            pos_side: self.pos_side,
            date: self
                .date
                .parse()
                .unwrap_or_else(|_| Utc::now().date_naive()),
            count: self.count.max(0) as u32,
            last_maintenance: self.last_maintenance.as_deref().map(parse_time),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredExtremes {
    inst_id: String,
    pos_side: String,
    open_time: String,
    max_profit_rate: f64,
    max_profit_time: Option<String>,
    max_loss_rate: f64,
    max_loss_time: Option<String>,
    current_profit_rate: f64,
    updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredAnchor {
    inst_id: String,
    pos_side: String,
    anchor_size: f64,
    anchor_price: f64,
    status: String,
    opened_at: String,
    closed_at: Option<String>,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_decimal(f: f64) -> Decimal {
    Decimal::try_from(f).unwrap_or(Decimal::ZERO)
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self, KeeperError> {
        // In-memory SQLite is per-connection; a pool larger than one
        // would hand out empty databases.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect(database_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<(), KeeperError> {
        // Per-day correction counters
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS maintenance_records (
                account TEXT NOT NULL,
                inst_id TEXT NOT NULL,
                pos_side TEXT NOT NULL,
                date TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                last_maintenance TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account, inst_id, pos_side, date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Correction attempts (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS correction_attempts (
                id TEXT PRIMARY KEY,
                account TEXT NOT NULL,
                inst_id TEXT NOT NULL,
                pos_side TEXT NOT NULL,
                target_margin REAL NOT NULL,
                attempt INTEGER NOT NULL,
                deviation REAL NOT NULL,
                action TEXT NOT NULL,
                requested_size REAL NOT NULL,
                result TEXT NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Take-profit audit (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS take_profit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                inst_id TEXT NOT NULL,
                pos_side TEXT NOT NULL,
                profit_rate REAL NOT NULL,
                close_size REAL NOT NULL,
                rule TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Profit extremes per holding period
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profit_extremes (
                inst_id TEXT NOT NULL,
                pos_side TEXT NOT NULL,
                open_time TEXT NOT NULL,
                max_profit_rate REAL NOT NULL DEFAULT 0,
                max_profit_time TEXT,
                max_loss_rate REAL NOT NULL DEFAULT 0,
                max_loss_time TEXT,
                current_profit_rate REAL NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (inst_id, pos_side, open_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Anchor positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anchor_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                inst_id TEXT NOT NULL,
                pos_side TEXT NOT NULL,
                anchor_size REAL NOT NULL,
                anchor_price REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active anchor per (instrument, side)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_anchor_active
            ON anchor_positions(inst_id, pos_side) WHERE status = 'active'
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Idempotency store for the exposed ops endpoints
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS served_requests (
                request_key TEXT PRIMARY KEY,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_corrections_key ON correction_attempts(inst_id, pos_side)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_take_profit_key ON take_profit_records(inst_id, pos_side)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Maintenance Records ====================

    /// Today's correction count for one position, zero if none yet.
    pub async fn maintenance_count(
        &self,
        account: &str,
        inst_id: &str,
        pos_side: &str,
        date: NaiveDate,
    ) -> Result<u32, KeeperError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count FROM maintenance_records
            WHERE account = ? AND inst_id = ? AND pos_side = ? AND date = ?
            "#,
        )
        .bind(account)
        .bind(inst_id)
        .bind(pos_side)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c.max(0) as u32).unwrap_or(0))
    }

    /// Atomically increment the day's count and return the new value.
    /// A single upsert statement keeps the counter monotonic even with
    /// a concurrent reader racing the write.
    pub async fn increment_maintenance_count(
        &self,
        account: &str,
        inst_id: &str,
        pos_side: &str,
        date: NaiveDate,
    ) -> Result<u32, KeeperError> {
        let now = Utc::now().to_rfc3339();

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO maintenance_records (account, inst_id, pos_side, date, count, last_maintenance, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(account, inst_id, pos_side, date) DO UPDATE SET
                count = count + 1,
                last_maintenance = excluded.last_maintenance,
                updated_at = excluded.updated_at
            RETURNING count
            "#,
        )
        .bind(account)
        .bind(inst_id)
        .bind(pos_side)
        .bind(date.to_string())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u32)
    }

    /// All counters for one exchange-day.
    pub async fn maintenance_records_for(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<MaintenanceRecord>, KeeperError> {
        let rows = sqlx::query_as::<_, StoredMaintenance>(
            r#"
            SELECT account, inst_id, pos_side, date, count, last_maintenance
            FROM maintenance_records WHERE date = ? ORDER BY inst_id, pos_side
            "#,
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredMaintenance::into_model).collect())
    }

    // ==================== Correction Attempts ====================

    /// Append one correction attempt to the audit log.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_correction_attempt(
        &self,
        id: &str,
        account: &str,
        inst_id: &str,
        pos_side: &str,
        target_margin: Decimal,
        attempt: u32,
        deviation: Decimal,
        action: &str,
        requested_size: Decimal,
        result: &str,
        message: Option<&str>,
    ) -> Result<(), KeeperError> {
        sqlx::query(
            r#"
            INSERT INTO correction_attempts (
                id, account, inst_id, pos_side, target_margin,
                attempt, deviation, action, requested_size, result, message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(account)
        .bind(inst_id)
        .bind(pos_side)
        .bind(to_f64(target_margin))
        .bind(attempt as i64)
        .bind(to_f64(deviation))
        .bind(action)
        .bind(to_f64(requested_size))
        .bind(result)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent correction attempts, newest first.
    pub async fn recent_correction_attempts(
        &self,
        limit: i64,
    ) -> Result<Vec<StoredCorrectionAttempt>, KeeperError> {
        let rows = sqlx::query_as::<_, StoredCorrectionAttempt>(
            "SELECT * FROM correction_attempts ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ==================== Take-Profit Records ====================

    /// Append one take-profit firing to the audit log.
    pub async fn record_take_profit(
        &self,
        account: &str,
        inst_id: &str,
        pos_side: &str,
        profit_rate: Decimal,
        close_size: Decimal,
        rule: &str,
        reason: &str,
    ) -> Result<(), KeeperError> {
        sqlx::query(
            r#"
            INSERT INTO take_profit_records (account, inst_id, pos_side, profit_rate, close_size, rule, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account)
        .bind(inst_id)
        .bind(pos_side)
        .bind(to_f64(profit_rate))
        .bind(to_f64(close_size))
        .bind(rule)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent take-profit firings, newest first.
    pub async fn recent_take_profits(
        &self,
        limit: i64,
    ) -> Result<Vec<StoredTakeProfit>, KeeperError> {
        let rows = sqlx::query_as::<_, StoredTakeProfit>(
            "SELECT * FROM take_profit_records ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ==================== Profit Extremes ====================

    /// Load the extremes row for one holding period.
    pub async fn get_extremes(
        &self,
        inst_id: &str,
        pos_side: &str,
        open_time: DateTime<Utc>,
    ) -> Result<Option<ProfitExtremes>, KeeperError> {
        let row: Option<StoredExtremes> = sqlx::query_as(
            r#"
            SELECT * FROM profit_extremes
            WHERE inst_id = ? AND pos_side = ? AND open_time = ?
            "#,
        )
        .bind(inst_id)
        .bind(pos_side)
        .bind(open_time.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ProfitExtremes {
            inst_id: r.inst_id,
            pos_side: r.pos_side,
            open_time: parse_time(&r.open_time),
            max_profit_rate: to_decimal(r.max_profit_rate),
            max_profit_time: r.max_profit_time.as_deref().map(parse_time),
            max_loss_rate: to_decimal(r.max_loss_rate),
            max_loss_time: r.max_loss_time.as_deref().map(parse_time),
            current_profit_rate: to_decimal(r.current_profit_rate),
            updated_at: parse_time(&r.updated_at),
        }))
    }

    /// Upsert one extremes row. Last writer wins on the keyed row.
    pub async fn save_extremes(&self, extremes: &ProfitExtremes) -> Result<(), KeeperError> {
        sqlx::query(
            r#"
            INSERT INTO profit_extremes (
                inst_id, pos_side, open_time,
                max_profit_rate, max_profit_time,
                max_loss_rate, max_loss_time,
                current_profit_rate, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(inst_id, pos_side, open_time) DO UPDATE SET
                max_profit_rate = excluded.max_profit_rate,
                max_profit_time = excluded.max_profit_time,
                max_loss_rate = excluded.max_loss_rate,
                max_loss_time = excluded.max_loss_time,
                current_profit_rate = excluded.current_profit_rate,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&extremes.inst_id)
        .bind(&extremes.pos_side)
        .bind(extremes.open_time.to_rfc3339())
        .bind(to_f64(extremes.max_profit_rate))
        .bind(extremes.max_profit_time.map(|t| t.to_rfc3339()))
        .bind(to_f64(extremes.max_loss_rate))
        .bind(extremes.max_loss_time.map(|t| t.to_rfc3339()))
        .bind(to_f64(extremes.current_profit_rate))
        .bind(extremes.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Anchor Positions ====================

    /// The active anchor row for one (instrument, side), if any.
    pub async fn active_anchor(
        &self,
        inst_id: &str,
        pos_side: &str,
    ) -> Result<Option<AnchorPosition>, KeeperError> {
        let row: Option<StoredAnchor> = sqlx::query_as(
            r#"
            SELECT inst_id, pos_side, anchor_size, anchor_price, status, opened_at, closed_at
            FROM anchor_positions
            WHERE inst_id = ? AND pos_side = ? AND status = 'active'
            "#,
        )
        .bind(inst_id)
        .bind(pos_side)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredAnchor::into_model))
    }

    /// All active anchor rows.
    pub async fn active_anchors(&self) -> Result<Vec<AnchorPosition>, KeeperError> {
        let rows: Vec<StoredAnchor> = sqlx::query_as(
            r#"
            SELECT inst_id, pos_side, anchor_size, anchor_price, status, opened_at, closed_at
            FROM anchor_positions WHERE status = 'active' ORDER BY inst_id, pos_side
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredAnchor::into_model).collect())
    }

    /// Insert a new active anchor row. The partial unique index rejects
    /// a second active row for the same key.
    pub async fn save_anchor(&self, anchor: &AnchorPosition) -> Result<(), KeeperError> {
        sqlx::query(
            r#"
            INSERT INTO anchor_positions (inst_id, pos_side, anchor_size, anchor_price, status, opened_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&anchor.inst_id)
        .bind(&anchor.pos_side)
        .bind(to_f64(anchor.anchor_size))
        .bind(to_f64(anchor.anchor_price))
        .bind(anchor.status.as_str())
        .bind(anchor.opened_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retire the active anchor row for one key, if present.
    pub async fn close_anchor(&self, inst_id: &str, pos_side: &str) -> Result<(), KeeperError> {
        sqlx::query(
            r#"
            UPDATE anchor_positions
            SET status = 'closed', closed_at = ?
            WHERE inst_id = ? AND pos_side = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(inst_id)
        .bind(pos_side)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Served Requests ====================

    /// Stored response for an idempotency key, if this request was
    /// served before.
    pub async fn served_response(&self, request_key: &str) -> Result<Option<String>, KeeperError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT response FROM served_requests WHERE request_key = ?")
                .bind(request_key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(r,)| r))
    }

    /// Remember the response served for an idempotency key.
    pub async fn store_served_response(
        &self,
        request_key: &str,
        response: &str,
    ) -> Result<(), KeeperError> {
        sqlx::query(
            "INSERT OR IGNORE INTO served_requests (request_key, response) VALUES (?, ?)",
        )
        .bind(request_key)
        .bind(response)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl StoredAnchor {
    fn into_model(self) -> AnchorPosition {
        AnchorPosition {
            inst_id: self.inst_id,
            pos_side: self.pos_side,
            anchor_size: to_decimal(self.anchor_size),
            anchor_price: to_decimal(self.anchor_price),
            status: if self.status == "active" {
                AnchorStatus::Active
            } else {
                AnchorStatus::Closed
            },
            opened_at: parse_time(&self.opened_at),
            closed_at: self.closed_at.as_deref().map(parse_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_maintenance_count_increments_monotonically() {
        let db = memory_db().await;
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        assert_eq!(
            db.maintenance_count("sub1", "CFX-USDT-SWAP", "long", date)
                .await
                .unwrap(),
            0
        );

        for expected in 1..=3u32 {
            let count = db
                .increment_maintenance_count("sub1", "CFX-USDT-SWAP", "long", date)
                .await
                .unwrap();
            assert_eq!(count, expected);
        }

        assert_eq!(
            db.maintenance_count("sub1", "CFX-USDT-SWAP", "long", date)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_maintenance_count_resets_at_day_rollover() {
        let db = memory_db().await;
        let yesterday = NaiveDate::from_ymd_opt(2025, 3, 13).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        db.increment_maintenance_count("sub1", "UNI-USDT-SWAP", "short", yesterday)
            .await
            .unwrap();

        // A new exchange-day keys a fresh row; no deletion required.
        assert_eq!(
            db.maintenance_count("sub1", "UNI-USDT-SWAP", "short", today)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_extremes_upsert_roundtrip() {
        let db = memory_db().await;
        let now = Utc::now();
        let mut ext = ProfitExtremes::open("LDO-USDT-SWAP", "long", now, dec!(5), now);

        db.save_extremes(&ext).await.unwrap();
        ext.observe(dec!(12), Utc::now());
        db.save_extremes(&ext).await.unwrap();

        let loaded = db
            .get_extremes("LDO-USDT-SWAP", "long", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.max_profit_rate, dec!(12));
        assert_eq!(loaded.current_profit_rate, dec!(12));
    }

    #[tokio::test]
    async fn test_single_active_anchor_per_key() {
        let db = memory_db().await;
        let anchor = AnchorPosition {
            inst_id: "BCH-USDT-SWAP".to_string(),
            pos_side: "long".to_string(),
            anchor_size: dec!(4),
            anchor_price: dec!(250),
            status: AnchorStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        };

        db.save_anchor(&anchor).await.unwrap();
        assert!(db.save_anchor(&anchor).await.is_err());

        // After retiring the active row a fresh holding period may open.
        db.close_anchor("BCH-USDT-SWAP", "long").await.unwrap();
        db.save_anchor(&anchor).await.unwrap();

        let active = db.active_anchor("BCH-USDT-SWAP", "long").await.unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn test_served_request_replay() {
        let db = memory_db().await;

        assert!(db.served_response("k1").await.unwrap().is_none());
        db.store_served_response("k1", "{\"success\":true}")
            .await
            .unwrap();

        // Duplicate stores keep the first response.
        db.store_served_response("k1", "{\"success\":false}")
            .await
            .unwrap();
        assert_eq!(
            db.served_response("k1").await.unwrap().unwrap(),
            "{\"success\":true}"
        );
    }
}
