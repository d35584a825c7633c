//! SQLite persistence layer over the transaction ledger.
//!
//! RULE: Only the store executes SQL.
//! Subsystems call store methods; they never touch the connection directly.
//!
//! Dates are stored as ISO `YYYY-MM-DD` TEXT, which compares and sorts
//! correctly as strings, so every windowed query is a plain range predicate.

mod segment;
mod stats;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{
    error::AnalyticsResult,
    types::{CustomerId, TransactionId},
};

pub use segment::RfmScoreRow;
pub use stats::OrderStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: CustomerId,
    pub name:        String,
    pub region:      Option<String>,
    pub join_date:   NaiveDate,
    pub segment_id:  Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PurchaseRow {
    pub date:   NaiveDate,
    pub amount: f64,
}

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

/// Convert an ISO date column back to a `NaiveDate` inside a row mapper.
fn date_col(idx: usize, text: &str) -> rusqlite::Result<NaiveDate> {
    text.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl LedgerStore {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &str) -> AnalyticsResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> AnalyticsResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> AnalyticsResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Customer ──────────────────────────────────────────────────

    pub fn insert_customer(&self, c: &CustomerRecord) -> AnalyticsResult<()> {
        self.conn.execute(
            "INSERT INTO customer (customer_id, name, region, join_date, segment_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                c.customer_id,
                &c.name,
                c.region.as_deref(),
                c.join_date.to_string(),
                c.segment_id,
            ],
        )?;
        Ok(())
    }

    pub fn all_customers(&self) -> AnalyticsResult<Vec<CustomerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, name, region, join_date, segment_id
             FROM customer ORDER BY customer_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CustomerRecord {
                customer_id: row.get(0)?,
                name:        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                region:      row.get(2)?,
                join_date:   date_col(3, &row.get::<_, String>(3)?)?,
                segment_id:  row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Ledger ────────────────────────────────────────────────────

    pub fn insert_transaction(
        &self,
        customer_id: CustomerId,
        date: NaiveDate,
        amount: f64,
    ) -> AnalyticsResult<TransactionId> {
        self.conn.execute(
            "INSERT INTO transactions (customer_id, trans_date, amount) VALUES (?1, ?2, ?3)",
            params![customer_id, date.to_string(), amount],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent purchase date per customer over *all* history at or
    /// before `as_of`. Customers with no ledger rows are absent.
    pub fn last_purchase_dates(
        &self,
        as_of: NaiveDate,
    ) -> AnalyticsResult<Vec<(CustomerId, NaiveDate)>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, MAX(trans_date)
             FROM transactions
             WHERE trans_date <= ?1
             GROUP BY customer_id
             ORDER BY customer_id ASC",
        )?;
        let rows = stmt.query_map(params![as_of.to_string()], |row| {
            Ok((row.get(0)?, date_col(1, &row.get::<_, String>(1)?)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Per-customer purchase count and amount sum inside `[start, end]`.
    pub fn window_stats(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AnalyticsResult<Vec<(CustomerId, i64, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, COUNT(transaction_id), COALESCE(SUM(amount), 0.0)
             FROM transactions
             WHERE trans_date >= ?1 AND trans_date <= ?2
             GROUP BY customer_id",
        )?;
        let rows = stmt.query_map(params![start.to_string(), end.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Distinct customers with at least one purchase inside `[start, end]`.
    pub fn buyers_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AnalyticsResult<Vec<CustomerId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT customer_id FROM transactions
             WHERE trans_date >= ?1 AND trans_date <= ?2",
        )?;
        let rows = stmt.query_map(params![start.to_string(), end.to_string()], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Full purchase history of one customer at or before `as_of`,
    /// ordered by date (ledger id breaks same-day ties).
    pub fn purchases_for_customer(
        &self,
        customer_id: CustomerId,
        as_of: NaiveDate,
    ) -> AnalyticsResult<Vec<PurchaseRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT trans_date, amount FROM transactions
             WHERE customer_id = ?1 AND trans_date <= ?2
             ORDER BY trans_date ASC, transaction_id ASC",
        )?;
        let rows = stmt.query_map(params![customer_id, as_of.to_string()], |row| {
            Ok(PurchaseRow {
                date:   date_col(0, &row.get::<_, String>(0)?)?,
                amount: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Customers with at least `min_count` purchases at or before `as_of`,
    /// busiest first.
    pub fn purchase_counts(
        &self,
        as_of: NaiveDate,
        min_count: i64,
    ) -> AnalyticsResult<Vec<(CustomerId, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, COUNT(transaction_id) AS n
             FROM transactions
             WHERE trans_date <= ?1
             GROUP BY customer_id
             HAVING n >= ?2
             ORDER BY n DESC, customer_id ASC",
        )?;
        let rows = stmt.query_map(params![as_of.to_string(), min_count], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
