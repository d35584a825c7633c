use chrono::NaiveDate;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::LedgerStore;
use crate::{error::AnalyticsResult, types::CustomerId};

/// Order-value aggregates over the ledger, optionally scoped to one segment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrderStats {
    pub order_count:     i64,
    pub total_revenue:   f64,
    pub max_order_value: f64,
}

fn order_stats_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderStats> {
    Ok(OrderStats {
        order_count:     row.get(0)?,
        total_revenue:   row.get(1)?,
        max_order_value: row.get(2)?,
    })
}

impl LedgerStore {
    // ── Consumption statistics ─────────────────────────────────────

    pub fn order_stats(
        &self,
        as_of: NaiveDate,
        segment_id: Option<i64>,
    ) -> AnalyticsResult<OrderStats> {
        let stats = match segment_id {
            Some(seg) => self.conn.query_row(
                "SELECT COUNT(t.transaction_id), COALESCE(SUM(t.amount), 0.0),
                        COALESCE(MAX(t.amount), 0.0)
                 FROM transactions t
                 JOIN customer c ON c.customer_id = t.customer_id
                 WHERE t.trans_date <= ?1 AND c.segment_id = ?2",
                params![as_of.to_string(), seg],
                order_stats_mapper,
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(transaction_id), COALESCE(SUM(amount), 0.0),
                        COALESCE(MAX(amount), 0.0)
                 FROM transactions
                 WHERE trans_date <= ?1",
                params![as_of.to_string()],
                order_stats_mapper,
            )?,
        };
        Ok(stats)
    }

    /// Distinct buyers inside `[start, end]` (unbounded start when `None`),
    /// optionally scoped to one segment.
    pub fn buyer_count(
        &self,
        start: Option<NaiveDate>,
        end: NaiveDate,
        segment_id: Option<i64>,
    ) -> AnalyticsResult<i64> {
        let start = start.map(|d| d.to_string());
        let count = match segment_id {
            Some(seg) => self.conn.query_row(
                "SELECT COUNT(DISTINCT t.customer_id)
                 FROM transactions t
                 JOIN customer c ON c.customer_id = t.customer_id
                 WHERE t.trans_date <= ?1
                   AND (?2 IS NULL OR t.trans_date >= ?2)
                   AND c.segment_id = ?3",
                params![end.to_string(), start, seg],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(DISTINCT customer_id)
                 FROM transactions
                 WHERE trans_date <= ?1
                   AND (?2 IS NULL OR trans_date >= ?2)",
                params![end.to_string(), start],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Customers who had joined at or before `as_of`, optionally scoped to
    /// one segment.
    pub fn customer_count(
        &self,
        as_of: NaiveDate,
        segment_id: Option<i64>,
    ) -> AnalyticsResult<i64> {
        let count = match segment_id {
            Some(seg) => self.conn.query_row(
                "SELECT COUNT(*) FROM customer WHERE join_date <= ?1 AND segment_id = ?2",
                params![as_of.to_string(), seg],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM customer WHERE join_date <= ?1",
                params![as_of.to_string()],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Per-customer purchase counts inside `[start, end]`.
    pub fn purchase_counts_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AnalyticsResult<Vec<(CustomerId, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, COUNT(transaction_id)
             FROM transactions
             WHERE trans_date >= ?1 AND trans_date <= ?2
             GROUP BY customer_id",
        )?;
        let rows = stmt.query_map(params![start.to_string(), end.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
