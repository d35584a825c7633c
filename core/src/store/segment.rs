use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::LedgerStore;
use crate::{error::AnalyticsResult, types::CustomerId};

#[derive(Debug, Clone, Copy)]
pub struct RfmScoreRow {
    pub r_score:    i64,
    pub f_score:    i64,
    pub m_score:    i64,
    pub rfm_total:  i64,
    pub segment_id: i64,
}

impl LedgerStore {
    // ── Segment assignments ────────────────────────────────────────

    pub fn upsert_rfm_score(
        &self,
        customer_id: CustomerId,
        scores: &crate::segmentation::RfmScores,
        segment_id: i64,
        updated_at: NaiveDate,
    ) -> AnalyticsResult<()> {
        self.conn.execute(
            "INSERT INTO rfm_score (customer_id, r_score, f_score, m_score, rfm_total, segment_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(customer_id) DO UPDATE SET
                r_score = excluded.r_score,
                f_score = excluded.f_score,
                m_score = excluded.m_score,
                rfm_total = excluded.rfm_total,
                segment_id = excluded.segment_id,
                updated_at = excluded.updated_at",
            params![
                customer_id,
                scores.r as i64,
                scores.f as i64,
                scores.m as i64,
                scores.total() as i64,
                segment_id,
                updated_at.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn set_customer_segment(
        &self,
        customer_id: CustomerId,
        segment_id: i64,
        updated_at: NaiveDate,
    ) -> AnalyticsResult<()> {
        self.conn.execute(
            "UPDATE customer SET segment_id = ?1, segment_updated_at = ?2
             WHERE customer_id = ?3",
            params![segment_id, updated_at.to_string(), customer_id],
        )?;
        Ok(())
    }

    pub fn customer_segment(&self, customer_id: CustomerId) -> AnalyticsResult<Option<i64>> {
        let segment = self
            .conn
            .query_row(
                "SELECT segment_id FROM customer WHERE customer_id = ?1",
                params![customer_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(segment)
    }

    pub fn get_rfm_score(&self, customer_id: CustomerId) -> AnalyticsResult<Option<RfmScoreRow>> {
        self.conn
            .query_row(
                "SELECT r_score, f_score, m_score, rfm_total, segment_id
                 FROM rfm_score WHERE customer_id = ?1",
                params![customer_id],
                |row| {
                    Ok(RfmScoreRow {
                        r_score:    row.get(0)?,
                        f_score:    row.get(1)?,
                        m_score:    row.get(2)?,
                        rfm_total:  row.get(3)?,
                        segment_id: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Count of customers per assigned segment id. Customers never touched
    /// by a recompute pass (NULL segment) are not listed.
    pub fn segment_counts(&self) -> AnalyticsResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT segment_id, COUNT(*) FROM customer
             WHERE segment_id IS NOT NULL
             GROUP BY segment_id
             ORDER BY segment_id ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
