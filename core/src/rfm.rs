//! Feature aggregation: raw Recency/Frequency/Monetary statistics.
//!
//! Recency is measured over *all* history (days dormant is meaningful
//! regardless of the analysis window); frequency and monetary are counted
//! only inside the trailing window ending at the as-of date, so they stay
//! comparable across runs. Customers with zero lifetime transactions have
//! no defined recency and are excluded.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AnalyticsError, AnalyticsResult},
    store::LedgerStore,
    types::CustomerId,
};

/// Raw per-customer statistics, recomputed fresh on every call and never
/// persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfmStats {
    pub customer_id:  CustomerId,
    pub recency_days: i64,
    pub frequency:    i64,
    pub monetary:     f64,
}

/// Parse an optional ISO `YYYY-MM-DD` as-of string, defaulting to today.
///
/// This is the only place "today" enters the engine; everything downstream
/// takes an explicit `NaiveDate` so a fixed input always reproduces the
/// same output.
pub fn parse_as_of(value: Option<&str>) -> AnalyticsResult<NaiveDate> {
    match value {
        None => Ok(chrono::Local::now().date_naive()),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
            AnalyticsError::InvalidDate {
                value: s.to_string(),
            }
        }),
    }
}

/// One entry per customer with at least one transaction at or before
/// `as_of`, ordered by customer id.
pub fn build_rfm(
    store: &LedgerStore,
    as_of: NaiveDate,
    window_days: i64,
) -> AnalyticsResult<Vec<RfmStats>> {
    let window_start = as_of - Duration::days(window_days);

    let last_dates = store.last_purchase_dates(as_of)?;
    let window: HashMap<CustomerId, (i64, f64)> = store
        .window_stats(window_start, as_of)?
        .into_iter()
        .map(|(cid, freq, money)| (cid, (freq, money)))
        .collect();

    let stats = last_dates
        .into_iter()
        .map(|(customer_id, last_date)| {
            let (frequency, monetary) = window.get(&customer_id).copied().unwrap_or((0, 0.0));
            RfmStats {
                customer_id,
                recency_days: (as_of - last_date).num_days(),
                frequency,
                monetary,
            }
        })
        .collect();

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_of_parses_iso_dates() {
        let d = parse_as_of(Some("2024-03-15")).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn as_of_rejects_malformed_input() {
        assert!(matches!(
            parse_as_of(Some("15/03/2024")),
            Err(AnalyticsError::InvalidDate { .. })
        ));
        assert!(matches!(
            parse_as_of(Some("not-a-date")),
            Err(AnalyticsError::InvalidDate { .. })
        ));
    }
}
