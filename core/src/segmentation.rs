//! Rule-based RFM segmentation.
//!
//! Raw statistics are discretized against fixed cutoff tables, then run
//! through an ordered rule list. The rule order IS the contract: later
//! rules are deliberately broader catch-alls, and the first match wins.
//! Two reserved segments bypass the rules entirely: customers who joined
//! in the current calendar month, and customers who have never purchased.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    config::ScoreThresholds,
    error::AnalyticsResult,
    rfm::RfmStats,
    store::LedgerStore,
    types::CustomerId,
};

// ── Segment enumeration ──────────────────────────────────────────────────────

/// The fixed segment enumeration shared with every consumer of the engine.
/// Ids are part of the external contract; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Loyal,
    PotentialHighValue,
    Normal,
    LowValue,
    Dormant,
    AtRisk,
    New,
    NoPurchaseYet,
}

impl Segment {
    pub fn id(self) -> i64 {
        match self {
            Segment::Loyal              => 1,
            Segment::PotentialHighValue => 2,
            Segment::Normal             => 3,
            Segment::LowValue           => 4,
            Segment::Dormant            => 5,
            Segment::AtRisk             => 6,
            Segment::New                => 7,
            Segment::NoPurchaseYet      => 8,
        }
    }

    pub fn from_id(id: i64) -> Option<Segment> {
        match id {
            1 => Some(Segment::Loyal),
            2 => Some(Segment::PotentialHighValue),
            3 => Some(Segment::Normal),
            4 => Some(Segment::LowValue),
            5 => Some(Segment::Dormant),
            6 => Some(Segment::AtRisk),
            7 => Some(Segment::New),
            8 => Some(Segment::NoPurchaseYet),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Segment::Loyal              => "loyal",
            Segment::PotentialHighValue => "potential_high_value",
            Segment::Normal             => "normal",
            Segment::LowValue           => "low_value",
            Segment::Dormant            => "dormant",
            Segment::AtRisk             => "at_risk",
            Segment::New                => "new",
            Segment::NoPurchaseYet      => "no_purchase_yet",
        }
    }
}

// ── Scoring ──────────────────────────────────────────────────────────────────

/// Ordinal R/F/M scores, each in 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfmScores {
    pub r: u8,
    pub f: u8,
    pub m: u8,
}

impl RfmScores {
    pub fn total(&self) -> u8 {
        self.r + self.f + self.m
    }
}

/// Discretize raw statistics against the cutoff tables.
pub fn score(thresholds: &ScoreThresholds, raw: &RfmStats) -> RfmScores {
    let r = match raw.recency_days {
        d if d <= thresholds.recency_days[0] => 5,
        d if d <= thresholds.recency_days[1] => 4,
        d if d <= thresholds.recency_days[2] => 3,
        d if d <= thresholds.recency_days[3] => 2,
        _ => 1,
    };
    let f = match raw.frequency {
        n if n >= thresholds.frequency[0] => 5,
        n if n >= thresholds.frequency[1] => 4,
        n if n >= thresholds.frequency[2] => 3,
        n if n >= thresholds.frequency[3] => 2,
        _ => 1,
    };
    let m = match raw.monetary {
        v if v >= thresholds.monetary[0] => 5,
        v if v >= thresholds.monetary[1] => 4,
        v if v >= thresholds.monetary[2] => 3,
        v if v >= thresholds.monetary[3] => 2,
        _ => 1,
    };
    RfmScores { r, f, m }
}

// ── Classification rules ─────────────────────────────────────────────────────

type RulePredicate = fn(&RfmScores) -> bool;

/// The ordered rule list. Evaluated top to bottom; the first predicate that
/// holds decides the segment. Keep the order: low_value must be tested
/// before the broader at_risk catch-all or it can never match.
pub const RULES: [(RulePredicate, Segment); 5] = [
    (|s| s.r >= 4 && s.f >= 5 && s.m >= 5, Segment::Loyal),
    (|s| s.r >= 3 && s.f >= 3 && s.m >= 4, Segment::PotentialHighValue),
    (|s| s.r <= 2 && s.f >= 3 && s.m >= 3, Segment::Dormant),
    (|s| s.r == 1 && s.f == 1 && s.m == 1, Segment::LowValue),
    (|s| s.r <= 2 && (s.f <= 2 || s.m <= 2), Segment::AtRisk),
];

/// Assign a segment from ordinal scores. Rules are tried in their fixed
/// priority order; customers matching nothing are Normal.
pub fn classify(scores: &RfmScores) -> Segment {
    for (predicate, segment) in RULES.iter() {
        if predicate(scores) {
            return *segment;
        }
    }
    Segment::Normal
}

// ── Full recompute pass ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCount {
    pub segment_id: i64,
    pub label:      String,
    pub customers:  i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationSummary {
    pub as_of:           NaiveDate,
    pub total_customers: i64,
    pub segments:        Vec<SegmentCount>,
}

/// Recompute and persist the segment assignment of every customer.
///
/// Overwrites `customer.segment_id` (and the `rfm_score` row for customers
/// with purchase history) for the whole population. Running it twice on
/// unchanged ledger data yields identical assignments, so an interrupted
/// pass is recovered by simply running it again.
pub fn recompute_segments(
    store: &LedgerStore,
    thresholds: &ScoreThresholds,
    as_of: NaiveDate,
    window_days: i64,
) -> AnalyticsResult<SegmentationSummary> {
    let customers = store.all_customers()?;
    let rfm: HashMap<CustomerId, RfmStats> =
        crate::rfm::build_rfm(store, as_of, window_days)?
            .into_iter()
            .map(|s| (s.customer_id, s))
            .collect();

    let mut counts: HashMap<Segment, i64> = HashMap::new();

    for customer in &customers {
        let segment = if joined_in_month(customer.join_date, as_of) {
            Segment::New
        } else {
            match rfm.get(&customer.customer_id) {
                None => Segment::NoPurchaseYet,
                Some(raw) => {
                    let scores = score(thresholds, raw);
                    let segment = classify(&scores);
                    store.upsert_rfm_score(customer.customer_id, &scores, segment.id(), as_of)?;
                    segment
                }
            }
        };
        store.set_customer_segment(customer.customer_id, segment.id(), as_of)?;
        *counts.entry(segment).or_insert(0) += 1;
    }

    let mut segments: Vec<SegmentCount> = counts
        .into_iter()
        .map(|(segment, customers)| SegmentCount {
            segment_id: segment.id(),
            label:      segment.label().to_string(),
            customers,
        })
        .collect();
    segments.sort_by_key(|c| c.segment_id);

    log::info!(
        "segmentation: recomputed {} customers as of {as_of}",
        customers.len()
    );

    Ok(SegmentationSummary {
        as_of,
        total_customers: customers.len() as i64,
        segments,
    })
}

/// Joined inside the calendar month that contains `as_of`.
fn joined_in_month(join_date: NaiveDate, as_of: NaiveDate) -> bool {
    join_date.year() == as_of.year() && join_date.month() == as_of.month()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(r: u8, f: u8, m: u8) -> RfmScores {
        RfmScores { r, f, m }
    }

    #[test]
    fn rule_order_first_match_wins() {
        // (5,5,5) matches both loyal and potential_high_value; loyal is first.
        assert_eq!(classify(&scores(5, 5, 5)), Segment::Loyal);
        // (1,1,1) matches both low_value and at_risk; low_value is first.
        assert_eq!(classify(&scores(1, 1, 1)), Segment::LowValue);
    }

    #[test]
    fn broader_at_risk_catches_partial_lows() {
        assert_eq!(classify(&scores(2, 1, 3)), Segment::AtRisk);
        assert_eq!(classify(&scores(1, 2, 2)), Segment::AtRisk);
    }

    #[test]
    fn unmatched_scores_default_to_normal() {
        assert_eq!(classify(&scores(4, 2, 3)), Segment::Normal);
        assert_eq!(classify(&scores(3, 4, 3)), Segment::Normal);
    }

    #[test]
    fn segment_ids_round_trip() {
        for id in 1..=8 {
            let segment = Segment::from_id(id).unwrap();
            assert_eq!(segment.id(), id);
        }
        assert!(Segment::from_id(0).is_none());
        assert!(Segment::from_id(9).is_none());
    }
}
