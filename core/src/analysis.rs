//! Orchestrator: composes the subsystems into one comprehensive report.
//!
//! `comprehensive_analysis` is a read path with a documented side effect:
//! it starts with a full segmentation recompute, so persisted segment
//! assignments are overwritten on every call. Callers treating it as a pure
//! query will still observe mutated `segment_id` columns.

use std::collections::HashSet;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::ModelDir,
    churn::{self, ChurnModelMeta, ChurnPrediction, RiskLevel},
    config::{AnalyticsConfig, DEFAULT_WINDOW_DAYS},
    error::{AnalyticsError, AnalyticsResult},
    next_purchase::{self, NextPurchaseMeta, NextPurchasePrediction},
    rfm::{self, RfmStats},
    segmentation::{self, Segment, SegmentationSummary},
    store::LedgerStore,
    types::CustomerId,
};

/// High-risk examples embedded in the churn summary.
const TOP_RISK_EXAMPLES: usize = 5;
/// Batch size for the next-purchase section of the report.
const BATCH_PREDICTIONS: usize = 20;
/// Trailing window for the recent-activity rate.
const RECENT_ACTIVITY_DAYS: i64 = 30;

// ── Report types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnSummary {
    pub customers:           i64,
    pub average_probability: f64,
    pub high_risk_count:     i64,
    pub medium_risk_count:   i64,
    pub low_risk_count:      i64,
    pub top_risk:            Vec<ChurnPrediction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionStatistics {
    pub order_count:          i64,
    pub total_revenue:        f64,
    pub average_order_value:  f64,
    pub max_order_value:      f64,
    pub conversion_rate:      f64,
    pub recent_activity_rate: f64,
}

/// Month-anchored activity rates recovered from the original report layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRates {
    pub retention_rate:       Option<f64>,
    pub repeat_purchase_rate: Option<f64>,
    pub high_value_share:     Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub as_of:          NaiveDate,
    pub category_id:    Option<i64>,
    pub segmentation:   SegmentationSummary,
    pub churn:          ChurnSummary,
    pub next_purchases: Vec<NextPurchasePrediction>,
    pub consumption:    ConsumptionStatistics,
    pub rates:          ActivityRates,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// A fully wired analytics engine over one ledger store and one model
/// directory. All methods are synchronous and take an explicit `as_of`;
/// "today" defaults belong to the caller at the orchestration boundary
/// (see [`crate::rfm::parse_as_of`]).
pub struct AnalyticsEngine {
    store:  LedgerStore,
    models: ModelDir,
    config: AnalyticsConfig,
}

impl AnalyticsEngine {
    pub fn new(store: LedgerStore, models: ModelDir, config: AnalyticsConfig) -> Self {
        Self {
            store,
            models,
            config,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    // ── Subsystem façade ───────────────────────────────────────────

    pub fn build_rfm(&self, as_of: NaiveDate, window_days: i64) -> AnalyticsResult<Vec<RfmStats>> {
        rfm::build_rfm(&self.store, as_of, window_days)
    }

    pub fn recompute_segments(
        &self,
        as_of: NaiveDate,
        window_days: i64,
    ) -> AnalyticsResult<SegmentationSummary> {
        segmentation::recompute_segments(&self.store, &self.config.thresholds, as_of, window_days)
    }

    pub fn train_churn(
        &self,
        as_of: NaiveDate,
        window_days: i64,
        churn_threshold_days: i64,
    ) -> AnalyticsResult<ChurnModelMeta> {
        churn::train(
            &self.store,
            &self.models,
            &self.config.thresholds,
            as_of,
            window_days,
            churn_threshold_days,
            &self.config.churn,
        )
    }

    pub fn predict_churn(
        &self,
        as_of: NaiveDate,
        window_days: i64,
    ) -> AnalyticsResult<Vec<ChurnPrediction>> {
        churn::predict(
            &self.store,
            &self.models,
            &self.config.thresholds,
            &self.config.heuristic,
            as_of,
            window_days,
        )
    }

    pub fn predict_churn_for_customer(
        &self,
        customer_id: CustomerId,
        as_of: NaiveDate,
        window_days: i64,
    ) -> AnalyticsResult<ChurnPrediction> {
        churn::predict_for_customer(
            &self.store,
            &self.models,
            &self.config.thresholds,
            &self.config.heuristic,
            customer_id,
            as_of,
            window_days,
        )
    }

    pub fn train_next_purchase(&self, as_of: NaiveDate) -> AnalyticsResult<NextPurchaseMeta> {
        next_purchase::train(&self.store, &self.models, as_of, &self.config.next_purchase)
    }

    pub fn predict_next_purchase(
        &self,
        customer_id: CustomerId,
        as_of: NaiveDate,
    ) -> AnalyticsResult<NextPurchasePrediction> {
        next_purchase::predict(&self.store, &self.models, customer_id, as_of)
    }

    pub fn predict_next_purchase_batch(
        &self,
        as_of: NaiveDate,
        top_n: Option<usize>,
    ) -> AnalyticsResult<Vec<NextPurchasePrediction>> {
        next_purchase::predict_batch(&self.store, &self.models, as_of, top_n)
    }

    // ── Comprehensive analysis ─────────────────────────────────────

    pub fn comprehensive_analysis(
        &self,
        as_of: NaiveDate,
        category: Option<Segment>,
    ) -> AnalyticsResult<AnalysisReport> {
        let window_days = DEFAULT_WINDOW_DAYS;
        let category_id = category.map(Segment::id);

        // 1. Full recompute, the report's one mutating step.
        let segmentation = self.recompute_segments(as_of, window_days)?;

        // Scope filter, resolved against the assignments just written.
        let scope: Option<HashSet<CustomerId>> = match category_id {
            None => None,
            Some(id) => Some(
                self.store
                    .all_customers()?
                    .into_iter()
                    .filter(|c| c.segment_id == Some(id))
                    .map(|c| c.customer_id)
                    .collect(),
            ),
        };
        let in_scope = |id: CustomerId| scope.as_ref().map_or(true, |s| s.contains(&id));

        // 2. Churn over the (possibly scoped) population.
        let churn_rows: Vec<ChurnPrediction> = self
            .predict_churn(as_of, window_days)?
            .into_iter()
            .filter(|row| in_scope(row.customer_id))
            .collect();
        let churn = summarize_churn(churn_rows);

        // 3. Next-purchase batch; a cold-start engine reports an empty
        //    section instead of failing the whole analysis.
        let next_purchases = match self.predict_next_purchase_batch(as_of, Some(BATCH_PREDICTIONS))
        {
            Ok(rows) => rows.into_iter().filter(|p| in_scope(p.customer_id)).collect(),
            Err(AnalyticsError::ModelNotTrained { .. })
            | Err(AnalyticsError::DependencyUnavailable { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        // 4. Consumption statistics.
        let consumption = self.consumption_statistics(as_of, category_id)?;

        // 5. Month-anchored rates (always population-wide).
        let rates = self.activity_rates(as_of, &segmentation)?;

        Ok(AnalysisReport {
            as_of,
            category_id,
            segmentation,
            churn,
            next_purchases,
            consumption,
            rates,
        })
    }

    fn consumption_statistics(
        &self,
        as_of: NaiveDate,
        segment_id: Option<i64>,
    ) -> AnalyticsResult<ConsumptionStatistics> {
        let orders = self.store.order_stats(as_of, segment_id)?;
        let customers = self.store.customer_count(as_of, segment_id)?;
        let buyers_ever = self.store.buyer_count(None, as_of, segment_id)?;
        let recent_start = as_of - Duration::days(RECENT_ACTIVITY_DAYS);
        let buyers_recent = self.store.buyer_count(Some(recent_start), as_of, segment_id)?;

        Ok(ConsumptionStatistics {
            order_count:          orders.order_count,
            total_revenue:        orders.total_revenue,
            average_order_value:  safe_div(orders.total_revenue, orders.order_count as f64),
            max_order_value:      orders.max_order_value,
            conversion_rate:      safe_div(buyers_ever as f64, customers as f64),
            recent_activity_rate: safe_div(buyers_recent as f64, buyers_ever as f64),
        })
    }

    fn activity_rates(
        &self,
        as_of: NaiveDate,
        segmentation: &SegmentationSummary,
    ) -> AnalyticsResult<ActivityRates> {
        let month_start = as_of.with_day(1).unwrap_or(as_of);
        let prev_month_end = month_start - Duration::days(1);
        let prev_month_start = prev_month_end.with_day(1).unwrap_or(prev_month_end);

        // Retention: buyers active in both the previous and current month.
        let prev_buyers: HashSet<CustomerId> = self
            .store
            .buyers_between(prev_month_start, prev_month_end)?
            .into_iter()
            .collect();
        let current_buyers: HashSet<CustomerId> = self
            .store
            .buyers_between(month_start, as_of)?
            .into_iter()
            .collect();
        let retention_rate = if prev_buyers.is_empty() {
            None
        } else {
            let retained = prev_buyers.intersection(&current_buyers).count();
            Some(retained as f64 / prev_buyers.len() as f64)
        };

        // Repeat purchase: ≥2 orders this month among this month's buyers.
        let month_counts = self.store.purchase_counts_between(month_start, as_of)?;
        let repeat_purchase_rate = if month_counts.is_empty() {
            None
        } else {
            let repeat = month_counts.iter().filter(|(_, n)| *n >= 2).count();
            Some(repeat as f64 / month_counts.len() as f64)
        };

        // Share of the population currently assigned to the loyal segment.
        let loyal = segmentation
            .segments
            .iter()
            .find(|c| c.segment_id == Segment::Loyal.id())
            .map_or(0, |c| c.customers);
        let high_value_share = if segmentation.total_customers == 0 {
            None
        } else {
            Some(loyal as f64 / segmentation.total_customers as f64)
        };

        Ok(ActivityRates {
            retention_rate,
            repeat_purchase_rate,
            high_value_share,
        })
    }
}

fn summarize_churn(rows: Vec<ChurnPrediction>) -> ChurnSummary {
    let customers = rows.len() as i64;
    let average_probability = if rows.is_empty() {
        0.0
    } else {
        rows.iter().map(|r| r.probability).sum::<f64>() / rows.len() as f64
    };
    let count_level = |level: RiskLevel| rows.iter().filter(|r| r.risk_level == level).count() as i64;

    ChurnSummary {
        customers,
        average_probability,
        high_risk_count:   count_level(RiskLevel::High),
        medium_risk_count: count_level(RiskLevel::Medium),
        low_risk_count:    count_level(RiskLevel::Low),
        // Rows arrive sorted descending by probability.
        top_risk: rows.into_iter().take(TOP_RISK_EXAMPLES).collect(),
    }
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
