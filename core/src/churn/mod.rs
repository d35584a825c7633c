//! Churn risk subsystem.
//!
//! Serves churn probabilities for every customer with purchase history.
//! With a persisted classifier the probabilities come from the model, with
//! feature order read from the metadata sidecar; without one, a closed-form
//! heuristic over the raw RFM statistics keeps the prediction path available
//! (cold start is an expected state, never an error).
//!
//! Training labels come from a *future* observation window: a customer is a
//! churn case iff they have no purchase in `(as_of, as_of + threshold]`.
//! Labeling by recency at `as_of` would let the model read the label straight
//! off its own input; that variant is a known anti-pattern and is not
//! implemented.

#[cfg(feature = "boosted-trees")]
mod boosted;
pub mod metrics;

#[cfg(feature = "boosted-trees")]
pub use boosted::GradientBoostedTrees;

use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::ModelDir,
    config::{ChurnHyperparams, HeuristicRisk, ScoreThresholds, RISK_LEVEL_HIGH, RISK_LEVEL_MEDIUM},
    error::{AnalyticsError, AnalyticsResult},
    rfm::{build_rfm, RfmStats},
    segmentation::{score, RfmScores},
    store::LedgerStore,
    types::CustomerId,
};

/// Feature order recorded in the sidecar at training time.
pub const CHURN_FEATURE_NAMES: [&str; 3] = ["r_score", "f_score", "m_score"];

/// The compile-time backend the classifier needs.
pub const CLASSIFIER_BACKEND: &str = "boosted-trees";

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn from_probability(p: f64) -> Self {
        if p >= RISK_LEVEL_HIGH {
            RiskLevel::High
        } else if p >= RISK_LEVEL_MEDIUM {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// One prediction row. Flat, plain-numeric, safe for direct JSON
/// serialization by the consuming layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnPrediction {
    pub customer_id:  CustomerId,
    pub recency_days: i64,
    pub frequency:    i64,
    pub monetary:     f64,
    pub r_score:      i64,
    pub f_score:      i64,
    pub m_score:      i64,
    pub probability:  f64,
    pub risk_level:   RiskLevel,
}

/// Metadata sidecar persisted next to the model blob; doubles as the
/// training report returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnModelMeta {
    pub model_id:             String,
    pub as_of:                NaiveDate,
    pub window_days:          i64,
    pub churn_threshold_days: i64,
    pub feature_names:        Vec<String>,
    pub samples_total:        usize,
    pub samples_train:        usize,
    pub samples_val:          usize,
    /// False when the validation split was degenerate and the metrics below
    /// are training-set figures, reported for reference only.
    pub generalizes:          bool,
    pub val_accuracy:         Option<f64>,
    pub val_auc:              Option<f64>,
    pub val_f1:               Option<f64>,
    pub val_precision:        Option<f64>,
    pub val_recall:           Option<f64>,
}

// ── Labels ───────────────────────────────────────────────────────────────────

/// Future-window churn labels: 1 iff the customer has no purchase in
/// `(as_of, as_of + churn_threshold_days]`.
pub fn future_window_labels(
    store: &LedgerStore,
    rfm: &[RfmStats],
    as_of: NaiveDate,
    churn_threshold_days: i64,
) -> AnalyticsResult<Vec<u8>> {
    let start = as_of + Duration::days(1);
    let end = as_of + Duration::days(churn_threshold_days);
    let future_buyers: HashSet<CustomerId> = store.buyers_between(start, end)?.into_iter().collect();
    Ok(rfm
        .iter()
        .map(|s| u8::from(!future_buyers.contains(&s.customer_id)))
        .collect())
}

// ── Heuristic ────────────────────────────────────────────────────────────────

/// Closed-form risk score in [0, 1]. Monotone non-decreasing in recency,
/// non-increasing in frequency and monetary.
pub fn heuristic_risk(h: &HeuristicRisk, stats: &RfmStats) -> f64 {
    let r = stats.recency_days.max(0) as f64;
    let f = stats.frequency.max(0) as f64;
    let m = stats.monetary.max(0.0);

    let r_norm = (r / h.recency_saturation_days).min(1.0);
    let f_norm = 1.0 - (f / h.frequency_saturation).min(1.0);
    let m_norm = 1.0 - (m / h.monetary_saturation).min(1.0);

    (h.recency_weight * r_norm + h.frequency_weight * f_norm + h.monetary_weight * m_norm)
        .clamp(0.0, 1.0)
}

// ── Training ─────────────────────────────────────────────────────────────────

/// Train the churn classifier and persist it atomically-from-the-caller's
/// view: nothing is written until the fit and metrics have completed, so a
/// failed run leaves any previous artifact untouched.
#[allow(clippy::too_many_arguments)]
pub fn train(
    store: &LedgerStore,
    models: &ModelDir,
    thresholds: &ScoreThresholds,
    as_of: NaiveDate,
    window_days: i64,
    churn_threshold_days: i64,
    hp: &ChurnHyperparams,
) -> AnalyticsResult<ChurnModelMeta> {
    #[cfg(not(feature = "boosted-trees"))]
    {
        let _ = (store, models, thresholds, as_of, window_days, churn_threshold_days, hp);
        Err(AnalyticsError::DependencyUnavailable {
            backend: CLASSIFIER_BACKEND,
        })
    }
    #[cfg(feature = "boosted-trees")]
    {
        train_inner(store, models, thresholds, as_of, window_days, churn_threshold_days, hp)
    }
}

#[cfg(feature = "boosted-trees")]
fn train_inner(
    store: &LedgerStore,
    models: &ModelDir,
    thresholds: &ScoreThresholds,
    as_of: NaiveDate,
    window_days: i64,
    churn_threshold_days: i64,
    hp: &ChurnHyperparams,
) -> AnalyticsResult<ChurnModelMeta> {
    use ndarray::Array2;

    let rfm = build_rfm(store, as_of, window_days)?;
    if rfm.is_empty() {
        return Err(AnalyticsError::NoTrainingData { as_of });
    }

    // The classifier consumes ordinal scores, not raw magnitudes, so it
    // stays scale-invariant across windows.
    let n = rfm.len();
    let mut flat = Vec::with_capacity(n * 3);
    for stats in &rfm {
        let s = score(thresholds, stats);
        flat.extend_from_slice(&[f64::from(s.r), f64::from(s.f), f64::from(s.m)]);
    }
    let x = Array2::from_shape_vec((n, 3), flat)
        .map_err(|e| AnalyticsError::Other(anyhow::anyhow!(e)))?;

    let y = future_window_labels(store, &rfm, as_of, churn_threshold_days)?;
    let n_pos = y.iter().filter(|&&l| l == 1).count();
    let n_neg = n - n_pos;

    // Class-balancing sample weights.
    let weights: Vec<f64> = y
        .iter()
        .map(|&label| {
            if label == 1 {
                n as f64 / (2.0 * n_pos.max(1) as f64)
            } else {
                n as f64 / (2.0 * n_neg.max(1) as f64)
            }
        })
        .collect();

    let splittable = n_pos > 0 && n_neg > 0 && hp.val_size > 0.0 && hp.val_size < 1.0;
    let (train_idx, val_idx) = if splittable {
        let mut rng = seeded_rng(hp.seed);
        stratified_split(&y, hp.val_size, &mut rng)
    } else {
        ((0..n).collect(), Vec::new())
    };

    let val_labels: Vec<u8> = val_idx.iter().map(|&i| y[i]).collect();
    let val_has_both = val_labels.iter().any(|&l| l == 1) && val_labels.iter().any(|&l| l == 0);

    let (fit_idx, eval_idx, generalizes) = if splittable && val_has_both {
        (train_idx, val_idx, true)
    } else {
        // Degenerate split: train on everything, report training-set
        // figures flagged as non-generalizing.
        ((0..n).collect::<Vec<_>>(), (0..n).collect::<Vec<_>>(), false)
    };

    let x_fit = select_rows(&x, &fit_idx);
    let y_fit: Vec<u8> = fit_idx.iter().map(|&i| y[i]).collect();
    let w_fit: Vec<f64> = fit_idx.iter().map(|&i| weights[i]).collect();

    let model = GradientBoostedTrees::fit(
        &x_fit,
        &y_fit,
        &w_fit,
        hp.iterations,
        hp.depth,
        hp.learning_rate,
    );

    let eval_true: Vec<u8> = eval_idx.iter().map(|&i| y[i]).collect();
    let eval_scores: Vec<f64> = eval_idx.iter().map(|&i| model.predict_proba(x.row(i))).collect();
    let eval_pred: Vec<u8> = eval_scores.iter().map(|&p| u8::from(p >= 0.5)).collect();

    let meta = ChurnModelMeta {
        model_id:             uuid::Uuid::new_v4().to_string(),
        as_of,
        window_days,
        churn_threshold_days,
        feature_names:        CHURN_FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        samples_total:        n,
        samples_train:        fit_idx.len(),
        samples_val:          if generalizes { eval_idx.len() } else { 0 },
        generalizes,
        val_accuracy:         Some(metrics::accuracy(&eval_true, &eval_pred)),
        val_auc:              metrics::roc_auc(&eval_true, &eval_scores),
        val_f1:               Some(metrics::f1(&eval_true, &eval_pred)),
        val_precision:        Some(metrics::precision(&eval_true, &eval_pred)),
        val_recall:           Some(metrics::recall(&eval_true, &eval_pred)),
    };

    // Persist only now that the run has fully succeeded.
    models.save_json(&models.churn_model_path(), &model)?;
    models.save_json(&models.churn_meta_path(), &meta)?;

    log::info!(
        "churn: trained model {} on {} samples ({} churn / {} retained), val_auc={:?}",
        meta.model_id,
        n,
        n_pos,
        n_neg,
        meta.val_auc,
    );

    Ok(meta)
}

#[cfg(feature = "boosted-trees")]
fn seeded_rng(seed: u64) -> rand_pcg::Pcg64Mcg {
    use rand::SeedableRng;
    rand_pcg::Pcg64Mcg::seed_from_u64(seed)
}

/// Per-class shuffle, holding out `val_size` of each class.
#[cfg(feature = "boosted-trees")]
fn stratified_split(
    labels: &[u8],
    val_size: f64,
    rng: &mut rand_pcg::Pcg64Mcg,
) -> (Vec<usize>, Vec<usize>) {
    use rand::seq::SliceRandom;

    let mut train = Vec::new();
    let mut val = Vec::new();
    for class in [0u8, 1u8] {
        let mut idx: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == class)
            .map(|(i, _)| i)
            .collect();
        idx.shuffle(rng);
        let n_val = (idx.len() as f64 * val_size).floor() as usize;
        val.extend_from_slice(&idx[..n_val]);
        train.extend_from_slice(&idx[n_val..]);
    }
    (train, val)
}

#[cfg(feature = "boosted-trees")]
fn select_rows(x: &ndarray::Array2<f64>, indices: &[usize]) -> ndarray::Array2<f64> {
    let mut out = ndarray::Array2::zeros((indices.len(), x.ncols()));
    for (row, &i) in indices.iter().enumerate() {
        out.row_mut(row).assign(&x.row(i));
    }
    out
}

// ── Prediction ───────────────────────────────────────────────────────────────

/// Churn probability for every customer with purchase history, sorted by
/// descending probability (the "top N at-risk" contract).
pub fn predict(
    store: &LedgerStore,
    models: &ModelDir,
    thresholds: &ScoreThresholds,
    heuristic: &HeuristicRisk,
    as_of: NaiveDate,
    window_days: i64,
) -> AnalyticsResult<Vec<ChurnPrediction>> {
    let rfm = build_rfm(store, as_of, window_days)?;
    let scored: Vec<(RfmStats, RfmScores)> = rfm
        .into_iter()
        .map(|stats| {
            let s = score(thresholds, &stats);
            (stats, s)
        })
        .collect();

    #[cfg(feature = "boosted-trees")]
    {
        if let Some((model, meta)) = load_artifact(models)? {
            let rows = scored
                .iter()
                .map(|(stats, scores)| {
                    let features: Vec<f64> = meta
                        .feature_names
                        .iter()
                        .map(|name| feature_value(name, scores, stats))
                        .collect();
                    let features = ndarray::Array1::from_vec(features);
                    let p = model.predict_proba(features.view()).clamp(0.0, 1.0);
                    prediction_row(stats, scores, p)
                })
                .collect();
            return Ok(sort_by_risk(rows));
        }
    }
    #[cfg(not(feature = "boosted-trees"))]
    let _ = models;

    // No usable artifact: degrade to the heuristic, never error.
    let rows = scored
        .iter()
        .map(|(stats, scores)| prediction_row(stats, scores, heuristic_risk(heuristic, stats)))
        .collect();
    Ok(sort_by_risk(rows))
}

/// Single-customer lookup over the same computation as `predict`.
pub fn predict_for_customer(
    store: &LedgerStore,
    models: &ModelDir,
    thresholds: &ScoreThresholds,
    heuristic: &HeuristicRisk,
    customer_id: CustomerId,
    as_of: NaiveDate,
    window_days: i64,
) -> AnalyticsResult<ChurnPrediction> {
    predict(store, models, thresholds, heuristic, as_of, window_days)?
        .into_iter()
        .find(|row| row.customer_id == customer_id)
        .ok_or(AnalyticsError::CustomerNotFound { customer_id })
}

fn prediction_row(stats: &RfmStats, scores: &RfmScores, probability: f64) -> ChurnPrediction {
    ChurnPrediction {
        customer_id:  stats.customer_id,
        recency_days: stats.recency_days,
        frequency:    stats.frequency,
        monetary:     stats.monetary,
        r_score:      i64::from(scores.r),
        f_score:      i64::from(scores.f),
        m_score:      i64::from(scores.m),
        probability,
        risk_level:   RiskLevel::from_probability(probability),
    }
}

fn sort_by_risk(mut rows: Vec<ChurnPrediction>) -> Vec<ChurnPrediction> {
    rows.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.customer_id.cmp(&b.customer_id))
    });
    rows
}

#[cfg(feature = "boosted-trees")]
fn load_artifact(models: &ModelDir) -> AnalyticsResult<Option<(GradientBoostedTrees, ChurnModelMeta)>> {
    let model: Option<GradientBoostedTrees> = ModelDir::load_json(&models.churn_model_path())?;
    let meta: Option<ChurnModelMeta> = ModelDir::load_json(&models.churn_meta_path())?;
    // The sidecar is the source of truth for feature order; a blob without
    // one is unusable and falls through to the heuristic.
    Ok(model.zip(meta))
}

/// Resolve a sidecar feature name against the computed statistics. Sidecars
/// from older retrains may record raw-magnitude names.
#[cfg(feature = "boosted-trees")]
fn feature_value(name: &str, scores: &RfmScores, stats: &RfmStats) -> f64 {
    match name {
        "r_score" => f64::from(scores.r),
        "f_score" => f64::from(scores.f),
        "m_score" => f64::from(scores.m),
        "recency_days" => stats.recency_days as f64,
        "frequency" => stats.frequency as f64,
        "monetary" => stats.monetary,
        other => {
            log::warn!("churn: unknown feature '{other}' in model sidecar, substituting 0.0");
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeuristicRisk;

    fn stats(recency_days: i64, frequency: i64, monetary: f64) -> RfmStats {
        RfmStats {
            customer_id: 1,
            recency_days,
            frequency,
            monetary,
        }
    }

    #[test]
    fn heuristic_is_monotone_in_each_input() {
        let h = HeuristicRisk::default();
        // More dormant, holding the rest fixed: risk never drops.
        let mut prev = heuristic_risk(&h, &stats(0, 3, 500.0));
        for days in [10, 30, 90, 180, 400] {
            let next = heuristic_risk(&h, &stats(days, 3, 500.0));
            assert!(next >= prev);
            prev = next;
        }
        // More purchases: risk never rises.
        let mut prev = heuristic_risk(&h, &stats(60, 0, 500.0));
        for freq in [1, 2, 4, 6, 12] {
            let next = heuristic_risk(&h, &stats(60, freq, 500.0));
            assert!(next <= prev);
            prev = next;
        }
        // More spend: risk never rises.
        let mut prev = heuristic_risk(&h, &stats(60, 3, 0.0));
        for money in [100.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0] {
            let next = heuristic_risk(&h, &stats(60, 3, money));
            assert!(next <= prev);
            prev = next;
        }
    }

    #[test]
    fn risk_level_boundaries_are_exact() {
        assert_eq!(RiskLevel::from_probability(0.66), RiskLevel::High);
        assert_eq!(RiskLevel::from_probability(0.659), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.33), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.329), RiskLevel::Low);
    }
}
