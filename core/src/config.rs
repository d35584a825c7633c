//! Engine configuration.
//!
//! Every threshold and constant the analytics engine depends on lives here as
//! a named value with a documented default. The score cutoffs and the
//! heuristic normalization constants are domain-tuned; they are carried as
//! configuration, not re-derived from the data, so segment boundaries stay
//! stable and reproducible across runs. Treat changes to them as a business
//! decision, not a code change.

use serde::{Deserialize, Serialize};

/// Trailing window over which frequency/monetary are aggregated.
pub const DEFAULT_WINDOW_DAYS: i64 = 365;

/// Length of the future observation window used for churn labels.
pub const DEFAULT_CHURN_THRESHOLD_DAYS: i64 = 90;

/// Risk-level cut points on the churn probability.
pub const RISK_LEVEL_HIGH: f64 = 0.66;
pub const RISK_LEVEL_MEDIUM: f64 = 0.33;

/// Cutoff tables mapping raw RFM statistics to ordinal 1..=5 scores.
///
/// Each array holds the cutoffs for scores 5, 4, 3, 2 in order; anything
/// past the last cutoff scores 1. Recency cutoffs are upper bounds
/// (fewer days since last purchase is better); frequency and monetary
/// cutoffs are lower bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub recency_days: [i64; 4],
    pub frequency:    [i64; 4],
    pub monetary:     [f64; 4],
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            recency_days: [30, 60, 90, 120],
            frequency:    [10, 7, 4, 2],
            monetary:     [2500.0, 1000.0, 500.0, 100.0],
        }
    }
}

/// Closed-form churn risk used when no trained classifier is present.
///
/// The saturation constants (180 days, 6 purchases, 10 000 monetary units)
/// are inherited domain values without a documented derivation; they are
/// flagged for business validation rather than silently retuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicRisk {
    pub recency_saturation_days: f64,
    pub frequency_saturation:    f64,
    pub monetary_saturation:     f64,
    pub recency_weight:          f64,
    pub frequency_weight:        f64,
    pub monetary_weight:         f64,
}

impl Default for HeuristicRisk {
    fn default() -> Self {
        Self {
            recency_saturation_days: 180.0,
            frequency_saturation:    6.0,
            monetary_saturation:     10_000.0,
            recency_weight:          0.5,
            frequency_weight:        0.3,
            monetary_weight:         0.2,
        }
    }
}

/// Hyperparameters for the gradient-boosted churn classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnHyperparams {
    pub iterations:    usize,
    pub depth:         usize,
    pub learning_rate: f64,
    /// Fraction of each label class held out for validation.
    pub val_size:      f64,
    pub seed:          u64,
}

impl Default for ChurnHyperparams {
    fn default() -> Self {
        Self {
            iterations:    300,
            depth:         6,
            learning_rate: 0.1,
            val_size:      0.2,
            seed:          42,
        }
    }
}

/// Hyperparameters for the next-purchase sequence model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPurchaseHyperparams {
    /// Minimum historical purchases a customer needs to contribute a
    /// training sequence (plus one more transaction for the target).
    pub min_transactions: usize,
    pub sequence_length:  usize,
    pub hidden_size:      usize,
    pub epochs:           usize,
    pub learning_rate:    f64,
    pub batch_size:       usize,
    pub val_split:        f64,
    pub seed:             u64,
}

impl Default for NextPurchaseHyperparams {
    fn default() -> Self {
        Self {
            min_transactions: 3,
            sequence_length:  10,
            hidden_size:      32,
            epochs:           120,
            learning_rate:    1e-3,
            batch_size:       32,
            val_split:        0.2,
            seed:             42,
        }
    }
}

/// Top-level configuration for a fully wired engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub thresholds:    ScoreThresholds,
    pub heuristic:     HeuristicRisk,
    pub churn:         ChurnHyperparams,
    pub next_purchase: NextPurchaseHyperparams,
}
