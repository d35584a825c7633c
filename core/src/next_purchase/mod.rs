//! Next-purchase subsystem.
//!
//! Regresses the number of days until a customer's next purchase from the
//! sequence of their historical inter-purchase intervals and amounts. Each
//! sequence step carries six engineered features (interval, amount, running
//! count, running cumulative amount, running mean interval, running mean
//! amount), so both local and cumulative behavior are visible at every step.
//!
//! Short histories are left-padded with the mean of the available steps,
//! never with zeros, since zero-padding reads as "no purchase" to a recurrent
//! model and skews short-history customers toward overestimated intervals.
//!
//! Unlike churn, there is no heuristic fallback: serving without a trained
//! artifact is a hard `ModelNotTrained` error, because no cheap closed form
//! preserves the meaning of a sequence regression.

#[cfg(feature = "recurrent")]
mod recurrent;

#[cfg(feature = "recurrent")]
pub use recurrent::RecurrentRegressor;

use chrono::{Duration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    artifact::ModelDir,
    config::NextPurchaseHyperparams,
    error::{AnalyticsError, AnalyticsResult},
    store::LedgerStore,
    types::CustomerId,
};

/// Engineered features per sequence step.
pub const FEATURE_SIZE: usize = 6;

/// The compile-time backend the sequence model needs.
pub const SEQUENCE_BACKEND: &str = "recurrent";

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPurchasePrediction {
    pub customer_id:          CustomerId,
    pub last_purchase_date:   NaiveDate,
    pub predicted_days:       i64,
    pub predicted_date:       NaiveDate,
    pub avg_interval_history: f64,
    pub total_transactions:   i64,
}

/// Metadata sidecar for the sequence model; doubles as the training report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPurchaseMeta {
    pub model_id:         String,
    pub as_of:            NaiveDate,
    pub min_transactions: usize,
    pub sequence_length:  usize,
    pub feature_size:     usize,
    pub hidden_size:      usize,
    pub samples_total:    usize,
    pub samples_train:    usize,
    pub samples_val:      usize,
    pub val_mae:          f64,
    pub val_rmse:         f64,
    pub avg_target_days:  f64,
}

/// Standardization parameters fitted at training time. Persisted alongside
/// the model and reused unmodified at inference; refitting them on serving
/// data would silently shift every prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerParams {
    pub seq_mean:    Vec<f64>,
    pub seq_std:     Vec<f64>,
    pub target_mean: f64,
    pub target_std:  f64,
}

impl ScalerParams {
    pub fn fit(sequences: &[Array2<f64>], targets: &[f64]) -> Self {
        let mut sum = vec![0.0_f64; FEATURE_SIZE];
        let mut sum_sq = vec![0.0_f64; FEATURE_SIZE];
        let mut count = 0usize;
        for seq in sequences {
            for row in seq.rows() {
                for (j, v) in row.iter().enumerate() {
                    sum[j] += v;
                    sum_sq[j] += v * v;
                }
                count += 1;
            }
        }
        let n = count.max(1) as f64;
        let seq_mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let seq_std: Vec<f64> = sum_sq
            .iter()
            .zip(&seq_mean)
            .map(|(sq, mean)| ((sq / n - mean * mean).max(0.0)).sqrt() + 1e-8)
            .collect();

        let nt = targets.len().max(1) as f64;
        let target_mean = targets.iter().sum::<f64>() / nt;
        let target_var =
            targets.iter().map(|t| (t - target_mean) * (t - target_mean)).sum::<f64>() / nt;
        let target_std = target_var.sqrt() + 1e-8;

        Self {
            seq_mean,
            seq_std,
            target_mean,
            target_std,
        }
    }

    pub fn transform_sequence(&self, steps: &Array2<f64>) -> Array2<f64> {
        let mut out = steps.clone();
        for mut row in out.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - self.seq_mean[j]) / self.seq_std[j];
            }
        }
        out
    }

    pub fn standardize_target(&self, t: f64) -> f64 {
        (t - self.target_mean) / self.target_std
    }

    pub fn destandardize(&self, z: f64) -> f64 {
        z * self.target_std + self.target_mean
    }
}

// ── Sequence construction ────────────────────────────────────────────────────

/// Fixed-length feature sequence from interval/amount history.
///
/// Takes the trailing `sequence_length` entries and left-pads shorter
/// histories with the mean of the available entries. Running statistics are
/// computed over the padded sequence, matching what the model saw in
/// training.
pub fn build_feature_steps(
    intervals: &[f64],
    amounts: &[f64],
    sequence_length: usize,
) -> Array2<f64> {
    debug_assert_eq!(intervals.len(), amounts.len());
    debug_assert!(!intervals.is_empty());

    let start = intervals.len().saturating_sub(sequence_length);
    let window_i = &intervals[start..];
    let window_a = &amounts[start..];

    let pad_interval = mean(window_i);
    let pad_amount = mean(window_a);

    let pad_len = sequence_length - window_i.len();
    let mut seq_i = vec![pad_interval; pad_len];
    seq_i.extend_from_slice(window_i);
    let mut seq_a = vec![pad_amount; pad_len];
    seq_a.extend_from_slice(window_a);

    let mut steps = Array2::zeros((sequence_length, FEATURE_SIZE));
    let mut cum_amount = 0.0;
    let mut cum_interval = 0.0;
    for i in 0..sequence_length {
        cum_amount += seq_a[i];
        cum_interval += seq_i[i];
        let count = (i + 1) as f64;
        steps[[i, 0]] = seq_i[i];
        steps[[i, 1]] = seq_a[i];
        steps[[i, 2]] = count;
        steps[[i, 3]] = cum_amount;
        steps[[i, 4]] = cum_interval / count;
        steps[[i, 5]] = cum_amount / count;
    }
    steps
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Inter-purchase intervals in days and the amount preceding each interval.
fn intervals_and_amounts(purchases: &[crate::store::PurchaseRow]) -> (Vec<f64>, Vec<f64>) {
    let mut intervals = Vec::with_capacity(purchases.len().saturating_sub(1));
    let mut amounts = Vec::with_capacity(purchases.len().saturating_sub(1));
    for pair in purchases.windows(2) {
        intervals.push((pair[1].date - pair[0].date).num_days() as f64);
        amounts.push(pair[0].amount);
    }
    (intervals, amounts)
}

#[cfg(feature = "recurrent")]
struct TrainingSequence {
    steps:  Array2<f64>,
    target: f64,
}

/// One training sequence per customer with at least `min_transactions + 1`
/// purchases: the last interval is the regression target, the up-to-length
/// preceding intervals the input.
#[cfg(feature = "recurrent")]
fn build_training_sequences(
    store: &LedgerStore,
    as_of: NaiveDate,
    min_transactions: usize,
    sequence_length: usize,
) -> AnalyticsResult<Vec<TrainingSequence>> {
    let eligible = store.purchase_counts(as_of, (min_transactions + 1) as i64)?;
    let mut sequences = Vec::new();

    for (customer_id, _) in eligible {
        let purchases = store.purchases_for_customer(customer_id, as_of)?;
        let (intervals, amounts) = intervals_and_amounts(&purchases);
        // Need at least one real input step besides the target interval.
        if intervals.len() < min_transactions || intervals.len() < 2 {
            continue;
        }
        let input_len = intervals.len() - 1;
        let target = intervals[input_len];
        sequences.push(TrainingSequence {
            steps: build_feature_steps(&intervals[..input_len], &amounts[..input_len], sequence_length),
            target,
        });
    }

    Ok(sequences)
}

// ── Training ─────────────────────────────────────────────────────────────────

/// Train the sequence model and persist blob + scaler + sidecar, in that
/// order, only after the whole run has succeeded.
pub fn train(
    store: &LedgerStore,
    models: &ModelDir,
    as_of: NaiveDate,
    hp: &NextPurchaseHyperparams,
) -> AnalyticsResult<NextPurchaseMeta> {
    #[cfg(not(feature = "recurrent"))]
    {
        let _ = (store, models, as_of, hp);
        Err(AnalyticsError::DependencyUnavailable {
            backend: SEQUENCE_BACKEND,
        })
    }
    #[cfg(feature = "recurrent")]
    {
        train_inner(store, models, as_of, hp)
    }
}

#[cfg(feature = "recurrent")]
fn train_inner(
    store: &LedgerStore,
    models: &ModelDir,
    as_of: NaiveDate,
    hp: &NextPurchaseHyperparams,
) -> AnalyticsResult<NextPurchaseMeta> {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let training = build_training_sequences(store, as_of, hp.min_transactions, hp.sequence_length)?;
    if training.is_empty() {
        return Err(AnalyticsError::InsufficientData {
            required: hp.min_transactions,
        });
    }

    let raw_sequences: Vec<Array2<f64>> = training.iter().map(|t| t.steps.clone()).collect();
    let raw_targets: Vec<f64> = training.iter().map(|t| t.target).collect();

    let scaler = ScalerParams::fit(&raw_sequences, &raw_targets);
    let sequences: Vec<Array2<f64>> = raw_sequences
        .iter()
        .map(|s| scaler.transform_sequence(s))
        .collect();
    let targets: Vec<f64> = raw_targets.iter().map(|t| scaler.standardize_target(*t)).collect();

    let n = sequences.len();
    let mut rng = rand_pcg::Pcg64Mcg::seed_from_u64(hp.seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let n_val = ((n as f64) * hp.val_split).floor() as usize;
    let (val_idx, train_idx) = order.split_at(n_val);

    let train_seqs: Vec<Array2<f64>> = train_idx.iter().map(|&i| sequences[i].clone()).collect();
    let train_targets: Vec<f64> = train_idx.iter().map(|&i| targets[i]).collect();

    let mut model = RecurrentRegressor::new(FEATURE_SIZE, hp.hidden_size, &mut rng);
    recurrent::fit(
        &mut model,
        &train_seqs,
        &train_targets,
        hp.epochs,
        hp.learning_rate,
        hp.batch_size,
        &mut rng,
    );

    // Held-out error in de-standardized days; training-set error when the
    // split left no validation rows.
    let eval_idx: Vec<usize> = if val_idx.is_empty() {
        train_idx.to_vec()
    } else {
        val_idx.to_vec()
    };
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    for &i in &eval_idx {
        let predicted = scaler.destandardize(model.forward(&sequences[i]));
        let actual = raw_targets[i];
        let err = predicted - actual;
        abs_sum += err.abs();
        sq_sum += err * err;
    }
    let val_mae = abs_sum / eval_idx.len() as f64;
    let val_rmse = (sq_sum / eval_idx.len() as f64).sqrt();

    let meta = NextPurchaseMeta {
        model_id:         uuid::Uuid::new_v4().to_string(),
        as_of,
        min_transactions: hp.min_transactions,
        sequence_length:  hp.sequence_length,
        feature_size:     FEATURE_SIZE,
        hidden_size:      hp.hidden_size,
        samples_total:    n,
        samples_train:    train_idx.len(),
        samples_val:      n_val,
        val_mae,
        val_rmse,
        avg_target_days:  mean(&raw_targets),
    };

    models.save_json(&models.next_purchase_model_path(), &model)?;
    models.save_json(&models.next_purchase_scaler_path(), &scaler)?;
    models.save_json(&models.next_purchase_meta_path(), &meta)?;

    log::info!(
        "next_purchase: trained model {} on {n} sequences, val_mae={val_mae:.2}d val_rmse={val_rmse:.2}d",
        meta.model_id,
    );

    Ok(meta)
}

// ── Prediction ───────────────────────────────────────────────────────────────

#[cfg(feature = "recurrent")]
struct LoadedArtifact {
    model:  RecurrentRegressor,
    meta:   NextPurchaseMeta,
    scaler: ScalerParams,
}

#[cfg(feature = "recurrent")]
fn load_artifact(models: &ModelDir) -> AnalyticsResult<LoadedArtifact> {
    let model_path = models.next_purchase_model_path();
    let missing = || AnalyticsError::ModelNotTrained {
        path: model_path.display().to_string(),
    };
    let model: RecurrentRegressor = ModelDir::load_json(&model_path)?.ok_or_else(missing)?;
    let meta: NextPurchaseMeta =
        ModelDir::load_json(&models.next_purchase_meta_path())?.ok_or_else(missing)?;
    let scaler: ScalerParams =
        ModelDir::load_json(&models.next_purchase_scaler_path())?.ok_or_else(missing)?;
    Ok(LoadedArtifact { model, meta, scaler })
}

#[cfg(feature = "recurrent")]
fn predict_with(
    artifact: &LoadedArtifact,
    store: &LedgerStore,
    customer_id: CustomerId,
    as_of: NaiveDate,
) -> AnalyticsResult<NextPurchasePrediction> {
    let purchases = store.purchases_for_customer(customer_id, as_of)?;
    if purchases.len() < 2 {
        return Err(AnalyticsError::InsufficientData { required: 2 });
    }

    let (intervals, amounts) = intervals_and_amounts(&purchases);
    let steps = build_feature_steps(&intervals, &amounts, artifact.meta.sequence_length);
    let standardized = artifact.scaler.transform_sequence(&steps);
    let predicted = artifact.scaler.destandardize(artifact.model.forward(&standardized));
    let predicted_days = (predicted.round() as i64).max(1);

    let last_purchase_date = purchases[purchases.len() - 1].date;
    Ok(NextPurchasePrediction {
        customer_id,
        last_purchase_date,
        predicted_days,
        predicted_date: last_purchase_date + Duration::days(predicted_days),
        avg_interval_history: (mean(&intervals) * 10.0).round() / 10.0,
        total_transactions: purchases.len() as i64,
    })
}

/// Predict the next purchase for one customer. Requires a trained artifact
/// and at least two historical purchases.
pub fn predict(
    store: &LedgerStore,
    models: &ModelDir,
    customer_id: CustomerId,
    as_of: NaiveDate,
) -> AnalyticsResult<NextPurchasePrediction> {
    #[cfg(not(feature = "recurrent"))]
    {
        let _ = (store, models, customer_id, as_of);
        Err(AnalyticsError::DependencyUnavailable {
            backend: SEQUENCE_BACKEND,
        })
    }
    #[cfg(feature = "recurrent")]
    {
        let artifact = load_artifact(models)?;
        predict_with(&artifact, store, customer_id, as_of)
    }
}

/// Batch prediction over the customers with the most history. Individual
/// failures are skipped; a missing artifact still fails the whole call.
/// Results are sorted soonest-to-buy first.
pub fn predict_batch(
    store: &LedgerStore,
    models: &ModelDir,
    as_of: NaiveDate,
    top_n: Option<usize>,
) -> AnalyticsResult<Vec<NextPurchasePrediction>> {
    #[cfg(not(feature = "recurrent"))]
    {
        let _ = (store, models, as_of, top_n);
        Err(AnalyticsError::DependencyUnavailable {
            backend: SEQUENCE_BACKEND,
        })
    }
    #[cfg(feature = "recurrent")]
    {
        let artifact = load_artifact(models)?;
        let mut candidates = store.purchase_counts(as_of, 2)?;
        if let Some(limit) = top_n {
            candidates.truncate(limit);
        }

        let mut results = Vec::with_capacity(candidates.len());
        for (customer_id, _) in candidates {
            match predict_with(&artifact, store, customer_id, as_of) {
                Ok(prediction) => results.push(prediction),
                Err(e) => {
                    log::debug!("next_purchase: skipping customer {customer_id}: {e}");
                }
            }
        }

        results.sort_by(|a, b| {
            a.predicted_days
                .cmp(&b.predicted_days)
                .then(a.customer_id.cmp(&b.customer_id))
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_uses_running_average_not_zero() {
        // Three available intervals, sequence length five: two pad steps.
        let intervals = [10.0, 20.0, 30.0];
        let amounts = [100.0, 200.0, 300.0];
        let steps = build_feature_steps(&intervals, &amounts, 5);

        assert_eq!(steps.nrows(), 5);
        assert_eq!(steps[[0, 0]], 20.0); // mean of available intervals
        assert_eq!(steps[[1, 0]], 20.0);
        assert_eq!(steps[[0, 1]], 200.0); // mean of available amounts
        assert_eq!(steps[[2, 0]], 10.0); // real data starts here
    }

    #[test]
    fn long_histories_keep_the_trailing_window() {
        let intervals: Vec<f64> = (1..=12).map(f64::from).collect();
        let amounts = vec![50.0; 12];
        let steps = build_feature_steps(&intervals, &amounts, 10);
        assert_eq!(steps[[0, 0]], 3.0);
        assert_eq!(steps[[9, 0]], 12.0);
    }

    #[test]
    fn running_features_accumulate() {
        let intervals = [10.0, 30.0];
        let amounts = [100.0, 300.0];
        let steps = build_feature_steps(&intervals, &amounts, 2);

        assert_eq!(steps[[0, 2]], 1.0);
        assert_eq!(steps[[1, 2]], 2.0);
        assert_eq!(steps[[1, 3]], 400.0); // cumulative amount
        assert_eq!(steps[[1, 4]], 20.0); // running mean interval
        assert_eq!(steps[[1, 5]], 200.0); // running mean amount
    }

    #[test]
    fn scaler_round_trips_targets() {
        let sequences = vec![Array2::from_elem((3, FEATURE_SIZE), 2.0)];
        let targets = [5.0, 15.0, 25.0];
        let scaler = ScalerParams::fit(&sequences, &targets);
        for t in targets {
            let z = scaler.standardize_target(t);
            assert!((scaler.destandardize(z) - t).abs() < 1e-9);
        }
    }
}
