use analytics_core::{
    analysis::AnalyticsEngine,
    artifact::ModelDir,
    config::{AnalyticsConfig, NextPurchaseHyperparams},
    error::AnalyticsError,
    next_purchase::build_feature_steps,
    store::{CustomerRecord, LedgerStore},
};
use chrono::{Duration, NaiveDate};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn store() -> LedgerStore {
    let store = LedgerStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
}

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn add_customer(store: &LedgerStore, id: i64, join: &str) {
    store
        .insert_customer(&CustomerRecord {
            customer_id: id,
            name: format!("customer-{id}"),
            region: None,
            join_date: d(join),
            segment_id: None,
        })
        .unwrap();
}

fn test_config() -> AnalyticsConfig {
    AnalyticsConfig {
        next_purchase: NextPurchaseHyperparams {
            hidden_size: 8,
            epochs: 60,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine_with_dir(store: LedgerStore) -> (AnalyticsEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = AnalyticsEngine::new(store, ModelDir::new(dir.path()), test_config());
    (engine, dir)
}

/// Ten regular shoppers with per-customer cadences between 8 and 20 days
/// and steady amounts: clean signal for the sequence model.
fn seed_regular_shoppers(store: &LedgerStore, as_of: NaiveDate) {
    for id in 1..=10i64 {
        add_customer(store, id, "2023-06-01");
        let gap = 8 + (id % 7) * 2;
        let mut date = as_of - Duration::days(gap * 9);
        for _ in 0..9 {
            store
                .insert_transaction(id, date, 40.0 + 5.0 * id as f64)
                .unwrap();
            date += Duration::days(gap);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Serving before any training run is a hard error; there is no
/// meaningful closed-form substitute for a sequence regression.
#[test]
fn predict_without_artifact_is_an_error() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_regular_shoppers(&store, as_of);
    let (engine, _dir) = engine_with_dir(store);

    let result = engine.predict_next_purchase(1, as_of);
    assert!(matches!(result, Err(AnalyticsError::ModelNotTrained { .. })));

    let batch = engine.predict_next_purchase_batch(as_of, None);
    assert!(matches!(batch, Err(AnalyticsError::ModelNotTrained { .. })));
}

/// Training with nobody over the transaction minimum fails with a typed
/// error instead of fitting garbage.
#[test]
fn training_without_eligible_customers_fails() {
    let store = store();
    add_customer(&store, 1, "2023-06-01");
    store.insert_transaction(1, d("2024-01-10"), 25.0).unwrap();
    store.insert_transaction(1, d("2024-02-01"), 25.0).unwrap();
    let (engine, _dir) = engine_with_dir(store);

    let result = engine.train_next_purchase(d("2024-06-15"));
    assert!(matches!(
        result,
        Err(AnalyticsError::InsufficientData { .. })
    ));
}

/// Full train → predict round trip: three files persisted, sane report
/// metrics, and per-customer predictions with the date arithmetic the
/// consumers rely on.
#[test]
fn train_then_predict_round_trip() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_regular_shoppers(&store, as_of);
    let (engine, dir) = engine_with_dir(store);

    let report = engine.train_next_purchase(as_of).unwrap();
    assert_eq!(report.samples_total, 10);
    assert_eq!(report.feature_size, 6);
    assert!(report.val_mae.is_finite());
    assert!(report.val_rmse >= report.val_mae);

    let models = ModelDir::new(dir.path());
    assert!(models.next_purchase_model_path().exists());
    assert!(models.next_purchase_meta_path().exists());
    assert!(models.next_purchase_scaler_path().exists());

    for id in 1..=10 {
        let p = engine.predict_next_purchase(id, as_of).unwrap();
        assert_eq!(p.customer_id, id);
        assert!(p.predicted_days >= 1);
        assert_eq!(
            p.predicted_date,
            p.last_purchase_date + Duration::days(p.predicted_days)
        );
        assert_eq!(p.total_transactions, 9);
        // Sanity bound: well under three times the longest cadence seeded.
        assert!(p.predicted_days < 60, "implausible: {}", p.predicted_days);
    }
}

/// A customer with exactly the minimum history yields a deterministic
/// prediction, bounded by three times their longest historical interval.
#[test]
fn minimum_history_customer_predicts_within_bounds() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_regular_shoppers(&store, as_of);

    // Exactly min_transactions + 1 = 4 purchases, intervals 10/12/14 days.
    add_customer(&store, 99, "2024-01-01");
    for date in ["2024-05-01", "2024-05-11", "2024-05-23", "2024-06-06"] {
        store.insert_transaction(99, d(date), 55.0).unwrap();
    }

    let (engine, _dir) = engine_with_dir(store);
    engine.train_next_purchase(as_of).unwrap();

    let first = engine.predict_next_purchase(99, as_of).unwrap();
    let second = engine.predict_next_purchase(99, as_of).unwrap();
    assert_eq!(first.predicted_days, second.predicted_days);

    assert!(first.predicted_days >= 1);
    assert!(first.predicted_days < 14 * 3);
    assert_eq!(first.last_purchase_date, d("2024-06-06"));
    assert_eq!(first.avg_interval_history, 12.0);
}

/// Too little history is rejected even with a trained model on disk.
#[test]
fn predict_requires_two_purchases() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_regular_shoppers(&store, as_of);
    add_customer(&store, 50, "2024-01-01");
    store.insert_transaction(50, d("2024-06-01"), 30.0).unwrap();

    let (engine, _dir) = engine_with_dir(store);
    engine.train_next_purchase(as_of).unwrap();

    let result = engine.predict_next_purchase(50, as_of);
    assert!(matches!(
        result,
        Err(AnalyticsError::InsufficientData { required: 2 })
    ));
}

/// Batch prediction: soonest-to-buy first, ineligible customers absent,
/// and `top_n` selects the customers with the most history.
#[test]
fn batch_predictions_sorted_soonest_first() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_regular_shoppers(&store, as_of);
    // One-purchase customer: never a batch candidate.
    add_customer(&store, 50, "2024-01-01");
    store.insert_transaction(50, d("2024-06-01"), 30.0).unwrap();

    let (engine, _dir) = engine_with_dir(store);
    engine.train_next_purchase(as_of).unwrap();

    let all = engine.predict_next_purchase_batch(as_of, None).unwrap();
    assert_eq!(all.len(), 10);
    assert!(all.iter().all(|p| p.customer_id != 50));
    for pair in all.windows(2) {
        assert!(pair[0].predicted_days <= pair[1].predicted_days);
    }

    let top = engine.predict_next_purchase_batch(as_of, Some(3)).unwrap();
    assert_eq!(top.len(), 3);
}

/// The padding contract: short sequences are left-padded with the mean of
/// their available steps, and the real data keeps its trailing position.
#[test]
fn padding_matches_running_average_of_available_steps() {
    let intervals = [10.0, 12.0, 14.0];
    let amounts = [55.0, 55.0, 55.0];
    let steps = build_feature_steps(&intervals, &amounts, 10);

    assert_eq!(steps.nrows(), 10);
    for i in 0..7 {
        assert_eq!(steps[[i, 0]], 12.0); // mean(10, 12, 14)
        assert_eq!(steps[[i, 1]], 55.0);
    }
    assert_eq!(steps[[7, 0]], 10.0);
    assert_eq!(steps[[8, 0]], 12.0);
    assert_eq!(steps[[9, 0]], 14.0);
}
