use analytics_core::{
    churn::{self, RiskLevel, CHURN_FEATURE_NAMES},
    config::AnalyticsConfig,
    error::AnalyticsError,
    rfm::build_rfm,
    store::{CustomerRecord, LedgerStore},
};
use analytics_core::{analysis::AnalyticsEngine, artifact::ModelDir};
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

fn engine_with_dir(store: LedgerStore) -> (AnalyticsEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = AnalyticsEngine::new(
        store,
        ModelDir::new(dir.path()),
        AnalyticsConfig::default(),
    );
    (engine, dir)
}

/// Mixed population: "active" customers keep buying after the as-of date
/// (label 0) and "stale" customers stop before it (label 1). Feature
/// profiles correlate with the labels so the classifier has signal.
fn seed_mixed_population(store: &LedgerStore, as_of: NaiveDate) {
    for id in 1..=30i64 {
        add_customer(store, id, "2022-06-01");
        if id % 2 == 0 {
            // Active: frequent, recent, generous, and still buying later.
            for k in 0..10 {
                store
                    .insert_transaction(id, as_of - Duration::days(10 + 30 * k), 300.0)
                    .unwrap();
            }
            store
                .insert_transaction(id, as_of + Duration::days(20 + (id % 5) * 7), 250.0)
                .unwrap();
        } else {
            // Stale: a couple of old, small purchases and nothing after.
            for k in 0..2 {
                store
                    .insert_transaction(id, as_of - Duration::days(150 + 40 * k), 40.0)
                    .unwrap();
            }
        }
    }
}

// ── Label construction ───────────────────────────────────────────────────────

/// A purchase strictly inside `(as_of, as_of + threshold]` makes the label
/// 0; no such purchase makes it 1. Verified on fixed fixture dates.
#[test]
fn future_window_labels_on_fixture_dates() {
    let store = store();
    let as_of = d("2024-01-01");

    add_customer(&store, 1, "2023-01-01");
    store.insert_transaction(1, d("2023-11-20"), 100.0).unwrap();
    store.insert_transaction(1, d("2024-02-01"), 80.0).unwrap(); // inside the window

    add_customer(&store, 2, "2023-01-01");
    store.insert_transaction(2, d("2023-10-05"), 100.0).unwrap();
    store.insert_transaction(2, d("2024-04-02"), 60.0).unwrap(); // first purchase after window end

    let rfm = build_rfm(&store, as_of, 365).unwrap();
    let labels = churn::future_window_labels(&store, &rfm, as_of, 90).unwrap();

    let label_of = |id: i64| {
        rfm.iter()
            .position(|s| s.customer_id == id)
            .map(|i| labels[i])
            .unwrap()
    };
    assert_eq!(label_of(1), 0);
    assert_eq!(label_of(2), 1);
}

/// The window is half-open on the left: a purchase exactly on the as-of
/// date does not count as future activity, one exactly at the threshold
/// boundary does.
#[test]
fn future_window_boundaries() {
    let store = store();
    let as_of = d("2024-01-01");

    add_customer(&store, 1, "2023-01-01");
    store.insert_transaction(1, as_of, 50.0).unwrap(); // on as_of: not future

    add_customer(&store, 2, "2023-01-01");
    store.insert_transaction(2, d("2023-12-01"), 50.0).unwrap();
    store.insert_transaction(2, d("2024-03-31"), 50.0).unwrap(); // exactly as_of + 90

    let rfm = build_rfm(&store, as_of, 365).unwrap();
    let labels = churn::future_window_labels(&store, &rfm, as_of, 90).unwrap();
    let label_of = |id: i64| {
        rfm.iter()
            .position(|s| s.customer_id == id)
            .map(|i| labels[i])
            .unwrap()
    };
    assert_eq!(label_of(1), 1);
    assert_eq!(label_of(2), 0);
}

// ── Heuristic serving ────────────────────────────────────────────────────────

/// Without any artifact, prediction degrades to the heuristic: valid
/// probabilities, exact risk-level thresholds, descending sort.
#[test]
fn heuristic_fallback_without_artifact() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_mixed_population(&store, as_of);
    let (engine, _dir) = engine_with_dir(store);

    let rows = engine.predict_churn(as_of, 365).unwrap();
    assert_eq!(rows.len(), 30);

    for row in &rows {
        assert!((0.0..=1.0).contains(&row.probability));
        let expected = if row.probability >= 0.66 {
            RiskLevel::High
        } else if row.probability >= 0.33 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        assert_eq!(row.risk_level, expected);
    }
    for pair in rows.windows(2) {
        assert!(pair[0].probability >= pair[1].probability);
    }
}

/// Stale low-spend customers must rank above active high-spend ones under
/// the heuristic.
#[test]
fn heuristic_ranks_stale_customers_first() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_mixed_population(&store, as_of);
    let (engine, _dir) = engine_with_dir(store);

    let rows = engine.predict_churn(as_of, 365).unwrap();
    let top_half: Vec<i64> = rows[..15].iter().map(|r| r.customer_id).collect();
    // Odd ids are the stale profile.
    assert!(top_half.iter().all(|id| id % 2 == 1));
}

// ── Training ─────────────────────────────────────────────────────────────────

/// Zero eligible customers is a hard training error.
#[test]
fn training_without_data_fails() {
    let (engine, _dir) = engine_with_dir(store());
    let result = engine.train_churn(d("2024-01-01"), 365, 90);
    assert!(matches!(result, Err(AnalyticsError::NoTrainingData { .. })));
}

/// A proper two-class population trains, reports held-out metrics, records
/// the feature order in the sidecar, and then serves model probabilities.
#[test]
fn train_then_predict_with_model() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_mixed_population(&store, as_of);
    let (engine, dir) = engine_with_dir(store);

    let report = engine.train_churn(as_of, 365, 90).unwrap();
    assert_eq!(report.samples_total, 30);
    assert!(report.generalizes);
    assert!(report.samples_val > 0);
    assert_eq!(report.feature_names, CHURN_FEATURE_NAMES.to_vec());
    assert!(report.val_accuracy.unwrap() >= 0.0);

    let models = ModelDir::new(dir.path());
    assert!(models.churn_model_path().exists());
    assert!(models.churn_meta_path().exists());

    let rows = engine.predict_churn(as_of, 365).unwrap();
    assert_eq!(rows.len(), 30);
    for row in &rows {
        assert!((0.0..=1.0).contains(&row.probability));
    }
    for pair in rows.windows(2) {
        assert!(pair[0].probability >= pair[1].probability);
    }

    // The labels were learnable from the scores: stale customers should,
    // on average, carry more risk than active ones.
    let avg = |parity: i64| {
        let v: Vec<f64> = rows
            .iter()
            .filter(|r| r.customer_id % 2 == parity)
            .map(|r| r.probability)
            .collect();
        v.iter().sum::<f64>() / v.len() as f64
    };
    assert!(avg(1) > avg(0));
}

/// When every customer carries the same label, training still succeeds but
/// the report is flagged as non-generalizing.
#[test]
fn single_class_training_is_flagged() {
    let store = store();
    let as_of = d("2024-06-15");
    // Nobody purchases after as_of: every label is 1.
    for id in 1..=8i64 {
        add_customer(&store, id, "2023-01-01");
        store
            .insert_transaction(id, as_of - Duration::days(30 + id), 100.0)
            .unwrap();
    }
    let (engine, _dir) = engine_with_dir(store);

    let report = engine.train_churn(as_of, 365, 90).unwrap();
    assert!(!report.generalizes);
    assert_eq!(report.samples_val, 0);
    assert!(report.val_auc.is_none());
}

/// Per-customer lookup returns the row for known ids and a typed error for
/// ids with no history in the window.
#[test]
fn per_customer_lookup() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_mixed_population(&store, as_of);
    let (engine, _dir) = engine_with_dir(store);

    let row = engine.predict_churn_for_customer(3, as_of, 365).unwrap();
    assert_eq!(row.customer_id, 3);

    let missing = engine.predict_churn_for_customer(9_999, as_of, 365);
    assert!(matches!(
        missing,
        Err(AnalyticsError::CustomerNotFound { customer_id: 9_999 })
    ));
}

/// Inference assembles features in the order the sidecar records, not in a
/// hard-coded default: a permuted sidecar still serves.
#[test]
fn sidecar_feature_order_is_respected() {
    let store = store();
    let as_of = d("2024-06-15");
    seed_mixed_population(&store, as_of);
    let (engine, dir) = engine_with_dir(store);
    engine.train_churn(as_of, 365, 90).unwrap();

    // Rewrite the sidecar with a permuted (but resolvable) feature order.
    let models = ModelDir::new(dir.path());
    let meta_path = models.churn_meta_path();
    let mut meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    meta["feature_names"] = serde_json::json!(["m_score", "r_score", "f_score"]);
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

    let rows = engine.predict_churn(as_of, 365).unwrap();
    assert_eq!(rows.len(), 30);
    for row in &rows {
        assert!((0.0..=1.0).contains(&row.probability));
    }
}
