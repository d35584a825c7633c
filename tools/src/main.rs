//! analytics-runner: headless runner for the customer analytics engine.
//!
//! Usage:
//!   analytics-runner --db crm.db --model-dir ./models --train
//!   analytics-runner --seed-demo 300 --as-of 2024-06-01 --train --category 1
//!   analytics-runner --db crm.db --customer 42

use anyhow::Result;
use analytics_core::{
    analysis::AnalyticsEngine,
    artifact::ModelDir,
    config::{AnalyticsConfig, DEFAULT_CHURN_THRESHOLD_DAYS, DEFAULT_WINDOW_DAYS},
    error::AnalyticsError,
    rfm::parse_as_of,
    segmentation::Segment,
    store::{CustomerRecord, LedgerStore},
};
use chrono::{Duration, NaiveDate};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::env;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = str_arg(&args, "--db").unwrap_or_else(|| ":memory:".to_string());
    let model_dir = str_arg(&args, "--model-dir").unwrap_or_else(|| "./models".to_string());
    let as_of = parse_as_of(str_arg(&args, "--as-of").as_deref())?;
    let window_days = parse_arg(&args, "--window-days", DEFAULT_WINDOW_DAYS);
    let churn_threshold = parse_arg(&args, "--churn-threshold", DEFAULT_CHURN_THRESHOLD_DAYS);
    let demo_customers = parse_arg(&args, "--seed-demo", 0u64);
    let demo_seed = parse_arg(&args, "--demo-seed", 42u64);
    let do_train = args.iter().any(|a| a == "--train");
    let customer = str_arg(&args, "--customer").map(|s| s.parse::<i64>()).transpose()?;
    let category = str_arg(&args, "--category")
        .map(|s| s.parse::<i64>())
        .transpose()?
        .and_then(Segment::from_id);

    println!("analytics-runner");
    println!("  db:         {db}");
    println!("  model_dir:  {model_dir}");
    println!("  as_of:      {as_of}");
    println!();

    let store = if db == ":memory:" {
        LedgerStore::in_memory()?
    } else {
        LedgerStore::open(&db)?
    };
    store.migrate()?;

    if demo_customers > 0 {
        seed_demo_ledger(&store, demo_customers, demo_seed, as_of)?;
        println!("seeded {demo_customers} demo customers (seed {demo_seed})");
    }

    let engine = AnalyticsEngine::new(store, ModelDir::new(&model_dir), AnalyticsConfig::default());

    if do_train {
        let churn_report = engine.train_churn(as_of, window_days, churn_threshold)?;
        println!("churn model trained:");
        println!("{}", serde_json::to_string_pretty(&churn_report)?);

        match engine.train_next_purchase(as_of) {
            Ok(report) => {
                println!("next-purchase model trained:");
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(AnalyticsError::InsufficientData { required }) => {
                log::warn!(
                    "next-purchase training skipped: no customer with {required}+ transactions"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(customer_id) = customer {
        let churn = engine.predict_churn_for_customer(customer_id, as_of, window_days)?;
        println!("customer {customer_id} churn:");
        println!("{}", serde_json::to_string_pretty(&churn)?);

        match engine.predict_next_purchase(customer_id, as_of) {
            Ok(next) => {
                println!("customer {customer_id} next purchase:");
                println!("{}", serde_json::to_string_pretty(&next)?);
            }
            Err(e) => println!("customer {customer_id} next purchase unavailable: {e}"),
        }
    }

    let report = engine.comprehensive_analysis(as_of, category)?;
    println!("comprehensive analysis:");
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

// ── Demo ledger ──────────────────────────────────────────────────────────────

/// Seed a synthetic but deterministic ledger: a mix of steady repeat buyers,
/// drifting occasional buyers, long-dormant customers, this-month joiners,
/// and customers who never bought anything.
fn seed_demo_ledger(
    store: &LedgerStore,
    customers: u64,
    seed: u64,
    as_of: NaiveDate,
) -> Result<()> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    for i in 0..customers {
        let customer_id = (i + 1) as i64;
        let profile = i % 5;

        let join_days_ago = match profile {
            3 => rng.gen_range(0..25),     // joined this period
            _ => rng.gen_range(60..720),
        };
        let join_date = as_of - Duration::days(join_days_ago);

        store.insert_customer(&CustomerRecord {
            customer_id,
            name: format!("customer-{customer_id}"),
            region: None,
            join_date,
            segment_id: None,
        })?;

        let purchases: u64 = match profile {
            0 => rng.gen_range(8..24), // steady repeat buyers
            1 => rng.gen_range(2..6),  // occasional
            2 => rng.gen_range(1..4),  // dormant (old purchases only)
            3 => rng.gen_range(0..3),  // new joiners
            _ => 0,                    // never purchased
        };

        let mut date = join_date;
        for _ in 0..purchases {
            let gap = match profile {
                0 => rng.gen_range(7..30),
                1 => rng.gen_range(30..120),
                2 => rng.gen_range(10..40),
                _ => rng.gen_range(1..12),
            };
            date += Duration::days(gap);
            if date > as_of {
                break;
            }
            // Dormant profile stops buying well before the as-of date.
            if profile == 2 && date > as_of - Duration::days(200) {
                break;
            }
            let amount = pareto(&mut rng, 15.0, 1.8).min(2_000.0);
            store.insert_transaction(customer_id, date, (amount * 100.0).round() / 100.0)?;
        }
    }

    Ok(())
}

fn pareto(rng: &mut Pcg64Mcg, x_min: f64, alpha: f64) -> f64 {
    let u: f64 = rng.gen::<f64>().max(1e-10);
    x_min * u.powf(-1.0 / alpha)
}

// ── Arg parsing ──────────────────────────────────────────────────────────────

fn str_arg(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    str_arg(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
