//! Customer behavioral analytics engine.
//!
//! Classifies customers into behavioral segments and forecasts churn risk
//! and next-purchase timing from a raw transaction ledger.
//!
//! RULES:
//!   - Only the store talks to the database; subsystems call store methods.
//!   - Every computation takes an explicit as-of date. "Today" is resolved
//!     once, at the orchestration boundary (`rfm::parse_as_of`).
//!   - Model artifacts are a serialized blob plus a JSON metadata sidecar;
//!     the sidecar is the source of truth for what the blob expects.
//!   - All randomness (splits, weight init, shuffles) flows through seeded
//!     PCG generators, so a fixed seed reproduces a training run.

pub mod analysis;
pub mod artifact;
pub mod churn;
pub mod config;
pub mod error;
pub mod next_purchase;
pub mod rfm;
pub mod segmentation;
pub mod store;
pub mod types;

pub use analysis::AnalyticsEngine;
pub use error::{AnalyticsError, AnalyticsResult};
