use chrono::NaiveDate;
use thiserror::Error;

use crate::types::CustomerId;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("invalid as-of date '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("no training data: no customer has transaction history at or before {as_of}")]
    NoTrainingData { as_of: NaiveDate },

    #[error("insufficient data: no customer has at least {required} transactions")]
    InsufficientData { required: usize },

    #[error("model backend '{backend}' is not available in this build")]
    DependencyUnavailable { backend: &'static str },

    #[error("no trained model artifact at {path}")]
    ModelNotTrained { path: String },

    #[error("customer {customer_id} has no transaction history in the prediction window")]
    CustomerNotFound { customer_id: CustomerId },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;
