//! Model artifact persistence.
//!
//! Every trained model is two files in the model directory: a serialized
//! model blob and a JSON metadata sidecar. The sidecar is the source of
//! truth for what the blob expects (feature order, shapes, windows);
//! inference reads it instead of assuming defaults. Writes are whole-file
//! replacements performed only after a training run has fully succeeded;
//! a reader racing a retrain sees either the old artifact or the new one,
//! never an in-place mutation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::AnalyticsResult;

pub const CHURN_MODEL_FILE: &str = "churn_model.json";
pub const CHURN_META_FILE: &str = "churn_model.meta.json";
pub const NEXT_PURCHASE_MODEL_FILE: &str = "next_purchase_rnn.json";
pub const NEXT_PURCHASE_META_FILE: &str = "next_purchase_rnn.meta.json";
pub const NEXT_PURCHASE_SCALER_FILE: &str = "next_purchase_scaler.json";

/// The directory holding all persisted model artifacts.
#[derive(Debug, Clone)]
pub struct ModelDir {
    root: PathBuf,
}

impl ModelDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn churn_model_path(&self) -> PathBuf {
        self.root.join(CHURN_MODEL_FILE)
    }

    pub fn churn_meta_path(&self) -> PathBuf {
        self.root.join(CHURN_META_FILE)
    }

    pub fn next_purchase_model_path(&self) -> PathBuf {
        self.root.join(NEXT_PURCHASE_MODEL_FILE)
    }

    pub fn next_purchase_meta_path(&self) -> PathBuf {
        self.root.join(NEXT_PURCHASE_META_FILE)
    }

    pub fn next_purchase_scaler_path(&self) -> PathBuf {
        self.root.join(NEXT_PURCHASE_SCALER_FILE)
    }

    /// Serialize `value` to `path`, creating the model directory on first use.
    pub fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> AnalyticsResult<()> {
        fs::create_dir_all(&self.root)?;
        let body = serde_json::to_vec(value)?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Load a JSON artifact, or `None` when the file does not exist.
    /// A cold start is an expected state, not an error.
    pub fn load_json<T: DeserializeOwned>(path: &Path) -> AnalyticsResult<Option<T>> {
        match fs::read(path) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
