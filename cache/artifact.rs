//! Cache keys and the payloads stored under them.
//!
//! Payloads are encoded as TOML, the same human-readable format used for other
//! persisted models, so a cache directory can be inspected by hand after a failed run.

use super::store::{CacheError, CacheStore};
use crate::types::{ColumnSpan, IndexSpec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Key of a case's fitted preprocessing chain.
pub fn transformer_key(case: &str) -> String {
    format!("{case}__t")
}

/// Key of one fitted estimator instance.
pub fn estimator_key(case: &str, instance: &str) -> String {
    format!("{case}__{instance}__e")
}

/// Composite key under which an instance's score is reported.
pub fn score_key(case: &str, instance: &str) -> String {
    format!("{case}___{instance}")
}

/// One fitted step of a preprocessing chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedStep<L> {
    pub name: String,
    pub learner: L,
}

/// The ordered fitted steps of a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerArtifact<L> {
    pub steps: Vec<FittedStep<L>>,
}

/// A fitted estimator with the rows and columns it predicts into and its fold score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorArtifact<L> {
    pub instance: String,
    pub learner: L,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<IndexSpec>,
    pub columns: ColumnSpan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

pub fn encode_artifact<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    toml::to_string(value)
        .map(String::into_bytes)
        .map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })
}

pub fn decode_artifact<T: DeserializeOwned>(key: &str, payload: &[u8]) -> Result<T, CacheError> {
    let text =
        std::str::from_utf8(payload).map_err(|_| CacheError::NotUtf8(key.to_string()))?;
    toml::from_str(text).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}

pub fn save_artifact<T: Serialize>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
) -> Result<(), CacheError> {
    let payload = encode_artifact(key, value)?;
    store.save(key, &payload)
}

pub fn load_artifact<T: DeserializeOwned>(
    store: &dyn CacheStore,
    key: &str,
) -> Result<T, CacheError> {
    let payload = store.load(key)?;
    decode_artifact(key, &payload)
}
