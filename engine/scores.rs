//! Per-fold scores reduced to one `(mean, std)` record per estimator.

use crate::cache::score_key;
use crate::diagnostics::{Diagnostics, Origin, Warning, WarningKind};
use crate::estimation::EstimationError;
use crate::types::FitScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub mean: f64,
    pub std: f64,
}

/// Reduced scores keyed by the estimator's canonical name (`"case__instance"`, or just
/// the instance for estimators without preprocessing).
pub type ScoreTable = BTreeMap<String, ScoreRecord>;

/// The score of one fitted estimator cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub case: String,
    pub instance: String,
    pub scope: FitScope,
    pub score: Option<f64>,
}

impl ScoreEntry {
    /// The composite `"{case}___{instance}"` key the entry is reported under.
    pub fn key(&self) -> String {
        score_key(&self.case, &self.instance)
    }

    /// The estimator this entry belongs to, with any fold suffix removed.
    pub fn canonical_name(&self) -> String {
        match self.scope {
            FitScope::Full => {
                if self.case.is_empty() {
                    self.instance.clone()
                } else {
                    format!("{}__{}", self.case, self.instance)
                }
            }
            FitScope::Fold => {
                let estimator = strip_fold(&self.instance);
                match self.case.split_once("__") {
                    Some((case, _)) => format!("{case}__{estimator}"),
                    // A fold case without a separator is the fold of the unnamed case.
                    None => estimator.to_string(),
                }
            }
        }
    }
}

fn strip_fold(name: &str) -> &str {
    name.rsplit_once("__").map_or(name, |(head, _)| head)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReductionError {
    #[error("no fold scores were recorded")]
    NoFoldScores,
    #[error("fold {position} has no score")]
    MissingScore { position: usize },
}

/// Population mean and standard deviation of a group of fold scores.
pub fn mean_score(scores: &[Option<f64>]) -> Result<ScoreRecord, ReductionError> {
    if scores.is_empty() {
        return Err(ReductionError::NoFoldScores);
    }
    let mut values = Vec::with_capacity(scores.len());
    for (position, score) in scores.iter().enumerate() {
        values.push(score.ok_or(ReductionError::MissingScore { position })?);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Ok(ScoreRecord {
        mean,
        std: var.sqrt(),
    })
}

/// Groups fold scores under the estimator they belong to and reduces each group.
///
/// Full-data entries only register the estimator names. A group that cannot be reduced
/// is fatal when `raise` is set; otherwise it is reported and left out of the table.
pub fn build_scores(
    entries: &[ScoreEntry],
    raise: bool,
    origin: &Origin,
    diagnostics: &dyn Diagnostics,
) -> Result<ScoreTable, EstimationError> {
    let mut groups: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.scope == FitScope::Full) {
        groups.entry(entry.canonical_name()).or_default();
    }
    for entry in entries.iter().filter(|e| e.scope == FitScope::Fold) {
        groups
            .entry(entry.canonical_name())
            .or_default()
            .push(entry.score);
    }

    let mut table = ScoreTable::new();
    for (name, scores) in groups {
        match mean_score(&scores) {
            Ok(record) => {
                log::debug!(
                    "{origin}Score {name}: {:.4} (+/- {:.4})",
                    record.mean,
                    record.std
                );
                table.insert(name, record);
            }
            Err(err) => {
                let message = format!("Could not aggregate scores for '{name}': {err}");
                if raise {
                    return Err(EstimationError::ParallelProcessing {
                        origin: origin.clone(),
                        message,
                    });
                }
                diagnostics.warn(Warning::new(
                    WarningKind::ParallelProcessing,
                    origin,
                    message,
                ));
            }
        }
    }
    Ok(table)
}
