//! Layer configuration and the read-only bundle the engine estimates.

use crate::cache::WaitPolicy;
use crate::diagnostics::Verbosity;
use crate::learner::{LearnerError, ScoreFn};
use crate::types::{ColumnMap, Prediction, TaskSpec};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

fn default_ival() -> f64 {
    0.1
}

fn default_lim() -> f64 {
    600.0
}

/// Per-layer settings. Serializable so a layer can be described in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Used to tag every diagnostic.
    pub name: String,
    /// `0` silent, `1..=49` stage lines on stderr, `>= 50` on stdout.
    #[serde(default)]
    pub verbose: u32,
    #[serde(default)]
    pub raise_on_exception: bool,
    /// Predict class probabilities instead of point predictions.
    #[serde(default)]
    pub proba: bool,
    /// Seconds between cache polls while waiting on a transformer.
    #[serde(default = "default_ival")]
    pub ival: f64,
    /// Seconds in one waiting window.
    #[serde(default = "default_lim")]
    pub lim: f64,
    /// Number of leading estimator cases fitted on the full data.
    #[serde(default)]
    pub n_pred: usize,
    /// Number of leading preprocessing cases fitted on the full data.
    #[serde(default)]
    pub n_prep: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read layer configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse layer configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid layer configuration: {0}")]
    Invalid(String),
}

impl LayerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            verbose: 0,
            raise_on_exception: false,
            proba: false,
            ival: default_ival(),
            lim: default_lim(),
            n_pred: 0,
            n_prep: 0,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.durations().map(drop)
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_level(self.verbose)
    }

    /// The polling interval and window length as durations.
    fn durations(&self) -> Result<(Duration, Duration), ConfigError> {
        let interval = Duration::try_from_secs_f64(self.ival)
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "ival must be a positive number of seconds, got {}",
                    self.ival
                ))
            })?;
        let limit = Duration::try_from_secs_f64(self.lim).map_err(|_| {
            ConfigError::Invalid(format!(
                "lim must be a non-negative number of seconds, got {}",
                self.lim
            ))
        })?;
        Ok((interval, limit))
    }

    pub fn wait_policy(&self) -> Result<WaitPolicy, ConfigError> {
        let (interval, limit) = self.durations()?;
        Ok(WaitPolicy::new(interval, limit, self.raise_on_exception))
    }
}

/// A layer as handed to the engine: settings, what to fit, and where predictions go.
pub struct Layer<L> {
    pub config: LayerConfig,
    pub tasks: TaskSpec<L>,
    pub columns: ColumnMap,
    scorer: Option<Arc<ScoreFn>>,
}

impl<L> Layer<L> {
    pub fn new(config: LayerConfig, tasks: TaskSpec<L>, columns: ColumnMap) -> Self {
        Self {
            config,
            tasks,
            columns,
            scorer: None,
        }
    }

    pub fn with_scorer<F>(mut self, scorer: F) -> Self
    where
        F: Fn(&Array1<f64>, &Prediction) -> Result<f64, LearnerError> + Send + Sync + 'static,
    {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    pub fn scorer(&self) -> Option<&ScoreFn> {
        self.scorer.as_deref()
    }

    /// Width of the prediction matrix this layer writes into.
    pub fn n_columns(&self) -> usize {
        self.columns.total_width()
    }
}

impl<L> fmt::Debug for Layer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("config", &self.config)
            .field("cases", &self.tasks.estimators.len())
            .field("columns", &self.columns.len())
            .field("scorer", &self.scorer.is_some())
            .finish()
    }
}
