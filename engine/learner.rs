//! # Learnable Instances
//!
//! The engine is polymorphic over anything that can be fitted and then either
//! transform features or predict targets. It never looks inside a learner. Fitted
//! state crosses worker boundaries only by being serialized into the cache.

use crate::types::{Features, Prediction};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;

/// Error type returned by learner capabilities.
pub type LearnerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A scoring function `(y_true, y_pred) -> score`.
pub type ScoreFn = dyn Fn(&Array1<f64>, &Prediction) -> Result<f64, LearnerError> + Send + Sync;

/// The optional capabilities of a learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Transform,
    Predict,
    PredictProba,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transform => "transform",
            Self::Predict => "predict",
            Self::PredictProba => "predict_proba",
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("learner does not support '{0}'")]
pub struct Unsupported(pub Capability);

pub trait Learner: Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Fits in place. The engine always calls this on a fresh clone of the
    /// declared instance.
    fn fit(&mut self, x: &Features, y: ArrayView1<'_, f64>) -> Result<(), LearnerError>;

    fn transform(&self, x: &Features) -> Result<Features, LearnerError> {
        let _ = x;
        Err(Box::new(Unsupported(Capability::Transform)))
    }

    fn predict(&self, x: &Features) -> Result<Array1<f64>, LearnerError> {
        let _ = x;
        Err(Box::new(Unsupported(Capability::Predict)))
    }

    fn predict_proba(&self, x: &Features) -> Result<Array2<f64>, LearnerError> {
        let _ = x;
        Err(Box::new(Unsupported(Capability::PredictProba)))
    }
}

/// Which prediction capability a layer calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictMethod {
    Predict,
    PredictProba,
}

impl PredictMethod {
    pub fn from_proba(proba: bool) -> Self {
        if proba {
            Self::PredictProba
        } else {
            Self::Predict
        }
    }

    pub fn call<L: Learner>(self, learner: &L, x: &Features) -> Result<Prediction, LearnerError> {
        match self {
            Self::Predict => learner.predict(x).map(Prediction::Single),
            Self::PredictProba => learner.predict_proba(x).map(Prediction::Multi),
        }
    }
}

impl fmt::Display for PredictMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predict => fmt::Display::fmt(&Capability::Predict, f),
            Self::PredictProba => fmt::Display::fmt(&Capability::PredictProba, f),
        }
    }
}
