//! Fault-wrapped calls into learners.
//!
//! Each stage calls one learner capability and decides what a failure means. A
//! preprocessing failure is always fatal because nothing downstream can run without
//! its output. Estimator failures are fatal only under a raising policy; otherwise they
//! are reported and the caller gets `None`.

use crate::cache::FittedStep;
use crate::diagnostics::{Diagnostics, Origin, Warning, WarningKind};
use crate::estimation::{EstimationError, StageKind};
use crate::learner::{Learner, PredictMethod};
use crate::matrix::PredictionMatrix;
use crate::types::{ColumnSpan, Features, Instance, Prediction};
use ndarray::ArrayView1;
use std::borrow::Cow;

/// What a stage needs to know about the task it runs in.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub origin: &'a Origin,
    pub raise: bool,
    pub diagnostics: &'a dyn Diagnostics,
}

/// Fits a preprocessing chain, feeding each step's output into the next step.
/// The last step is fitted but not applied.
pub fn fit_transform_stage<L: Learner>(
    steps: &[Instance<L>],
    x: &Features,
    y: ArrayView1<'_, f64>,
    origin: &Origin,
) -> Result<Vec<FittedStep<L>>, EstimationError> {
    let mut current = Cow::Borrowed(x);
    let mut fitted = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let mut learner = step.learner.clone();
        learner
            .fit(&current, y)
            .map_err(|source| EstimationError::FitFailed {
                origin: origin.clone(),
                stage: StageKind::Preprocess,
                instance: step.name.clone(),
                source,
            })?;
        if i + 1 < steps.len() {
            let next = learner
                .transform(&current)
                .map_err(|source| EstimationError::FitFailed {
                    origin: origin.clone(),
                    stage: StageKind::Transform,
                    instance: step.name.clone(),
                    source,
                })?;
            current = Cow::Owned(next);
        }
        fitted.push(FittedStep {
            name: step.name.clone(),
            learner,
        });
    }
    Ok(fitted)
}

/// Runs `x` through a fitted chain. An empty chain returns the input as is.
pub fn transform_stage<'x, L: Learner>(
    steps: &[FittedStep<L>],
    x: &'x Features,
    origin: &Origin,
) -> Result<Cow<'x, Features>, EstimationError> {
    let mut current = Cow::Borrowed(x);
    for step in steps {
        let next = step
            .learner
            .transform(&current)
            .map_err(|source| EstimationError::FitFailed {
                origin: origin.clone(),
                stage: StageKind::Transform,
                instance: step.name.clone(),
                source,
            })?;
        current = Cow::Owned(next);
    }
    Ok(current)
}

/// Fits a fresh clone of an estimator instance. `Ok(None)` means the instance was dropped.
pub fn fit_estimate_stage<L: Learner>(
    instance: &Instance<L>,
    x: &Features,
    y: ArrayView1<'_, f64>,
    ctx: &StageContext<'_>,
) -> Result<Option<L>, EstimationError> {
    let mut learner = instance.learner.clone();
    match learner.fit(x, y) {
        Ok(()) => Ok(Some(learner)),
        Err(source) if ctx.raise => Err(EstimationError::FitFailed {
            origin: ctx.origin.clone(),
            stage: StageKind::Estimate,
            instance: instance.name.clone(),
            source,
        }),
        Err(source) => {
            ctx.diagnostics.warn(Warning::new(
                WarningKind::FitFailed,
                ctx.origin,
                format!(
                    "Could not fit estimator '{}'. Will drop from ensemble. Details:\n{source}",
                    instance.name
                ),
            ));
            Ok(None)
        }
    }
}

/// Predicts with a fitted estimator. `Ok(None)` means the prediction is invalid and the
/// caller should zero its region.
pub fn predict_estimate_stage<L: Learner>(
    learner: &L,
    instance: &str,
    x: &Features,
    method: PredictMethod,
    ctx: &StageContext<'_>,
) -> Result<Option<Prediction>, EstimationError> {
    match method.call(learner, x) {
        Ok(prediction) => Ok(Some(prediction)),
        Err(source) if ctx.raise => Err(EstimationError::PredictFailed {
            origin: ctx.origin.clone(),
            instance: instance.to_string(),
            method,
            source,
        }),
        Err(source) => {
            ctx.diagnostics.warn(Warning::new(
                WarningKind::PredictFailed,
                ctx.origin,
                format!(
                    "Could not call '{method}' with estimator '{instance}'. Predictions set to 0. \
                     Details:\n{source}"
                ),
            ));
            Ok(None)
        }
    }
}

/// Writes a prediction into its region of the shared matrix, or zeros the region when
/// there is no valid prediction.
pub fn write_back(
    p: &PredictionMatrix,
    rows: Option<&[usize]>,
    columns: ColumnSpan,
    prediction: Option<&Prediction>,
) -> Result<(), EstimationError> {
    match prediction {
        Some(values) => p.write(rows, columns, values)?,
        None => p.fill(rows, columns, 0.0)?,
    }
    Ok(())
}
