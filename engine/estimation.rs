// ========================================================================================
//
//                               THE LAYER EXECUTION ENGINE
//
// ========================================================================================
//
// ### Purpose ###
//
// Fits, predicts and transforms one ensemble layer. A call turns the layer's task
// listing into a wave of independent closures, hands the wave to a parallel-for
// executor and, after `fit`, re-reads everything the workers persisted.
//
// Workers never share live learners. A transformer task publishes its fitted chain to
// the cache and the estimator tasks of the same case read it back, waiting for it if
// necessary. Predictions go straight into the caller's matrix; every task owns a
// disjoint block of it.
//
// ### Topologies ###
//
// `Dual`:     one wave of transformer tasks (one per case), then one wave of estimator
//             tasks (one per case and instance).
// `Combined`: one task per preprocessing case that fits the chain and then the
//             estimators of that case on the in-memory chain. Cases without a chain get
//             one task per instance.

use crate::cache::{
    CacheError, CacheStore, EstimatorArtifact, FittedStep, TransformerArtifact, WaitError,
    await_artifact, decode_artifact, estimator_key, load_artifact, save_artifact,
    transformer_key,
};
use crate::diagnostics::{ConsoleDiagnostics, Diagnostics, Origin, format_elapsed};
use crate::layer::{ConfigError, Layer};
use crate::learner::{Learner, LearnerError, PredictMethod};
use crate::matrix::{MatrixError, PredictionMatrix};
use crate::parallel::{ParallelExecutor, Task};
use crate::scores::{ScoreEntry, ScoreTable, build_scores};
use crate::slice::{SliceError, align_targets, rebase_rows, slice_rows};
use crate::stages::{
    StageContext, fit_estimate_stage, fit_transform_stage, predict_estimate_stage,
    transform_stage, write_back,
};
use crate::types::{Case, ColumnSpan, Features, FitScope, IndexSpec, Instance};
use ndarray::ArrayView1;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Which learner call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Fitting a preprocessing step.
    Preprocess,
    /// Applying a fitted preprocessing step.
    Transform,
    /// Fitting an estimator.
    Estimate,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preprocess => "fit transformer",
            Self::Transform => "transform with",
            Self::Estimate => "fit estimator",
        })
    }
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("{origin}Could not {stage} '{instance}': {source}")]
    FitFailed {
        origin: Origin,
        stage: StageKind,
        instance: String,
        source: LearnerError,
    },

    #[error("{origin}Could not call '{method}' with estimator '{instance}': {source}")]
    PredictFailed {
        origin: Origin,
        instance: String,
        method: PredictMethod,
        source: LearnerError,
    },

    #[error("{origin}Layer instance not fitted.")]
    NotFitted { origin: Origin },

    #[error("{origin}{message}")]
    ParallelProcessing { origin: Origin, message: String },

    #[error("{origin}No fitted preprocessing pipeline for case '{case}'")]
    MissingPreprocessing { origin: Origin, case: String },

    #[error("{origin}No output columns assigned to estimator '{instance}'")]
    MissingColumns { origin: Origin, instance: String },

    #[error("{origin}{source}")]
    Config {
        origin: Origin,
        source: ConfigError,
    },

    #[error(transparent)]
    Slice(#[from] SliceError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Dual,
    Combined,
}

/// A fitted preprocessing chain.
#[derive(Debug, Clone)]
pub struct FittedCase<L> {
    pub case: String,
    pub scope: FitScope,
    pub steps: Vec<FittedStep<L>>,
}

/// A fitted estimator instance as read back from the cache.
#[derive(Debug, Clone)]
pub struct FittedEstimator<L> {
    pub case: String,
    pub instance: String,
    pub scope: FitScope,
    pub learner: L,
    pub test: Option<IndexSpec>,
    pub columns: ColumnSpan,
    pub score: Option<f64>,
}

/// Everything a `fit` produced. Instances that failed in a tolerant fit are absent.
#[derive(Debug, Clone)]
pub struct FittedLayer<L> {
    pub preprocessing: Option<Vec<FittedCase<L>>>,
    pub estimators: Vec<FittedEstimator<L>>,
    pub scores: Option<ScoreTable>,
}

impl<L> FittedLayer<L> {
    pub fn is_fitted(&self) -> bool {
        !self.estimators.is_empty()
    }

    pub fn estimators_in(&self, scope: FitScope) -> impl Iterator<Item = &FittedEstimator<L>> {
        self.estimators.iter().filter(move |e| e.scope == scope)
    }

    pub fn preprocessing_for(&self, case: &str) -> Option<&FittedCase<L>> {
        self.preprocessing
            .as_ref()?
            .iter()
            .find(|fitted| fitted.case == case)
    }
}

enum FitTask<'t, L> {
    Transformers(&'t Case<L>),
    Estimator {
        case: &'t Case<L>,
        instance: &'t Instance<L>,
    },
    Pipeline {
        transformers: &'t Case<L>,
        estimators: Option<&'t Case<L>>,
    },
}

/// Runs one layer's fit, predict and transform calls.
pub struct LayerEstimator<'a, L> {
    layer: &'a Layer<L>,
    topology: Topology,
    diagnostics: Arc<dyn Diagnostics>,
    origin: Origin,
}

impl<'a, L: Learner> LayerEstimator<'a, L> {
    pub fn new(layer: &'a Layer<L>) -> Self {
        Self {
            layer,
            topology: Topology::default(),
            diagnostics: Arc::new(ConsoleDiagnostics::new(layer.config.verbosity())),
            origin: Origin::layer(&layer.config.name),
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    fn preprocess(&self) -> bool {
        self.layer.tasks.transformers.is_some()
    }

    fn method(&self) -> PredictMethod {
        PredictMethod::from_proba(self.layer.config.proba)
    }

    fn check_config(&self) -> Result<(), EstimationError> {
        self.layer
            .config
            .validate()
            .map_err(|source| EstimationError::Config {
                origin: self.origin.clone(),
                source,
            })
    }

    fn context<'c>(&'c self, origin: &'c Origin) -> StageContext<'c> {
        StageContext {
            origin,
            raise: self.layer.config.raise_on_exception,
            diagnostics: self.diagnostics.as_ref(),
        }
    }

    // ====================================================================================
    //                                       Fit
    // ====================================================================================

    /// Fits every case of the layer and returns what was persisted to `cache`.
    ///
    /// `y` may be longer than `x` when `x` is the output of an upstream layer that only
    /// covers the trailing rows; the leading targets are then dropped. Held-out
    /// predictions are written into `p`, rebased when `p` tracks fewer rows than `x`.
    pub fn fit(
        &self,
        x: &Features,
        y: ArrayView1<'_, f64>,
        p: &PredictionMatrix,
        cache: &dyn CacheStore,
        executor: &dyn ParallelExecutor,
    ) -> Result<FittedLayer<L>, EstimationError> {
        self.check_config()?;
        let started = Instant::now();
        let y = align_targets(y, x.nrows())?;
        self.diagnostics
            .stage(&format!("Fitting {}", self.layer.config.name));

        for wave in self.fit_waves() {
            log::debug!("{}Dispatching {} fit tasks", self.origin, wave.len());
            let tasks = wave
                .into_iter()
                .map(move |task| {
                    let task: Task<'_> =
                        Box::new(move || self.run_fit_task(task, x, y, p, cache));
                    task
                })
                .collect();
            executor.run(tasks)?;
        }

        let fitted = self.assemble(cache)?;
        self.diagnostics.stage(&format!(
            "{}Done | {}",
            self.origin,
            format_elapsed(started.elapsed())
        ));
        Ok(fitted)
    }

    fn fit_waves(&self) -> Vec<Vec<FitTask<'a, L>>> {
        let layer = self.layer;
        let per_instance = |case: &'a Case<L>| {
            case.instances
                .iter()
                .map(move |instance| FitTask::Estimator { case, instance })
        };

        match (self.topology, &layer.tasks.transformers) {
            (_, None) => {
                vec![layer.tasks.estimators.iter().flat_map(per_instance).collect()]
            }
            (Topology::Dual, Some(transformers)) => vec![
                transformers.iter().map(FitTask::Transformers).collect(),
                layer.tasks.estimators.iter().flat_map(per_instance).collect(),
            ],
            (Topology::Combined, Some(transformers)) => {
                let mut wave: Vec<FitTask<'a, L>> = transformers
                    .iter()
                    .map(|case| FitTask::Pipeline {
                        transformers: case,
                        estimators: layer.tasks.estimators.iter().find(|e| e.name == case.name),
                    })
                    .collect();
                wave.extend(
                    layer
                        .tasks
                        .estimators
                        .iter()
                        .filter(|e| !transformers.iter().any(|t| t.name == e.name))
                        .flat_map(per_instance),
                );
                vec![wave]
            }
        }
    }

    fn run_fit_task(
        &self,
        task: FitTask<'_, L>,
        x: &Features,
        y: ArrayView1<'_, f64>,
        p: &PredictionMatrix,
        cache: &dyn CacheStore,
    ) -> Result<(), EstimationError> {
        match task {
            FitTask::Transformers(case) => self.fit_transformers(case, x, y, cache).map(drop),
            FitTask::Estimator { case, instance } => {
                let origin = self.origin.with_case(&case.name);
                let steps = if self.preprocess() {
                    self.await_chain(&case.name, cache, &origin)?
                } else {
                    Vec::new()
                };
                self.fit_instance(case, instance, &steps, x, y, p, cache, &origin)
            }
            FitTask::Pipeline {
                transformers,
                estimators,
            } => {
                let steps = self.fit_transformers(transformers, x, y, cache)?;
                let Some(case) = estimators else {
                    return Ok(());
                };
                let origin = self.origin.with_case(&case.name);
                for instance in &case.instances {
                    self.fit_instance(case, instance, &steps, x, y, p, cache, &origin)?;
                }
                Ok(())
            }
        }
    }

    fn fit_transformers(
        &self,
        case: &Case<L>,
        x: &Features,
        y: ArrayView1<'_, f64>,
        cache: &dyn CacheStore,
    ) -> Result<Vec<FittedStep<L>>, EstimationError> {
        let origin = self.origin.with_case(&case.name);
        let started = Instant::now();
        let train = slice_rows(x, Some(y), case.train.as_ref())?;
        let y_train = train.y.unwrap_or_else(|| y.to_owned());
        let steps = fit_transform_stage(&case.instances, &train.x, y_train.view(), &origin)?;

        let artifact = TransformerArtifact { steps };
        save_artifact(cache, &transformer_key(&case.name), &artifact)?;
        log::debug!(
            "{origin}Fitted {} preprocessing steps in {:.2?}",
            artifact.steps.len(),
            started.elapsed()
        );
        Ok(artifact.steps)
    }

    fn await_chain(
        &self,
        case: &str,
        cache: &dyn CacheStore,
        origin: &Origin,
    ) -> Result<Vec<FittedStep<L>>, EstimationError> {
        let key = transformer_key(case);
        let policy = self
            .layer
            .config
            .wait_policy()
            .map_err(|source| EstimationError::Config {
                origin: origin.clone(),
                source,
            })?;
        let payload = await_artifact(cache, &key, &policy, origin, self.diagnostics.as_ref())
            .map_err(|err| match err {
                WaitError::Cache(err) => EstimationError::Cache(err),
                err @ WaitError::TimedOut { .. } => EstimationError::ParallelProcessing {
                    origin: origin.clone(),
                    message: err.to_string(),
                },
            })?;
        let artifact: TransformerArtifact<L> = decode_artifact(&key, &payload)?;
        Ok(artifact.steps)
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_instance(
        &self,
        case: &Case<L>,
        instance: &Instance<L>,
        steps: &[FittedStep<L>],
        x: &Features,
        y: ArrayView1<'_, f64>,
        p: &PredictionMatrix,
        cache: &dyn CacheStore,
        origin: &Origin,
    ) -> Result<(), EstimationError> {
        let started = Instant::now();
        let ctx = self.context(origin);
        let columns = self
            .layer
            .columns
            .get(&case.name, &instance.name)
            .ok_or_else(|| EstimationError::MissingColumns {
                origin: origin.clone(),
                instance: instance.name.clone(),
            })?;

        let train = slice_rows(x, Some(y), case.train.as_ref())?;
        let x_train = transform_stage(steps, &train.x, origin)?;
        let y_train = train.y.unwrap_or_else(|| y.to_owned());
        let Some(learner) = fit_estimate_stage(instance, &x_train, y_train.view(), &ctx)? else {
            return Ok(());
        };

        let mut score = None;
        if let Some(test) = &case.test {
            let held = slice_rows(x, Some(y), Some(test))?;
            let x_test = transform_stage(steps, &held.x, origin)?;
            let prediction =
                predict_estimate_stage(&learner, &instance.name, &x_test, self.method(), &ctx)?;
            if let (Some(scorer), Some(values), Some(y_test)) =
                (self.layer.scorer(), &prediction, &held.y)
            {
                score = match scorer(y_test, values) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        log::warn!("{origin}Could not score '{}': {err}", instance.name);
                        None
                    }
                };
            }
            let rows = rebase_rows(held.index.unwrap_or_default(), x.nrows(), p.nrows())?;
            write_back(p, Some(rows.as_slice()), columns, prediction.as_ref())?;
        }

        let artifact = EstimatorArtifact {
            instance: instance.name.clone(),
            learner,
            test: case.test.clone(),
            columns,
            score,
        };
        save_artifact(cache, &estimator_key(&case.name, &instance.name), &artifact)?;
        log::debug!(
            "{origin}Fitted '{}' in {:.2?}",
            instance.name,
            started.elapsed()
        );
        Ok(())
    }

    // ====================================================================================
    //                                    Assembly
    // ====================================================================================

    /// Reads the fitted layer back from the cache. Entries missing from the cache are
    /// instances whose fit was dropped.
    pub fn assemble(&self, cache: &dyn CacheStore) -> Result<FittedLayer<L>, EstimationError> {
        let config = &self.layer.config;

        let preprocessing = match &self.layer.tasks.transformers {
            None => None,
            Some(cases) => {
                let mut fitted = Vec::with_capacity(cases.len());
                for (position, case) in cases.iter().enumerate() {
                    let Some(artifact) = load_if_present::<TransformerArtifact<L>>(
                        cache,
                        &transformer_key(&case.name),
                    )?
                    else {
                        continue;
                    };
                    fitted.push(FittedCase {
                        case: case.name.clone(),
                        scope: FitScope::from_position(position, config.n_prep),
                        steps: artifact.steps,
                    });
                }
                Some(fitted)
            }
        };

        let mut estimators = Vec::new();
        for (position, case) in self.layer.tasks.estimators.iter().enumerate() {
            let scope = FitScope::from_position(position, config.n_pred);
            for instance in &case.instances {
                let Some(artifact) = load_if_present::<EstimatorArtifact<L>>(
                    cache,
                    &estimator_key(&case.name, &instance.name),
                )?
                else {
                    continue;
                };
                estimators.push(FittedEstimator {
                    case: case.name.clone(),
                    instance: artifact.instance,
                    scope,
                    learner: artifact.learner,
                    test: artifact.test,
                    columns: artifact.columns,
                    score: artifact.score,
                });
            }
        }

        let has_folds = self.layer.tasks.estimators.len() > config.n_pred;
        let scores = if self.layer.scorer().is_some() && has_folds {
            let entries = self.score_entries(&estimators);
            Some(build_scores(
                &entries,
                config.raise_on_exception,
                &self.origin,
                self.diagnostics.as_ref(),
            )?)
        } else {
            None
        };

        Ok(FittedLayer {
            preprocessing,
            estimators,
            scores,
        })
    }

    /// One entry per declared instance. An instance whose fit was dropped keeps its place
    /// with no score, so its group cannot be reduced over the remaining folds.
    fn score_entries(&self, fitted: &[FittedEstimator<L>]) -> Vec<ScoreEntry> {
        let config = &self.layer.config;
        let mut entries = Vec::new();
        for (position, case) in self.layer.tasks.estimators.iter().enumerate() {
            for instance in &case.instances {
                let score = fitted
                    .iter()
                    .find(|e| e.case == case.name && e.instance == instance.name)
                    .and_then(|e| e.score);
                entries.push(ScoreEntry {
                    case: case.name.clone(),
                    instance: instance.name.clone(),
                    scope: FitScope::from_position(position, config.n_pred),
                    score,
                });
            }
        }
        entries
    }

    // ====================================================================================
    //                               Predict and transform
    // ====================================================================================

    /// Predicts every row with the full-data estimators.
    pub fn predict(
        &self,
        fitted: &FittedLayer<L>,
        x: &Features,
        p: &PredictionMatrix,
        executor: &dyn ParallelExecutor,
    ) -> Result<(), EstimationError> {
        self.diagnostics
            .stage(&format!("Predicting {}", self.layer.config.name));
        self.run_prediction(fitted, x, p, executor, FitScope::Full)
    }

    /// Writes out-of-fold predictions: every fold estimator predicts the rows it held out.
    pub fn transform(
        &self,
        fitted: &FittedLayer<L>,
        x: &Features,
        p: &PredictionMatrix,
        executor: &dyn ParallelExecutor,
    ) -> Result<(), EstimationError> {
        self.diagnostics
            .stage(&format!("Transforming {}", self.layer.config.name));
        self.run_prediction(fitted, x, p, executor, FitScope::Fold)
    }

    fn run_prediction(
        &self,
        fitted: &FittedLayer<L>,
        x: &Features,
        p: &PredictionMatrix,
        executor: &dyn ParallelExecutor,
        scope: FitScope,
    ) -> Result<(), EstimationError> {
        self.check_config()?;
        if !fitted.is_fitted() {
            return Err(EstimationError::NotFitted {
                origin: self.origin.clone(),
            });
        }
        let started = Instant::now();

        let mut tasks: Vec<Task<'_>> = Vec::new();
        for estimator in fitted.estimators_in(scope) {
            let steps = self.chain_for(fitted, &estimator.case, scope)?;
            tasks.push(Box::new(move || self.predict_estimator(estimator, steps, x, p)));
        }
        log::debug!("{}Dispatching {} prediction tasks", self.origin, tasks.len());
        executor.run(tasks)?;

        self.diagnostics.stage(&format!(
            "{}Done | {}",
            self.origin,
            format_elapsed(started.elapsed())
        ));
        Ok(())
    }

    fn chain_for<'f>(
        &self,
        fitted: &'f FittedLayer<L>,
        case: &str,
        scope: FitScope,
    ) -> Result<&'f [FittedStep<L>], EstimationError> {
        if !self.preprocess() {
            return Ok(&[]);
        }
        fitted
            .preprocessing_for(case)
            .filter(|chain| chain.scope == scope)
            .map(|chain| chain.steps.as_slice())
            .ok_or_else(|| EstimationError::MissingPreprocessing {
                origin: self.origin.clone(),
                case: case.to_string(),
            })
    }

    fn predict_estimator(
        &self,
        estimator: &FittedEstimator<L>,
        steps: &[FittedStep<L>],
        x: &Features,
        p: &PredictionMatrix,
    ) -> Result<(), EstimationError> {
        let origin = self.origin.with_case(&estimator.case);
        let ctx = self.context(&origin);
        let index = match estimator.scope {
            FitScope::Full => None,
            FitScope::Fold => estimator.test.as_ref(),
        };

        let held = slice_rows(x, None, index)?;
        let rows = match held.index {
            Some(rows) => Some(rebase_rows(rows, x.nrows(), p.nrows())?),
            None => None,
        };
        let x_in = transform_stage(steps, &held.x, &origin)?;
        let prediction = predict_estimate_stage(
            &estimator.learner,
            &estimator.instance,
            &x_in,
            self.method(),
            &ctx,
        )?;
        write_back(p, rows.as_deref(), estimator.columns, prediction.as_ref())
    }
}

fn load_if_present<T: serde::de::DeserializeOwned>(
    cache: &dyn CacheStore,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match load_artifact(cache, key) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
