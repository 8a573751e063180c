//! # K-fold Stacking Layout
//!
//! Builds the task listing and column assignment of a cross-validated layer:
//!
//! - every case is fitted once on all rows (`n_pred` full-data cases, predicted with
//!   `predict`);
//! - every case is then fitted once per fold, named `"{case}__{fold}"` with instances
//!   `"{instance}__{fold}"`, predicting the rows the fold holds out (used by `fit` and
//!   `transform`).
//!
//! The fold copies of an instance share the columns of their full-data instance. Their
//! test rows partition the data, so no two tasks of the same wave touch the same cell.

use crate::layer::{Layer, LayerConfig};
use crate::types::{
    Case, ColumnMap, ColumnSpan, DuplicateColumn, IndexSpec, Instance, RowRange, TaskSpec,
};
use ahash::AHashSet;
use thiserror::Error;

const SEPARATOR: &str = "__";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("cross-validation needs at least 2 folds, got {0}")]
    TooFewSplits(usize),

    #[error("cannot split {rows} rows into {splits} folds")]
    TooFewRows { rows: usize, splits: usize },

    #[error("name '{0}' contains the reserved separator '__'")]
    ReservedSeparator(String),

    #[error("name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("estimator '{0}' must write at least one column")]
    ZeroWidth(String),

    #[error("a layer needs at least one case with at least one estimator")]
    Empty,

    #[error(transparent)]
    Columns(#[from] DuplicateColumn),
}

// ========================================================================================
//                                       Folds
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: IndexSpec,
    pub test: IndexSpec,
}

/// Contiguous, unshuffled k-fold split. The first `n_rows % n_splits` folds hold one
/// extra row.
#[derive(Debug, Clone)]
pub struct FoldPlan {
    n_rows: usize,
    folds: Vec<Fold>,
}

impl FoldPlan {
    pub fn new(n_rows: usize, n_splits: usize) -> Result<Self, LayoutError> {
        if n_splits < 2 {
            return Err(LayoutError::TooFewSplits(n_splits));
        }
        if n_rows < n_splits {
            return Err(LayoutError::TooFewRows {
                rows: n_rows,
                splits: n_splits,
            });
        }

        let base = n_rows / n_splits;
        let extra = n_rows % n_splits;
        let mut folds = Vec::with_capacity(n_splits);
        let mut start = 0;
        for index in 0..n_splits {
            let end = start + base + usize::from(index < extra);
            let train: Vec<RowRange> = [RowRange::new(0, start), RowRange::new(end, n_rows)]
                .into_iter()
                .filter(|segment| !segment.is_empty())
                .collect();
            let train = match train.as_slice() {
                [single] => IndexSpec::Range(*single),
                _ => IndexSpec::Ranges(train),
            };
            folds.push(Fold {
                index,
                train,
                test: IndexSpec::range(start, end),
            });
            start = end;
        }
        Ok(Self { n_rows, folds })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_splits(&self) -> usize {
        self.folds.len()
    }

    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }
}

// ========================================================================================
//                                   Layout builder
// ========================================================================================

#[derive(Debug, Clone)]
pub struct EstimatorLayout<L> {
    pub instance: Instance<L>,
    /// Output columns: 1 for point predictions, the class count for probabilities.
    pub width: usize,
}

/// One preprocessing variant and the estimators fitted after it.
#[derive(Debug, Clone)]
pub struct CaseLayout<L> {
    pub name: String,
    pub steps: Vec<Instance<L>>,
    pub estimators: Vec<EstimatorLayout<L>>,
}

impl<L> CaseLayout<L> {
    /// An empty name stands for "no preprocessing variant".
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            estimators: Vec::new(),
        }
    }

    pub fn step(mut self, name: impl Into<String>, learner: L) -> Self {
        self.steps.push(Instance::new(name, learner));
        self
    }

    pub fn estimator(self, name: impl Into<String>, learner: L) -> Self {
        self.estimator_with_width(name, learner, 1)
    }

    pub fn estimator_with_width(mut self, name: impl Into<String>, learner: L, width: usize) -> Self {
        self.estimators.push(EstimatorLayout {
            instance: Instance::new(name, learner),
            width,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct StackLayout<L> {
    n_splits: usize,
    cases: Vec<CaseLayout<L>>,
}

fn fold_case_name(case: &str, fold: usize) -> String {
    if case.is_empty() {
        fold.to_string()
    } else {
        format!("{case}{SEPARATOR}{fold}")
    }
}

fn check_name(name: &str, seen: &mut AHashSet<String>) -> Result<(), LayoutError> {
    if name.contains(SEPARATOR) {
        return Err(LayoutError::ReservedSeparator(name.to_string()));
    }
    if !seen.insert(name.to_string()) {
        return Err(LayoutError::DuplicateName(name.to_string()));
    }
    Ok(())
}

impl<L: Clone> StackLayout<L> {
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            cases: Vec::new(),
        }
    }

    pub fn case(mut self, case: CaseLayout<L>) -> Self {
        self.cases.push(case);
        self
    }

    fn validate(&self) -> Result<(), LayoutError> {
        if self.cases.iter().all(|case| case.estimators.is_empty()) {
            return Err(LayoutError::Empty);
        }
        let mut case_names = AHashSet::new();
        for case in &self.cases {
            check_name(&case.name, &mut case_names)?;
            let mut instance_names = AHashSet::new();
            for step in &case.steps {
                check_name(&step.name, &mut instance_names)?;
            }
            let mut estimator_names = AHashSet::new();
            for estimator in &case.estimators {
                check_name(&estimator.instance.name, &mut estimator_names)?;
                if estimator.width == 0 {
                    return Err(LayoutError::ZeroWidth(estimator.instance.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Lays out a layer over `n_rows` training rows. `config.n_pred` and `config.n_prep`
    /// are overwritten with the number of full-data cases.
    pub fn build(self, mut config: LayerConfig, n_rows: usize) -> Result<Layer<L>, LayoutError> {
        self.validate()?;
        let plan = FoldPlan::new(n_rows, self.n_splits)?;
        let preprocess = self.cases.iter().any(|case| !case.steps.is_empty());

        let mut columns = ColumnMap::new();
        let mut estimators = Vec::with_capacity(self.cases.len() * (plan.n_splits() + 1));
        let mut transformers = Vec::with_capacity(estimators.capacity());
        let mut generated = AHashSet::new();
        let mut offset = 0;

        let mut spans = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let mut case_spans = Vec::with_capacity(case.estimators.len());
            for estimator in &case.estimators {
                let span = ColumnSpan::new(offset, estimator.width);
                columns.insert(&case.name, &estimator.instance.name, span)?;
                case_spans.push(span);
                offset += estimator.width;
            }
            spans.push(case_spans);
            generated.insert(case.name.clone());
            estimators.push(Case {
                name: case.name.clone(),
                train: None,
                test: None,
                instances: case.estimators.iter().map(|e| e.instance.clone()).collect(),
            });
            transformers.push(Case {
                name: case.name.clone(),
                train: None,
                test: None,
                instances: case.steps.clone(),
            });
        }

        for (case, case_spans) in self.cases.iter().zip(&spans) {
            for fold in plan.folds() {
                let name = fold_case_name(&case.name, fold.index);
                if !generated.insert(name.clone()) {
                    return Err(LayoutError::DuplicateName(name));
                }
                let mut instances = Vec::with_capacity(case.estimators.len());
                for (estimator, span) in case.estimators.iter().zip(case_spans) {
                    let instance = format!("{}{SEPARATOR}{}", estimator.instance.name, fold.index);
                    columns.insert(&name, &instance, *span)?;
                    instances.push(Instance::new(instance, estimator.instance.learner.clone()));
                }
                estimators.push(Case {
                    name: name.clone(),
                    train: Some(fold.train.clone()),
                    test: Some(fold.test.clone()),
                    instances,
                });
                transformers.push(Case {
                    name,
                    train: Some(fold.train.clone()),
                    test: Some(fold.test.clone()),
                    instances: case.steps.clone(),
                });
            }
        }

        config.n_pred = self.cases.len();
        config.n_prep = if preprocess { self.cases.len() } else { 0 };
        log::debug!(
            "Laid out {} cases over {} folds ({} columns)",
            self.cases.len(),
            plan.n_splits(),
            offset
        );
        let tasks = TaskSpec {
            estimators,
            transformers: preprocess.then_some(transformers),
        };
        Ok(Layer::new(config, tasks, columns))
    }
}
