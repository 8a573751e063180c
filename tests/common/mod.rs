// Toy learners and data shared by the integration tests.
#![allow(dead_code)]

use foldstack::{Features, Learner, LearnerError, Prediction};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Column-wise standardization fitted on the training rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Standardize {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Predicts the training-target mean plus a fixed shift.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeanRegressor {
    pub shift: f64,
    pub mean: f64,
}

/// Predicts the training class frequencies for every row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassProportions {
    pub classes: usize,
    pub proportions: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broken {
    pub message: String,
    pub fitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Toy {
    Standardize(Standardize),
    Mean(MeanRegressor),
    Proportions(ClassProportions),
    /// Fails to fit.
    FailFit(Broken),
    /// Fits, then fails every prediction.
    FailPredict(Broken),
}

impl Toy {
    pub fn standardize() -> Self {
        Self::Standardize(Standardize::default())
    }

    pub fn mean(shift: f64) -> Self {
        Self::Mean(MeanRegressor { shift, mean: 0.0 })
    }

    pub fn proportions(classes: usize) -> Self {
        Self::Proportions(ClassProportions {
            classes,
            proportions: Vec::new(),
        })
    }

    pub fn fail_fit() -> Self {
        Self::FailFit(Broken {
            message: "singular design".to_string(),
            fitted: false,
        })
    }

    pub fn fail_predict() -> Self {
        Self::FailPredict(Broken {
            message: "lost its coefficients".to_string(),
            fitted: false,
        })
    }
}

fn dense(x: &Features) -> Result<&Array2<f64>, LearnerError> {
    x.as_dense().ok_or_else(|| "toy learners need dense input".into())
}

impl Learner for Toy {
    fn fit(&mut self, x: &Features, y: ArrayView1<'_, f64>) -> Result<(), LearnerError> {
        match self {
            Self::Standardize(s) => {
                let x = dense(x)?;
                s.mean = x.mean_axis(Axis(0)).ok_or("no rows")?.to_vec();
                s.scale = x
                    .std_axis(Axis(0), 0.0)
                    .iter()
                    .map(|&sd| if sd > 0.0 { sd } else { 1.0 })
                    .collect();
            }
            Self::Mean(m) => m.mean = y.mean().ok_or("no targets")?,
            Self::Proportions(p) => {
                let mut counts = vec![0.0; p.classes];
                for &label in y {
                    let class = label as usize;
                    *counts.get_mut(class).ok_or("label out of range")? += 1.0;
                }
                p.proportions = counts.iter().map(|c| c / y.len() as f64).collect();
            }
            Self::FailFit(b) => return Err(b.message.clone().into()),
            Self::FailPredict(b) => b.fitted = true,
        }
        Ok(())
    }

    fn transform(&self, x: &Features) -> Result<Features, LearnerError> {
        match self {
            Self::Standardize(s) => {
                let mut out = dense(x)?.clone();
                for (j, mut column) in out.columns_mut().into_iter().enumerate() {
                    column.mapv_inplace(|v| (v - s.mean[j]) / s.scale[j]);
                }
                Ok(Features::Dense(out))
            }
            _ => Err("not a transformer".into()),
        }
    }

    fn predict(&self, x: &Features) -> Result<Array1<f64>, LearnerError> {
        match self {
            Self::Mean(m) => Ok(Array1::from_elem(x.nrows(), m.mean + m.shift)),
            Self::Proportions(p) => {
                let best = p
                    .proportions
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(class, _)| class);
                Ok(Array1::from_elem(x.nrows(), best as f64))
            }
            Self::FailPredict(b) => Err(b.message.clone().into()),
            _ => Err("not an estimator".into()),
        }
    }

    fn predict_proba(&self, x: &Features) -> Result<Array2<f64>, LearnerError> {
        match self {
            Self::Proportions(p) => Ok(Array2::from_shape_fn((x.nrows(), p.classes), |(_, c)| {
                p.proportions[c]
            })),
            _ => Err("no class probabilities".into()),
        }
    }
}

/// `n` rows of two features; the target of row `i` is `i`.
pub fn ramp(n: usize) -> (Features, Array1<f64>) {
    let x = Array2::from_shape_fn((n, 2), |(i, j)| (i * (j + 1)) as f64);
    let y = Array1::from_iter((0..n).map(|i| i as f64));
    (Features::Dense(x), y)
}

/// Negative mean absolute error of point predictions.
pub fn neg_mae(y: &Array1<f64>, prediction: &Prediction) -> Result<f64, LearnerError> {
    match prediction {
        Prediction::Single(p) => Ok(-(y - p).mapv(f64::abs).mean().ok_or("empty fold")?),
        Prediction::Multi(_) => Err("point predictions required".into()),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
