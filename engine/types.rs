// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ahash::AHashMap;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

// ========================================================================================
//                                  Row selections
// ========================================================================================

/// A half-open `[start, end)` block of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub start: usize,
    pub end: usize,
}

impl RowRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Which rows a fold trains on or predicts into.
///
/// A fold built from several disjoint segments (the training side of an interior
/// k-fold split, for example) uses `Ranges`; the segments are concatenated in the
/// order they are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSpec {
    Range(RowRange),
    Ranges(Vec<RowRange>),
}

impl IndexSpec {
    pub fn range(start: usize, end: usize) -> Self {
        Self::Range(RowRange::new(start, end))
    }

    pub fn ranges<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        Self::Ranges(
            segments
                .into_iter()
                .map(|(start, end)| RowRange::new(start, end))
                .collect(),
        )
    }

    pub fn segments(&self) -> &[RowRange] {
        match self {
            Self::Range(range) => std::slice::from_ref(range),
            Self::Ranges(ranges) => ranges,
        }
    }

    /// Total number of rows selected.
    pub fn len(&self) -> usize {
        self.segments().iter().map(RowRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The concrete row list, segments concatenated in order.
    pub fn resolve(&self) -> Vec<usize> {
        let mut rows = Vec::with_capacity(self.len());
        for segment in self.segments() {
            rows.extend(segment.as_range());
        }
        rows
    }
}

// ========================================================================================
//                                 Column assignment
// ========================================================================================

/// The block of prediction-matrix columns owned by one estimator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpan {
    pub offset: usize,
    pub width: usize,
}

impl ColumnSpan {
    pub fn single(offset: usize) -> Self {
        Self { offset, width: 1 }
    }

    pub fn new(offset: usize, width: usize) -> Self {
        Self { offset, width }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.width
    }

    pub fn as_range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("column span for case '{case}', instance '{instance}' was already assigned")]
pub struct DuplicateColumn {
    pub case: String,
    pub instance: String,
}

/// Maps `(case, instance)` to its output columns. Entries are write-once.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    spans: AHashMap<(String, String), ColumnSpan>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        case: &str,
        instance: &str,
        span: ColumnSpan,
    ) -> Result<(), DuplicateColumn> {
        let key = (case.to_string(), instance.to_string());
        if self.spans.contains_key(&key) {
            return Err(DuplicateColumn {
                case: key.0,
                instance: key.1,
            });
        }
        self.spans.insert(key, span);
        Ok(())
    }

    pub fn get(&self, case: &str, instance: &str) -> Option<ColumnSpan> {
        self.spans
            .get(&(case.to_string(), instance.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of columns a prediction matrix needs to hold every span.
    pub fn total_width(&self) -> usize {
        self.spans.values().map(ColumnSpan::end).max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), &ColumnSpan)> {
        self.spans.iter()
    }
}

// ========================================================================================
//                                   Task listing
// ========================================================================================

/// A named learner inside a case.
#[derive(Debug, Clone)]
pub struct Instance<L> {
    pub name: String,
    pub learner: L,
}

impl<L> Instance<L> {
    pub fn new(name: impl Into<String>, learner: L) -> Self {
        Self {
            name: name.into(),
            learner,
        }
    }
}

/// One preprocessing variant (or one fold of it) and the instances fitted under it.
///
/// `train = None` fits on every row; `test = None` means nothing is predicted during fit.
#[derive(Debug, Clone)]
pub struct Case<L> {
    pub name: String,
    pub train: Option<IndexSpec>,
    pub test: Option<IndexSpec>,
    pub instances: Vec<Instance<L>>,
}

/// Everything one layer fits, in declaration order.
#[derive(Debug, Clone)]
pub struct TaskSpec<L> {
    pub estimators: Vec<Case<L>>,
    pub transformers: Option<Vec<Case<L>>>,
}

/// Whether a fitted entry was trained on all rows or on one fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitScope {
    Full,
    Fold,
}

impl FitScope {
    /// The first `n_full` declared entries are full-data fits.
    pub fn from_position(position: usize, n_full: usize) -> Self {
        if position < n_full {
            Self::Full
        } else {
            Self::Fold
        }
    }
}

// ========================================================================================
//                                 Feature matrices
// ========================================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid sparse layout: {0}")]
pub struct SparseLayoutError(pub &'static str);

/// Compressed sparse row storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    pub fn new(
        ncols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, SparseLayoutError> {
        if indptr.first() != Some(&0) {
            return Err(SparseLayoutError("indptr must start at 0"));
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(SparseLayoutError("indptr must be non-decreasing"));
        }
        if indptr.last() != Some(&indices.len()) || indices.len() != values.len() {
            return Err(SparseLayoutError(
                "indptr, indices and values lengths disagree",
            ));
        }
        if indices.iter().any(|&c| c >= ncols) {
            return Err(SparseLayoutError("column index out of bounds"));
        }
        Ok(Self {
            ncols,
            indptr,
            indices,
            values,
        })
    }

    pub fn from_dense(dense: &Array2<f64>) -> Self {
        let mut indptr = Vec::with_capacity(dense.nrows() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for row in dense.rows() {
            for (col, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    indices.push(col);
                    values.push(value);
                }
            }
            indptr.push(indices.len());
        }
        Self {
            ncols: dense.ncols(),
            indptr,
            indices,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.nrows(), self.ncols));
        for row in 0..self.nrows() {
            for k in self.indptr[row]..self.indptr[row + 1] {
                dense[[row, self.indices[k]]] = self.values[k];
            }
        }
        dense
    }

    /// Gathers the listed rows into a new matrix without densifying.
    /// Callers guarantee every row is in bounds.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for &row in rows {
            let block = self.indptr[row]..self.indptr[row + 1];
            indices.extend_from_slice(&self.indices[block.clone()]);
            values.extend_from_slice(&self.values[block]);
            indptr.push(indices.len());
        }
        Self {
            ncols: self.ncols,
            indptr,
            indices,
            values,
        }
    }
}

/// Learner input. Dense features are row-major `ndarray` matrices.
#[derive(Debug, Clone, PartialEq)]
pub enum Features {
    Dense(Array2<f64>),
    Sparse(CsrMatrix),
}

impl Features {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(x) => x.nrows(),
            Self::Sparse(x) => x.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(x) => x.ncols(),
            Self::Sparse(x) => x.ncols(),
        }
    }

    pub fn as_dense(&self) -> Option<&Array2<f64>> {
        match self {
            Self::Dense(x) => Some(x),
            Self::Sparse(_) => None,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Owned copy of the listed rows. Bounds are checked by the caller.
    pub fn select_rows(&self, rows: &[usize]) -> Features {
        match self {
            Self::Dense(x) => Self::Dense(x.select(Axis(0), rows)),
            Self::Sparse(x) => Self::Sparse(x.select_rows(rows)),
        }
    }
}

impl From<Array2<f64>> for Features {
    fn from(x: Array2<f64>) -> Self {
        Self::Dense(x)
    }
}

impl From<CsrMatrix> for Features {
    fn from(x: CsrMatrix) -> Self {
        Self::Sparse(x)
    }
}

// ========================================================================================
//                                    Predictions
// ========================================================================================

/// Output of one predict call: a single column or a block of columns
/// (per-class probabilities, for instance).
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Single(Array1<f64>),
    Multi(Array2<f64>),
}

impl Prediction {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Single(p) => p.len(),
            Self::Multi(p) => p.nrows(),
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(p) => p.ncols(),
        }
    }
}
