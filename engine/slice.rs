//! # Slice Engine
//!
//! Turns a fold's index specification into concrete rows and copies them out of the
//! shared inputs. Every non-identity slice is an owned copy. Sparse inputs stay sparse.

use crate::types::{Features, IndexSpec};
use ndarray::{Array1, ArrayView1, s};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    #[error("row range [{start}, {end}) is reversed")]
    ReversedRange { start: usize, end: usize },

    #[error("row {row} is out of bounds for an input with {rows} rows")]
    OutOfBounds { row: usize, rows: usize },

    #[error("targets have {targets} rows but the features have {features}; targets must not be shorter")]
    TargetTooShort { targets: usize, features: usize },

    #[error(
        "held-out row {row} cannot be rebased by {offset}: the destination matrix does not track that row"
    )]
    BelowRebase { row: usize, offset: usize },
}

/// The materialized rows of one fold.
#[derive(Debug)]
pub struct Slice<'a> {
    /// Borrowed only when no index was given.
    pub x: Cow<'a, Features>,
    pub y: Option<Array1<f64>>,
    /// The resolved row list, `None` for the identity slice.
    pub index: Option<Vec<usize>>,
}

/// Resolves `index` against `x` and copies the selected rows of `x` and `y`.
pub fn slice_rows<'a>(
    x: &'a Features,
    y: Option<ArrayView1<'_, f64>>,
    index: Option<&IndexSpec>,
) -> Result<Slice<'a>, SliceError> {
    let Some(index) = index else {
        return Ok(Slice {
            x: Cow::Borrowed(x),
            y: y.map(|y| y.to_owned()),
            index: None,
        });
    };

    let rows = resolve_checked(index, x.nrows())?;
    if let Some(y) = &y {
        if let Some(&row) = rows.iter().find(|&&row| row >= y.len()) {
            return Err(SliceError::OutOfBounds { row, rows: y.len() });
        }
    }

    Ok(Slice {
        x: Cow::Owned(x.select_rows(&rows)),
        y: y.map(|y| rows.iter().map(|&row| y[row]).collect()),
        index: Some(rows),
    })
}

/// Resolves an index specification, rejecting reversed ranges and rows past `n_rows`.
pub fn resolve_checked(index: &IndexSpec, n_rows: usize) -> Result<Vec<usize>, SliceError> {
    for segment in index.segments() {
        if segment.start > segment.end {
            return Err(SliceError::ReversedRange {
                start: segment.start,
                end: segment.end,
            });
        }
        if segment.end > n_rows {
            return Err(SliceError::OutOfBounds {
                row: segment.end - 1,
                rows: n_rows,
            });
        }
    }
    Ok(index.resolve())
}

/// Right-aligns the targets with the features.
///
/// When the features are an upstream prediction matrix that only covers the trailing
/// rows of the training set, the leading targets have no matching row and are dropped.
pub fn align_targets<'y>(
    y: ArrayView1<'y, f64>,
    n_rows: usize,
) -> Result<ArrayView1<'y, f64>, SliceError> {
    if y.len() < n_rows {
        return Err(SliceError::TargetTooShort {
            targets: y.len(),
            features: n_rows,
        });
    }
    let rebase = y.len() - n_rows;
    Ok(y.slice_move(s![rebase..]))
}

/// Shifts held-out rows of the input into the coordinates of a destination matrix that
/// tracks only the last `dest_rows` rows.
pub fn rebase_rows(
    rows: Vec<usize>,
    input_rows: usize,
    dest_rows: usize,
) -> Result<Vec<usize>, SliceError> {
    let offset = input_rows.saturating_sub(dest_rows);
    if offset == 0 {
        return Ok(rows);
    }
    rows.into_iter()
        .map(|row| {
            row.checked_sub(offset)
                .ok_or(SliceError::BelowRebase { row, offset })
        })
        .collect()
}
