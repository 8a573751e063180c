//! Static check that no two tasks of one wave write the same prediction cell.
//!
//! Fold estimators (those with held-out rows) write their test rows during `fit` and
//! `transform`; full-data estimators write every row during `predict`. Each wave is
//! simulated on an ownership grid and the first doubly claimed cell is reported.

use crate::slice::{SliceError, resolve_checked};
use crate::types::{ColumnMap, TaskSpec};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    /// Out-of-fold writes of `fit` and `transform`.
    Fold,
    /// Full-row writes of `predict`.
    Full,
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fold => "fold",
            Self::Full => "full-data",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("{wave} wave: cell ({row}, {col}) is written by both '{first}' and '{second}'")]
    Overlap {
        wave: Wave,
        row: usize,
        col: usize,
        first: String,
        second: String,
    },

    #[error("estimator '{instance}' of case '{case}' has no assigned columns")]
    Unassigned { case: String, instance: String },

    #[error(transparent)]
    Rows(#[from] SliceError),
}

struct Grid {
    cols: usize,
    owners: Vec<Option<usize>>,
    names: Vec<String>,
}

impl Grid {
    fn new(rows: usize, cols: usize) -> Self {
        Self {
            cols,
            owners: vec![None; rows * cols],
            names: Vec::new(),
        }
    }

    fn claim(
        &mut self,
        wave: Wave,
        owner: String,
        rows: &[usize],
        cols: std::ops::Range<usize>,
    ) -> Result<(), RegionError> {
        let id = self.names.len();
        for &row in rows {
            for col in cols.clone() {
                let cell = &mut self.owners[row * self.cols + col];
                if let Some(previous) = *cell {
                    return Err(RegionError::Overlap {
                        wave,
                        row,
                        col,
                        first: self.names[previous].clone(),
                        second: owner,
                    });
                }
                *cell = Some(id);
            }
        }
        self.names.push(owner);
        Ok(())
    }
}

/// Verifies that the write regions of `tasks` are pairwise disjoint within each wave.
pub fn check_disjoint<L>(
    tasks: &TaskSpec<L>,
    columns: &ColumnMap,
    n_rows: usize,
) -> Result<(), RegionError> {
    let width = columns.total_width();
    let mut fold = Grid::new(n_rows, width);
    let mut full = Grid::new(n_rows, width);
    let all_rows: Vec<usize> = (0..n_rows).collect();

    for case in &tasks.estimators {
        let rows = match &case.test {
            Some(test) => Some(resolve_checked(test, n_rows)?),
            None => None,
        };
        for instance in &case.instances {
            let span = columns.get(&case.name, &instance.name).ok_or_else(|| {
                RegionError::Unassigned {
                    case: case.name.clone(),
                    instance: instance.name.clone(),
                }
            })?;
            let owner = format!("{}/{}", case.name, instance.name);
            match &rows {
                Some(rows) => fold.claim(Wave::Fold, owner, rows, span.as_range())?,
                None => full.claim(Wave::Full, owner, &all_rows, span.as_range())?,
            }
        }
    }
    Ok(())
}
