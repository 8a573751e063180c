// ========================================================================================
//
//                            THE SHARED PREDICTION MATRIX
//
// ========================================================================================
//
// ### Purpose ###
//
// Every worker of a fit/predict/transform call writes its out-of-fold or full-data
// predictions into one matrix. Workers never coordinate their writes: the task layout
// guarantees that no two concurrently scheduled tasks own the same (row, column) cell.
// Each cell is therefore stored as an `AtomicU64` holding the bit pattern of an `f64`,
// which lets the matrix be shared by plain reference without locks or unsafe aliasing
// of `&mut` data. The file-backed variant maps the same cells from disk so that other
// processes can open the same storage.

use crate::types::{ColumnSpan, Prediction};
use memmap2::{MmapMut, MmapOptions};
use ndarray::Array2;
use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("I/O error on the prediction matrix backing file: {0}")]
    Io(#[from] io::Error),

    #[error("prediction has {found} rows but {expected} destination rows were selected")]
    RowMismatch { found: usize, expected: usize },

    #[error("prediction has {found} columns but the assigned span holds {expected}")]
    WidthMismatch { found: usize, expected: usize },

    #[error("cell ({row}, {col}) is outside the {rows}x{cols} prediction matrix")]
    OutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("a {rows}x{cols} prediction matrix does not fit in the address space")]
    TooLarge { rows: usize, cols: usize },
}

enum Backing {
    Heap(Box<[AtomicU64]>),
    Mapped(MmapMut),
}

/// Row-major `f64` matrix written concurrently by disjoint workers.
pub struct PredictionMatrix {
    rows: usize,
    cols: usize,
    backing: Backing,
}

impl PredictionMatrix {
    /// A zero-filled matrix on the heap.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self, MatrixError> {
        let n = rows
            .checked_mul(cols)
            .filter(|cells| cells.checked_mul(size_of::<u64>()).is_some())
            .ok_or(MatrixError::TooLarge { rows, cols })?;
        let cells = (0..n).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            rows,
            cols,
            backing: Backing::Heap(cells),
        })
    }

    /// A zero-filled matrix mapped from a freshly created (or truncated) file.
    pub fn create_mapped(path: &Path, rows: usize, cols: usize) -> Result<Self, MatrixError> {
        let bytes = rows
            .checked_mul(cols)
            .and_then(|cells| cells.checked_mul(size_of::<u64>()))
            .ok_or(MatrixError::TooLarge { rows, cols })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(bytes as u64)?;
        if bytes == 0 {
            return Self::zeros(rows, cols);
        }
        // SAFETY: the file was just created and sized by this process; concurrent access
        // from other processes goes through the same atomic cell protocol.
        let map = unsafe { MmapOptions::new().len(bytes).map_mut(&file)? };
        log::debug!(
            "Mapped {}x{} prediction matrix at {}",
            rows,
            cols,
            path.display()
        );
        Ok(Self {
            rows,
            cols,
            backing: Backing::Mapped(map),
        })
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    fn cells(&self) -> &[AtomicU64] {
        match &self.backing {
            Backing::Heap(cells) => &cells[..],
            Backing::Mapped(map) => {
                // SAFETY: the map is page aligned and exactly `rows * cols` u64 cells long,
                // and every access to it goes through `AtomicU64`.
                unsafe {
                    std::slice::from_raw_parts(map.as_ptr().cast::<AtomicU64>(), self.rows * self.cols)
                }
            }
        }
    }

    #[inline]
    fn store(&self, cells: &[AtomicU64], row: usize, col: usize, value: f64) {
        cells[row * self.cols + col].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let bits = self.cells()[row * self.cols + col].load(Ordering::Relaxed);
        Some(f64::from_bits(bits))
    }

    fn check_region(&self, rows: Option<&[usize]>, columns: ColumnSpan) -> Result<(), MatrixError> {
        if columns.end() > self.cols {
            return Err(MatrixError::OutOfBounds {
                row: 0,
                col: columns.end() - 1,
                rows: self.rows,
                cols: self.cols,
            });
        }
        if let Some(&row) = rows.and_then(|rows| rows.iter().find(|&&row| row >= self.rows)) {
            return Err(MatrixError::OutOfBounds {
                row,
                col: columns.offset,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(())
    }

    /// Writes `values` into `columns` of the selected rows (`None` selects every row).
    pub fn write(
        &self,
        rows: Option<&[usize]>,
        columns: ColumnSpan,
        values: &Prediction,
    ) -> Result<(), MatrixError> {
        let expected = rows.map_or(self.rows, <[usize]>::len);
        if values.nrows() != expected {
            return Err(MatrixError::RowMismatch {
                found: values.nrows(),
                expected,
            });
        }
        if values.width() != columns.width {
            return Err(MatrixError::WidthMismatch {
                found: values.width(),
                expected: columns.width,
            });
        }
        self.check_region(rows, columns)?;

        let cells = self.cells();
        for i in 0..expected {
            let row = rows.map_or(i, |rows| rows[i]);
            match values {
                Prediction::Single(p) => self.store(cells, row, columns.offset, p[i]),
                Prediction::Multi(p) => {
                    for (j, &value) in p.row(i).iter().enumerate() {
                        self.store(cells, row, columns.offset + j, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Sets every cell of the region to `value`.
    pub fn fill(
        &self,
        rows: Option<&[usize]>,
        columns: ColumnSpan,
        value: f64,
    ) -> Result<(), MatrixError> {
        self.check_region(rows, columns)?;
        let cells = self.cells();
        let n = rows.map_or(self.rows, <[usize]>::len);
        for i in 0..n {
            let row = rows.map_or(i, |rows| rows[i]);
            for col in columns.as_range() {
                self.store(cells, row, col, value);
            }
        }
        Ok(())
    }

    /// Snapshot of the current contents.
    pub fn to_array(&self) -> Array2<f64> {
        let cells = self.cells();
        Array2::from_shape_fn((self.rows, self.cols), |(row, col)| {
            f64::from_bits(cells[row * self.cols + col].load(Ordering::Relaxed))
        })
    }

    /// Flushes a mapped matrix to its file. A no-op on the heap.
    pub fn flush(&self) -> Result<(), MatrixError> {
        if let Backing::Mapped(map) = &self.backing {
            map.flush()?;
        }
        Ok(())
    }
}
