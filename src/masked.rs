//! Masked arrays.
//!
//! A `MaskedArray` pairs a row-major value buffer with a same-shaped validity mask.
//! Rows are realizations (or samples), columns are features (or network outputs).
//!
//! Two masking rules exist, and every operation in the crate uses one of them:
//!
//! - **propagate** (elementwise arithmetic): an output element is invalid if any
//!   input element it depends on is invalid. See [`MaskedArray::map`] and
//!   [`all_valid`].
//! - **skip-invalid** (case/realization-level reductions): invalid entries are
//!   dropped and the denominator shrinks accordingly. A reduction over zero valid
//!   entries yields `None` ("no contribution"), never `0.0` or `NaN`.
//!   See [`mean_skip_invalid`], [`weighted_mean_skip_invalid`], [`std_skip_invalid`].
//!
//! Invalid elements keep whatever value was stored; no operation reads them.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct MaskedArray {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
    valid: Vec<bool>,
}

impl MaskedArray {
    /// Build from flat row-major buffers with shape `(rows, cols)`.
    pub fn new(rows: usize, cols: usize, values: Vec<f64>, valid: Vec<bool>) -> Result<Self> {
        if cols == 0 {
            return Err(Error::InvalidData("masked array cols must be > 0".to_owned()));
        }
        let expected = rows
            .checked_mul(cols)
            .ok_or_else(|| Error::InvalidData("masked array shape overflow".to_owned()))?;
        if values.len() != expected {
            return Err(Error::shape("masked array values", expected, values.len()));
        }
        if valid.len() != expected {
            return Err(Error::shape("masked array mask", expected, valid.len()));
        }
        Ok(Self {
            rows,
            cols,
            values,
            valid,
        })
    }

    /// Fully valid array from a flat buffer.
    pub fn from_flat(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self> {
        let n = values.len();
        Self::new(rows, cols, values, vec![true; n])
    }

    /// Fully valid array from per-row vectors.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let opts: Vec<Vec<Option<f64>>> = rows
            .iter()
            .map(|r| r.iter().copied().map(Some).collect())
            .collect();
        Self::from_options(&opts)
    }

    /// Build from per-row optional values; `None` marks an invalid element.
    pub fn from_options(rows: &[Vec<Option<f64>>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if cols == 0 {
            return Err(Error::InvalidData(
                "masked array needs at least one row and one column".to_owned(),
            ));
        }
        let mut values = Vec::with_capacity(rows.len() * cols);
        let mut valid = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(Error::shape(format!("masked array row {i}"), cols, row.len()));
            }
            for v in row {
                values.push(v.unwrap_or(0.0));
                valid.push(v.is_some());
            }
        }
        Self::new(rows.len(), cols, values, valid)
    }

    /// Build from a flat buffer, masking every non-finite value.
    pub fn from_flat_masking_nonfinite(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self> {
        let valid = values.iter().map(|v| v.is_finite()).collect();
        Self::new(rows, cols, values, valid)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn mask(&self) -> &[bool] {
        &self.valid
    }

    /// Row `r` values (shape `(cols,)`). Panics if `r >= rows`.
    #[inline]
    pub fn row(&self, r: usize) -> &[f64] {
        let start = r * self.cols;
        &self.values[start..start + self.cols]
    }

    /// Row `r` validity (shape `(cols,)`). Panics if `r >= rows`.
    #[inline]
    pub fn row_mask(&self, r: usize) -> &[bool] {
        let start = r * self.cols;
        &self.valid[start..start + self.cols]
    }

    /// Element `(r, c)` if valid.
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> Option<f64> {
        let idx = r * self.cols + c;
        if self.valid[idx] {
            Some(self.values[idx])
        } else {
            None
        }
    }

    /// Set element `(r, c)` to a valid value.
    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        let idx = r * self.cols + c;
        self.values[idx] = value;
        self.valid[idx] = true;
    }

    /// Mark element `(r, c)` invalid. The stored value is kept but never read.
    pub fn mask_element(&mut self, r: usize, c: usize) {
        self.valid[r * self.cols + c] = false;
    }

    /// Mark every element of row `r` invalid.
    pub fn mask_row(&mut self, r: usize) {
        let start = r * self.cols;
        self.valid[start..start + self.cols].fill(false);
    }

    /// Overwrite the stored value at `(r, c)` without touching validity.
    pub fn overwrite_raw(&mut self, r: usize, c: usize, value: f64) {
        self.values[r * self.cols + c] = value;
    }

    /// True if every element of row `r` is valid (propagate rule over the row).
    #[inline]
    pub fn row_is_valid(&self, r: usize) -> bool {
        all_valid(self.row_mask(r))
    }

    /// Number of rows whose elements are all valid.
    pub fn count_valid_rows(&self) -> usize {
        (0..self.rows).filter(|&r| self.row_is_valid(r)).count()
    }

    /// Number of valid elements.
    pub fn count_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Elementwise map (propagate rule: invalid stays invalid).
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        self.map_columns(|v, _| f(v))
    }

    /// As [`MaskedArray::map`], with the column index passed to `f`.
    pub fn map_columns<F: Fn(f64, usize) -> f64>(&self, f: F) -> Self {
        let values = self
            .values
            .iter()
            .zip(&self.valid)
            .enumerate()
            .map(|(i, (&v, &ok))| if ok { f(v, i % self.cols) } else { v })
            .collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            values,
            valid: self.valid.clone(),
        }
    }

    /// Column `c` as `(values, validity)` vectors.
    pub fn column(&self, c: usize) -> (Vec<f64>, Vec<bool>) {
        let values = (0..self.rows).map(|r| self.values[r * self.cols + c]).collect();
        let valid = (0..self.rows).map(|r| self.valid[r * self.cols + c]).collect();
        (values, valid)
    }

    /// Rows selected by index, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Self> {
        let mut values = Vec::with_capacity(indices.len() * self.cols);
        let mut valid = Vec::with_capacity(indices.len() * self.cols);
        for &r in indices {
            if r >= self.rows {
                return Err(Error::InvalidData(format!(
                    "row index {r} out of range for {} rows",
                    self.rows
                )));
            }
            values.extend_from_slice(self.row(r));
            valid.extend_from_slice(self.row_mask(r));
        }
        Self::new(indices.len(), self.cols, values, valid)
    }

    /// Stack arrays vertically. All parts must share the column count.
    pub fn vstack(parts: &[&MaskedArray]) -> Result<Self> {
        let cols = parts
            .first()
            .map(|p| p.cols)
            .ok_or_else(|| Error::InvalidData("vstack needs at least one array".to_owned()))?;
        let mut values = Vec::new();
        let mut valid = Vec::new();
        let mut rows = 0;
        for p in parts {
            if p.cols != cols {
                return Err(Error::shape("vstack cols", cols, p.cols));
            }
            values.extend_from_slice(&p.values);
            valid.extend_from_slice(&p.valid);
            rows += p.rows;
        }
        Self::new(rows, cols, values, valid)
    }
}

/// Propagate rule over a group of elements: valid only if all are valid.
#[inline]
pub fn all_valid(mask: &[bool]) -> bool {
    mask.iter().all(|&v| v)
}

/// Mean over valid entries, `None` when there are none.
pub fn mean_skip_invalid(values: &[f64], valid: &[bool]) -> Option<f64> {
    debug_assert_eq!(values.len(), valid.len());
    let mut sum = 0.0;
    let mut n = 0usize;
    for (&v, &ok) in values.iter().zip(valid) {
        if ok {
            sum += v;
            n += 1;
        }
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Weighted mean over valid entries, `None` when there are none or the valid
/// weights sum to zero.
pub fn weighted_mean_skip_invalid(values: &[f64], weights: &[f64], valid: &[bool]) -> Option<f64> {
    debug_assert_eq!(values.len(), valid.len());
    debug_assert_eq!(weights.len(), valid.len());
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..values.len() {
        if valid[i] {
            num += weights[i] * values[i];
            den += weights[i];
        }
    }
    if den > 0.0 && den.is_finite() {
        Some(num / den)
    } else {
        None
    }
}

/// Population standard deviation over valid entries, `None` when there are none.
pub fn std_skip_invalid(values: &[f64], valid: &[bool]) -> Option<f64> {
    let mean = mean_skip_invalid(values, valid)?;
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for (&v, &ok) in values.iter().zip(valid) {
        if ok {
            let d = v - mean;
            sum_sq = d.mul_add(d, sum_sq);
            n += 1;
        }
    }
    Some((sum_sq / n as f64).sqrt())
}

/// Median over valid entries, `None` when there are none.
pub fn median_skip_invalid(values: &[f64], valid: &[bool]) -> Option<f64> {
    let mut kept: Vec<f64> = values
        .iter()
        .zip(valid)
        .filter(|(_, &ok)| ok)
        .map(|(&v, _)| v)
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.sort_by(|a, b| a.total_cmp(b));
    let mid = kept.len() / 2;
    if kept.len() % 2 == 1 {
        Some(kept[mid])
    } else {
        Some(0.5 * (kept[mid - 1] + kept[mid]))
    }
}
