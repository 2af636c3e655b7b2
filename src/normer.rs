//! Feature and target normalization.
//!
//! A [`Normer`] is fitted once on a training set and then applied to features
//! (per column) or to targets (`theta`). Statistics skip masked entries; masked
//! entries are carried through untouched and stay masked.
//!
//! The transform is affine, `norm(x) = (x - center) / scale`, so `denorm` is its
//! exact inverse up to floating point rounding.

use crate::{masked, Error, MaskedArray, Result, TrainingCase, TrainingSet};

/// Target range of a fitted [`Normer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormKind {
    /// Min-max scaling to `[0, 1]`.
    ZeroOne,
    /// Min-max scaling to `[-1, 1]`.
    #[default]
    MinusOneOne,
    /// Zero mean, unit standard deviation.
    Standard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normer {
    kind: NormKind,
    centers: Vec<f64>,
    scales: Vec<f64>,
}

impl Normer {
    /// Fit per-feature statistics over every realization of every case.
    pub fn fit_features(set: &TrainingSet, kind: NormKind) -> Result<Self> {
        let blocks: Vec<&MaskedArray> =
            set.cases().iter().map(TrainingCase::realizations).collect();
        let all = MaskedArray::vstack(&blocks)?;
        let mut centers = Vec::with_capacity(all.cols());
        let mut scales = Vec::with_capacity(all.cols());
        for c in 0..all.cols() {
            let (values, valid) = all.column(c);
            let (center, scale) = fit_column(kind, &values, &valid)
                .ok_or_else(|| Error::InvalidData(format!("feature {c} has no valid value")))?;
            centers.push(center);
            scales.push(scale);
        }
        Ok(Self {
            kind,
            centers,
            scales,
        })
    }

    /// Fit a single-dimension normer on the cases' `theta` values.
    pub fn fit_targets(set: &TrainingSet, kind: NormKind) -> Result<Self> {
        let thetas = set.thetas();
        let valid = vec![true; thetas.len()];
        let (center, scale) = fit_column(kind, &thetas, &valid)
            .ok_or_else(|| Error::InvalidData("no theta to fit".to_owned()))?;
        Ok(Self {
            kind,
            centers: vec![center],
            scales: vec![scale],
        })
    }

    #[inline]
    pub fn kind(&self) -> NormKind {
        self.kind
    }

    /// Number of dimensions this normer was fitted on.
    #[inline]
    pub fn dim(&self) -> usize {
        self.centers.len()
    }

    /// Panics if `dim >= self.dim()`.
    #[inline]
    pub fn norm_value(&self, x: f64, dim: usize) -> f64 {
        (x - self.centers[dim]) / self.scales[dim]
    }

    /// Panics if `dim >= self.dim()`.
    #[inline]
    pub fn denorm_value(&self, y: f64, dim: usize) -> f64 {
        y * self.scales[dim] + self.centers[dim]
    }

    /// Normalize every valid element column by column.
    pub fn norm_array(&self, a: &MaskedArray) -> Result<MaskedArray> {
        self.apply(a, |x, c| self.norm_value(x, c))
    }

    /// Inverse of [`Normer::norm_array`].
    pub fn denorm_array(&self, a: &MaskedArray) -> Result<MaskedArray> {
        self.apply(a, |y, c| self.denorm_value(y, c))
    }

    fn apply<F: Fn(f64, usize) -> f64>(&self, a: &MaskedArray, f: F) -> Result<MaskedArray> {
        if a.cols() != self.dim() {
            return Err(Error::shape("normer columns", self.dim(), a.cols()));
        }
        Ok(a.map_columns(f))
    }
}

/// Normalize a training set's features and/or targets.
///
/// `targets` must be a single-dimension normer from [`Normer::fit_targets`].
pub fn norm_set(
    set: &TrainingSet,
    features: Option<&Normer>,
    targets: Option<&Normer>,
) -> Result<TrainingSet> {
    if let Some(t) = targets {
        if t.dim() != 1 {
            return Err(Error::shape("target normer", 1, t.dim()));
        }
    }
    let mut cases = Vec::with_capacity(set.len());
    for case in set.cases() {
        let theta = match targets {
            Some(t) => t.norm_value(case.theta(), 0),
            None => case.theta(),
        };
        let reas = match features {
            Some(f) => f.norm_array(case.realizations())?,
            None => case.realizations().clone(),
        };
        cases.push(TrainingCase::with_parts(theta, reas));
    }
    TrainingSet::new(cases)
}

fn fit_column(kind: NormKind, values: &[f64], valid: &[bool]) -> Option<(f64, f64)> {
    let (center, scale) = match kind {
        NormKind::ZeroOne | NormKind::MinusOneOne => {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for (&v, &ok) in values.iter().zip(valid) {
                if ok {
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
            if lo > hi {
                return None;
            }
            if kind == NormKind::ZeroOne {
                (lo, hi - lo)
            } else {
                (0.5 * (lo + hi), 0.5 * (hi - lo))
            }
        }
        NormKind::Standard => (
            masked::mean_skip_invalid(values, valid)?,
            masked::std_skip_invalid(values, valid)?,
        ),
    };
    // Constant columns get unit scale.
    let scale = if scale > 0.0 && scale.is_finite() { scale } else { 1.0 };
    Some((center, scale))
}
