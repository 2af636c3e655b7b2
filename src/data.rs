//! Training data.
//!
//! A [`TrainingCase`] is one true explanatory value (`theta`) plus a population of
//! noisy feature-vector realizations drawn from it, stored as a [`MaskedArray`] with
//! shape `(n_realizations, feature_dim)`. A [`TrainingSet`] is an ordered, validated
//! collection of cases sharing the same feature dimension. Cases may carry different
//! numbers of realizations.
//!
//! Training sets are built once and only read afterwards; subsetting operations
//! (validation split, minibatch, bootstrap) return new sets.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{Error, MaskedArray, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCase {
    theta: f64,
    realizations: MaskedArray,
}

impl TrainingCase {
    pub fn new(theta: f64, realizations: MaskedArray) -> Result<Self> {
        if !theta.is_finite() {
            return Err(Error::InvalidData(format!("theta must be finite, got {theta}")));
        }
        if realizations.rows() == 0 {
            return Err(Error::InvalidData(
                "a case needs at least one realization".to_owned(),
            ));
        }
        Ok(Self {
            theta,
            realizations,
        })
    }

    /// Case with fully valid realizations given as rows.
    pub fn from_rows(theta: f64, rows: &[Vec<f64>]) -> Result<Self> {
        Self::new(theta, MaskedArray::from_rows(rows)?)
    }

    #[inline]
    pub fn theta(&self) -> f64 {
        self.theta
    }

    #[inline]
    pub fn realizations(&self) -> &MaskedArray {
        &self.realizations
    }

    #[inline]
    pub fn n_realizations(&self) -> usize {
        self.realizations.rows()
    }

    #[inline]
    pub fn feature_dim(&self) -> usize {
        self.realizations.cols()
    }

    /// Realizations with every feature valid.
    pub fn n_valid_realizations(&self) -> usize {
        self.realizations.count_valid_rows()
    }

    pub(crate) fn with_parts(theta: f64, realizations: MaskedArray) -> Self {
        Self {
            theta,
            realizations,
        }
    }
}

/// How to order cases before splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shuffle {
    /// Keep the given order.
    #[default]
    None,
    /// Shuffle with a deterministic seed.
    Seeded(u64),
}

/// An ordered collection of cases with a common feature dimension.
///
/// Cloning is cheap: cases are shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    cases: Arc<Vec<TrainingCase>>,
    feature_dim: usize,
}

impl TrainingSet {
    /// Validate and wrap cases. Fails fast on an empty set or mixed feature dimensions.
    pub fn new(cases: Vec<TrainingCase>) -> Result<Self> {
        let feature_dim = cases
            .first()
            .map(TrainingCase::feature_dim)
            .ok_or_else(|| Error::InvalidData("training set must not be empty".to_owned()))?;
        for (i, case) in cases.iter().enumerate() {
            if case.feature_dim() != feature_dim {
                return Err(Error::shape(
                    format!("case {i} feature_dim"),
                    feature_dim,
                    case.feature_dim(),
                ));
            }
        }
        Ok(Self {
            cases: Arc::new(cases),
            feature_dim,
        })
    }

    /// Build from a dense block of shape `(n_cases, n_rea, feature_dim)` (row-major),
    /// masking every non-finite value.
    pub fn from_flat(
        thetas: &[f64],
        values: Vec<f64>,
        n_rea: usize,
        feature_dim: usize,
    ) -> Result<Self> {
        let per_case = n_rea
            .checked_mul(feature_dim)
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::InvalidData("n_rea and feature_dim must be > 0".to_owned()))?;
        if values.len() != thetas.len() * per_case {
            return Err(Error::shape(
                "flat training values",
                thetas.len() * per_case,
                values.len(),
            ));
        }
        let mut cases = Vec::with_capacity(thetas.len());
        for (c, &theta) in thetas.iter().enumerate() {
            let chunk = values[c * per_case..(c + 1) * per_case].to_vec();
            let reas = MaskedArray::from_flat_masking_nonfinite(n_rea, feature_dim, chunk)?;
            cases.push(TrainingCase::new(theta, reas)?);
        }
        Self::new(cases)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    #[inline]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    #[inline]
    pub fn cases(&self) -> &[TrainingCase] {
        &self.cases
    }

    /// Panics if `idx >= len`.
    #[inline]
    pub fn case(&self, idx: usize) -> &TrainingCase {
        &self.cases[idx]
    }

    pub fn thetas(&self) -> Vec<f64> {
        self.cases.iter().map(TrainingCase::theta).collect()
    }

    /// Total realization count, valid or not.
    pub fn total_realizations(&self) -> usize {
        self.cases.iter().map(TrainingCase::n_realizations).sum()
    }

    /// Cases with no fully valid realization.
    pub fn count_degenerate(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| c.n_valid_realizations() == 0)
            .count()
    }

    /// A new set with the cases at `indices`, in that order (repeats allowed).
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let mut cases = Vec::with_capacity(indices.len());
        for &i in indices {
            let case = self.cases.get(i).ok_or_else(|| {
                Error::InvalidData(format!("case index {i} out of range for {} cases", self.len()))
            })?;
            cases.push(case.clone());
        }
        Self::new(cases)
    }

    /// Split off the last `val_frac` of the (optionally shuffled) cases as a
    /// validation set. `val_frac == 0` yields no validation set.
    pub fn split(
        &self,
        val_frac: f64,
        shuffle: Shuffle,
    ) -> Result<(TrainingSet, Option<TrainingSet>)> {
        if !(val_frac.is_finite() && (0.0..1.0).contains(&val_frac)) {
            return Err(Error::InvalidConfig(format!(
                "val_frac must be in [0, 1), got {val_frac}"
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Shuffle::Seeded(seed) = shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        let n_val = (val_frac * self.len() as f64).round() as usize;
        if n_val == 0 {
            return Ok((self.subset(&order)?, None));
        }
        if n_val >= self.len() {
            return Err(Error::InvalidConfig(format!(
                "val_frac {val_frac} leaves no training cases out of {}",
                self.len()
            )));
        }
        let n_train = self.len() - n_val;
        let train = self.subset(&order[..n_train])?;
        let val = self.subset(&order[n_train..])?;
        Ok((train, Some(val)))
    }

    /// `size` distinct cases drawn uniformly at random.
    pub fn random_minibatch<R: Rng + ?Sized>(&self, size: usize, rng: &mut R) -> Result<Self> {
        if size == 0 || size > self.len() {
            return Err(Error::InvalidConfig(format!(
                "cannot select {size} among {} cases",
                self.len()
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order.truncate(size);
        self.subset(&order)
    }

    /// Same number of cases drawn with replacement.
    pub fn bootstrap<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self> {
        let indices: Vec<usize> = (0..self.len()).map(|_| rng.gen_range(0..self.len())).collect();
        self.subset(&indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(n: usize) -> TrainingSet {
        let cases = (0..n)
            .map(|i| {
                let x = i as f64;
                TrainingCase::from_rows(x, &[vec![x, 1.0], vec![x, 2.0]]).unwrap()
            })
            .collect();
        TrainingSet::new(cases).unwrap()
    }

    #[test]
    fn mixed_feature_dims_fail_fast() {
        let a = TrainingCase::from_rows(0.0, &[vec![1.0, 2.0]]).unwrap();
        let b = TrainingCase::from_rows(0.0, &[vec![1.0, 2.0, 3.0]]).unwrap();
        let err = TrainingSet::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 2, actual: 3, .. }));
        assert!(TrainingSet::new(vec![]).is_err());
    }

    #[test]
    fn realization_counts_may_differ_between_cases() {
        let a = TrainingCase::from_rows(0.0, &[vec![1.0]]).unwrap();
        let b = TrainingCase::from_rows(1.0, &[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let s = TrainingSet::new(vec![a, b]).unwrap();
        assert_eq!(s.total_realizations(), 4);
    }

    #[test]
    fn case_rejects_nonfinite_theta() {
        assert!(TrainingCase::from_rows(f64::NAN, &[vec![1.0]]).is_err());
    }

    #[test]
    fn from_flat_masks_nan_entries() {
        let s = TrainingSet::from_flat(&[0.0, 1.0], vec![1.0, f64::NAN, 3.0, 4.0], 2, 1).unwrap();
        assert_eq!(s.case(0).n_valid_realizations(), 1);
        assert_eq!(s.case(1).n_valid_realizations(), 2);
        assert!(TrainingSet::from_flat(&[0.0], vec![1.0], 2, 1).is_err());
    }

    #[test]
    fn split_partitions_cases() {
        let s = set(10);
        let (train, val) = s.split(0.3, Shuffle::Seeded(1)).unwrap();
        let val = val.unwrap();
        assert_eq!(train.len() + val.len(), 10);
        assert_eq!(val.len(), 3);
        let mut all: Vec<f64> = train.thetas().into_iter().chain(val.thetas()).collect();
        all.sort_by(f64::total_cmp);
        assert_eq!(all, (0..10).map(|i| i as f64).collect::<Vec<_>>());

        let (train, val) = s.split(0.0, Shuffle::None).unwrap();
        assert!(val.is_none());
        assert_eq!(train, s);
        assert!(s.split(1.0, Shuffle::None).is_err());
    }

    #[test]
    fn minibatch_and_bootstrap_sizes() {
        let s = set(8);
        let mut rng = StdRng::seed_from_u64(0);
        let mb = s.random_minibatch(3, &mut rng).unwrap();
        assert_eq!(mb.len(), 3);
        let mut thetas = mb.thetas();
        thetas.dedup();
        assert_eq!(thetas.len(), 3);
        assert!(s.random_minibatch(9, &mut rng).is_err());
        assert_eq!(s.bootstrap(&mut rng).unwrap().len(), 8);
    }
}
