//! Held-out bias and error summaries.
//!
//! Metrics do not drive training; they describe a trained network on a (usually
//! held-out) training set. Predictions are read from output 0 and combined per
//! case with a plain skip-invalid mean.

use std::fmt;

use crate::cost::collect_predictions;
use crate::{masked, Network, Result, TrainingSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasSummary {
    /// Cases with at least one valid prediction.
    pub n_cases: usize,
    pub n_excluded: usize,
    /// Root mean square error over all valid realizations.
    pub rms_error: f64,
    /// Root mean square of per-case bias.
    pub rms_bias: f64,
    pub mean_bias: f64,
    /// Mean over cases of the within-case prediction std.
    pub mean_std: f64,
}

impl BiasSummary {
    /// Summarize `net` on `set`. Values are `NaN` when no case is usable.
    pub fn evaluate(net: &Network, set: &TrainingSet) -> Result<Self> {
        crate::CostFunction::Mse.check(net, set)?;
        let mut scratch = net.scratch();
        let preds = collect_predictions(net, set, &mut scratch, false)?;

        let mut sq_err = 0.0;
        let mut n_rea = 0usize;
        let mut biases = Vec::with_capacity(set.len());
        let mut stds = Vec::with_capacity(set.len());
        for (case, p) in set.cases().iter().zip(&preds) {
            let valid = vec![true; p.estimates.len()];
            let Some(mean) = masked::mean_skip_invalid(&p.estimates, &valid) else {
                continue;
            };
            let theta = case.theta();
            sq_err += p.estimates.iter().map(|e| (e - theta) * (e - theta)).sum::<f64>();
            n_rea += p.estimates.len();
            biases.push(mean - theta);
            stds.push(masked::std_skip_invalid(&p.estimates, &valid).unwrap_or(0.0));
        }

        let n_cases = biases.len();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let sq: Vec<f64> = biases.iter().map(|b| b * b).collect();
        Ok(Self {
            n_cases,
            n_excluded: set.len() - n_cases,
            rms_error: (sq_err / n_rea as f64).sqrt(),
            rms_bias: mean(&sq).sqrt(),
            mean_bias: mean(&biases),
            mean_std: mean(&stds),
        })
    }
}

impl fmt::Display for BiasSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cases ({} excluded): ", self.n_cases, self.n_excluded)?;
        write!(
            f,
            "rms error {:.4e}, rms bias {:.4e}, mean bias {:.4e}, mean std {:.4e}",
            self.rms_error, self.rms_bias, self.mean_bias, self.mean_std
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{Activation, Layer, LayerMode, MaskPolicy, MaskedArray, TrainingCase};

    #[test]
    fn summary_on_hand_computed_cases() {
        let l = Layer::from_parts(1, 1, Activation::Identity, LayerMode::Sum, vec![1.0], vec![0.0])
            .unwrap();
        let net = Network::from_layers(vec![l], MaskPolicy::Propagate).unwrap();
        let set = TrainingSet::new(vec![
            TrainingCase::from_rows(0.0, &[vec![1.0], vec![-1.0]]).unwrap(),
            TrainingCase::from_rows(0.0, &[vec![2.0], vec![2.0]]).unwrap(),
            TrainingCase::new(0.0, MaskedArray::from_options(&[vec![None]]).unwrap()).unwrap(),
        ])
        .unwrap();

        let s = BiasSummary::evaluate(&net, &set).unwrap();
        assert_eq!(s.n_cases, 2);
        assert_eq!(s.n_excluded, 1);
        assert_relative_eq!(s.rms_error, (10.0_f64 / 4.0).sqrt());
        assert_relative_eq!(s.mean_bias, 1.0);
        assert_relative_eq!(s.rms_bias, 2.0_f64.sqrt());
        assert_relative_eq!(s.mean_std, 0.5);
        assert!(s.to_string().contains("2 cases (1 excluded)"));
    }
}
