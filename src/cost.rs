//! Realization-aware cost functions.
//!
//! Every cost maps `(Network, TrainingSet)` to one scalar by running the forward
//! pass on every realization of every case and combining the predictions of
//! output 0 ("the estimate") per case.
//!
//! Masking: a realization contributes only if the outputs the cost reads are
//! valid (skip-invalid at realization level). A case left without enough valid
//! realizations is excluded and counted in [`CostReport::excluded_cases`]; it never
//! contributes zero. If no case is usable the cost value is `+inf`.
//!
//! Weighted variants read output 1 as a raw weight and use `exp(raw)`, so weights
//! are always positive and a zeroed weight head yields weight 1. Weights are only
//! used normalized, so they are exponentiated after subtracting the largest raw
//! weight of the normalization group; no raw value can overflow them.

use tracing::debug;

use crate::{masked, Error, Network, Result, Scratch, TrainingSet};

/// How weighted costs normalize the predicted weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightNorm {
    /// Weighted mean within each case.
    #[default]
    PerCase,
    /// Weights divided by their mean over every valid realization of the set;
    /// each case estimate is `sum(w * p) / n_valid(case)`.
    Global,
}

/// Supported cost functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostFunction {
    /// Mean square error over all realizations.
    Mse,
    /// Mean square bias: square of (per-case mean prediction - theta), averaged over cases.
    #[default]
    Msb,
    /// Mean square relative bias: per-case bias divided by the within-case
    /// prediction std. Needs two valid realizations and a non-zero spread.
    Msrb,
    /// Mean square bias of weighted per-case estimates.
    Msbw { norm: WeightNorm },
}

/// Per-case diagnostics, in training-set order.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseCost {
    pub theta: f64,
    /// Realizations that contributed.
    pub n_valid: usize,
    /// Combined estimate for the case; `None` if the case was excluded.
    pub estimate: Option<f64>,
    /// Population std of the contributing predictions.
    pub spread: Option<f64>,
}

impl CaseCost {
    pub fn bias(&self) -> Option<f64> {
        self.estimate.map(|e| e - self.theta)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    pub value: f64,
    pub cases_used: usize,
    pub excluded_cases: usize,
    pub realizations_used: usize,
    pub per_case: Option<Vec<CaseCost>>,
}

/// Valid predictions of one case.
#[derive(Debug, Clone, Default)]
pub(crate) struct CasePredictions {
    pub(crate) estimates: Vec<f64>,
    /// Raw weight outputs; empty for unweighted costs.
    pub(crate) log_weights: Vec<f64>,
}

impl CostFunction {
    pub fn name(self) -> &'static str {
        match self {
            CostFunction::Mse => "mse",
            CostFunction::Msb => "msb",
            CostFunction::Msrb => "msrb",
            CostFunction::Msbw {
                norm: WeightNorm::PerCase,
            } => "msbw",
            CostFunction::Msbw {
                norm: WeightNorm::Global,
            } => "msbw-global",
        }
    }

    #[inline]
    pub fn is_weighted(self) -> bool {
        matches!(self, CostFunction::Msbw { .. })
    }

    /// Minimum network output dimension this cost reads.
    #[inline]
    pub fn required_outputs(self) -> usize {
        if self.is_weighted() {
            2
        } else {
            1
        }
    }

    /// Shape checks done once before any evaluation.
    pub fn check(self, net: &Network, set: &TrainingSet) -> Result<()> {
        if set.feature_dim() != net.input_dim() {
            return Err(Error::shape(
                "training set feature_dim vs network input_dim",
                net.input_dim(),
                set.feature_dim(),
            ));
        }
        if net.output_dim() < self.required_outputs() {
            return Err(Error::shape(
                format!("network output_dim for cost {}", self.name()),
                self.required_outputs(),
                net.output_dim(),
            ));
        }
        Ok(())
    }

    /// Cost value and counts.
    pub fn evaluate(self, net: &Network, set: &TrainingSet) -> Result<CostReport> {
        let mut scratch = net.scratch();
        self.evaluate_with(net, set, &mut scratch, false)
    }

    /// As [`CostFunction::evaluate`], also filling [`CostReport::per_case`].
    pub fn evaluate_detailed(self, net: &Network, set: &TrainingSet) -> Result<CostReport> {
        let mut scratch = net.scratch();
        self.evaluate_with(net, set, &mut scratch, true)
    }

    /// Shortcut for the scalar value.
    pub fn value(self, net: &Network, set: &TrainingSet) -> Result<f64> {
        Ok(self.evaluate(net, set)?.value)
    }

    /// Evaluation reusing `scratch`, the entry point used in optimization loops.
    pub fn evaluate_with(
        self,
        net: &Network,
        set: &TrainingSet,
        scratch: &mut Scratch,
        detailed: bool,
    ) -> Result<CostReport> {
        self.check(net, set)?;
        let preds = collect_predictions(net, set, scratch, self.is_weighted())?;

        let global_shift = max_log_weight(preds.iter().flat_map(|p| &p.log_weights));
        let global_scale = match self {
            CostFunction::Msbw {
                norm: WeightNorm::Global,
            } => mean_weight(&preds, global_shift),
            _ => Some(1.0),
        };

        let mut sum = 0.0;
        let mut count = 0usize;
        let mut cases_used = 0usize;
        let mut realizations_used = 0usize;
        let mut per_case = if detailed {
            Some(Vec::with_capacity(set.len()))
        } else {
            None
        };

        for (case, p) in set.cases().iter().zip(&preds) {
            let theta = case.theta();
            let n = p.estimates.len();
            let spread = std_of(&p.estimates);
            let estimate = match self {
                CostFunction::Mse | CostFunction::Msb => mean_of(&p.estimates),
                CostFunction::Msrb => match spread {
                    Some(s) if n >= 2 && s > 0.0 => mean_of(&p.estimates),
                    _ => None,
                },
                CostFunction::Msbw {
                    norm: WeightNorm::PerCase,
                } => {
                    let valid = vec![true; n];
                    let w = shifted_weights(&p.log_weights, max_log_weight(&p.log_weights));
                    masked::weighted_mean_skip_invalid(&p.estimates, &w, &valid)
                }
                CostFunction::Msbw {
                    norm: WeightNorm::Global,
                } => match global_scale {
                    Some(scale) if n > 0 => {
                        let w = shifted_weights(&p.log_weights, global_shift);
                        let num: f64 = p.estimates.iter().zip(&w).map(|(e, w)| e * w).sum();
                        Some(num / scale / n as f64)
                    }
                    _ => None,
                },
            };

            if let Some(est) = estimate {
                cases_used += 1;
                realizations_used += n;
                match self {
                    CostFunction::Mse => {
                        sum += p.estimates.iter().map(|e| (e - theta) * (e - theta)).sum::<f64>();
                        count += n;
                    }
                    CostFunction::Msrb => {
                        // `spread` is Some and > 0 here.
                        let rel = (est - theta) / spread.unwrap_or(1.0);
                        sum += rel * rel;
                        count += 1;
                    }
                    _ => {
                        sum += (est - theta) * (est - theta);
                        count += 1;
                    }
                }
            }

            if let Some(v) = per_case.as_mut() {
                v.push(CaseCost {
                    theta,
                    n_valid: n,
                    estimate,
                    spread,
                });
            }
        }

        let excluded_cases = set.len() - cases_used;
        let value = if count == 0 {
            f64::INFINITY
        } else {
            sum / count as f64
        };
        if excluded_cases > 0 {
            debug!(cost = self.name(), excluded_cases, "cases excluded from cost");
        }

        Ok(CostReport {
            value,
            cases_used,
            excluded_cases,
            realizations_used,
            per_case,
        })
    }
}

/// Runs the network on every realization, keeping only valid predictions.
pub(crate) fn collect_predictions(
    net: &Network,
    set: &TrainingSet,
    scratch: &mut Scratch,
    weighted: bool,
) -> Result<Vec<CasePredictions>> {
    let mut out = Vec::with_capacity(set.len());
    for case in set.cases() {
        let reas = case.realizations();
        let mut p = CasePredictions {
            estimates: Vec::with_capacity(reas.rows()),
            log_weights: Vec::new(),
        };
        for r in 0..reas.rows() {
            net.forward(reas.row(r), reas.row_mask(r), scratch)?;
            let (y, ok) = (scratch.output(), scratch.output_mask());
            if !ok[0] || (weighted && !ok[1]) {
                continue;
            }
            p.estimates.push(y[0]);
            if weighted {
                p.log_weights.push(y[1]);
            }
        }
        out.push(p);
    }
    Ok(out)
}

fn max_log_weight<'a>(raw: impl IntoIterator<Item = &'a f64>) -> f64 {
    raw.into_iter().fold(f64::NEG_INFINITY, |m, &r| m.max(r))
}

/// `exp(raw - shift)`. Entries equal to `shift` map to exactly 1, which keeps an
/// infinite shift finite.
fn shifted_weights(log_weights: &[f64], shift: f64) -> Vec<f64> {
    log_weights
        .iter()
        .map(|&r| if r == shift { 1.0 } else { (r - shift).exp() })
        .collect()
}

/// Mean shifted weight over every valid realization; `None` if unusable.
fn mean_weight(preds: &[CasePredictions], shift: f64) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for p in preds {
        sum += shifted_weights(&p.log_weights, shift).iter().sum::<f64>();
        n += p.log_weights.len();
    }
    let mean = sum / n as f64;
    if n > 0 && mean > 0.0 && mean.is_finite() {
        Some(mean)
    } else {
        None
    }
}

fn mean_of(values: &[f64]) -> Option<f64> {
    let valid = vec![true; values.len()];
    masked::mean_skip_invalid(values, &valid)
}

fn std_of(values: &[f64]) -> Option<f64> {
    let valid = vec![true; values.len()];
    masked::std_skip_invalid(values, &valid)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{Activation, Layer, LayerMode, MaskPolicy, MaskedArray, TrainingCase};

    /// 1 -> 1 identity network: prediction = w * x + b.
    fn linear(w: f64, b: f64) -> Network {
        let l = Layer::from_parts(1, 1, Activation::Identity, LayerMode::Sum, vec![w], vec![b])
            .unwrap();
        Network::from_layers(vec![l], MaskPolicy::Propagate).unwrap()
    }

    /// 1 -> 2 network: estimate = x, raw weight = wx * x.
    fn weighted(wx: f64) -> Network {
        let l = Layer::from_parts(
            1,
            2,
            Activation::Identity,
            LayerMode::Sum,
            vec![1.0, wx],
            vec![0.0, 0.0],
        )
        .unwrap();
        Network::from_layers(vec![l], MaskPolicy::Propagate).unwrap()
    }

    fn case(theta: f64, xs: &[Option<f64>]) -> TrainingCase {
        let rows: Vec<Vec<Option<f64>>> = xs.iter().map(|x| vec![*x]).collect();
        TrainingCase::new(theta, MaskedArray::from_options(&rows).unwrap()).unwrap()
    }

    #[test]
    fn mse_and_msb_on_a_hand_computed_set() {
        let set = TrainingSet::new(vec![
            case(0.0, &[Some(1.0), Some(-1.0)]),
            case(1.0, &[Some(3.0), Some(1.0)]),
        ])
        .unwrap();
        let net = linear(1.0, 0.0);
        // Errors: 1, -1, 2, 0 -> mean square 6/4.
        assert_relative_eq!(CostFunction::Mse.value(&net, &set).unwrap(), 1.5);
        // Case means: 0 and 2 -> biases 0 and 1.
        assert_relative_eq!(CostFunction::Msb.value(&net, &set).unwrap(), 0.5);
        // Spreads: 1 and 1 -> relative biases 0 and 1.
        assert_relative_eq!(CostFunction::Msrb.value(&net, &set).unwrap(), 0.5);
    }

    #[test]
    fn single_realization_makes_mse_equal_msb() {
        let set = TrainingSet::new(vec![
            case(0.2, &[Some(0.5)]),
            case(-1.0, &[Some(2.0)]),
            case(3.0, &[Some(1.0)]),
        ])
        .unwrap();
        let net = linear(0.7, -0.1);
        let mse = CostFunction::Mse.value(&net, &set).unwrap();
        let msb = CostFunction::Msb.value(&net, &set).unwrap();
        assert_relative_eq!(mse, msb, epsilon = 1e-15);
    }

    #[test]
    fn fully_masked_case_is_excluded_not_zero() {
        let set = TrainingSet::new(vec![
            case(0.0, &[Some(2.0)]),
            case(5.0, &[None, None]),
        ])
        .unwrap();
        let net = linear(1.0, 0.0);
        let report = CostFunction::Msb.evaluate_detailed(&net, &set).unwrap();
        assert_eq!(report.cases_used, 1);
        assert_eq!(report.excluded_cases, 1);
        assert_relative_eq!(report.value, 4.0);
        let per_case = report.per_case.unwrap();
        assert_eq!(per_case[1].estimate, None);
        assert_eq!(per_case[1].n_valid, 0);
        assert_eq!(per_case[0].bias(), Some(2.0));
    }

    #[test]
    fn no_usable_case_gives_infinite_cost() {
        let set = TrainingSet::new(vec![case(0.0, &[Some(1.0)])]).unwrap();
        // A single realization has no spread.
        let report = CostFunction::Msrb.evaluate(&linear(1.0, 0.0), &set).unwrap();
        assert_eq!(report.cases_used, 0);
        assert!(report.value.is_infinite());
    }

    #[test]
    fn masked_realization_matches_dropping_it() {
        let with_mask = TrainingSet::new(vec![case(1.0, &[Some(1.5), None, Some(0.0)])]).unwrap();
        let dropped = TrainingSet::new(vec![case(1.0, &[Some(1.5), Some(0.0)])]).unwrap();
        let net = linear(2.0, 0.3);
        for cost in [CostFunction::Mse, CostFunction::Msb, CostFunction::Msrb] {
            assert_relative_eq!(
                cost.value(&net, &with_mask).unwrap(),
                cost.value(&net, &dropped).unwrap()
            );
        }
    }

    #[test]
    fn zero_weight_head_reduces_weighted_to_plain_msb() {
        let set = TrainingSet::new(vec![
            case(0.0, &[Some(1.0), Some(2.0)]),
            case(1.0, &[Some(4.0)]),
        ])
        .unwrap();
        let net = weighted(0.0);
        let msb = CostFunction::Msb.value(&net, &set).unwrap();
        for norm in [WeightNorm::PerCase, WeightNorm::Global] {
            let v = CostFunction::Msbw { norm }.value(&net, &set).unwrap();
            assert_relative_eq!(v, msb, epsilon = 1e-12);
        }
    }

    #[test]
    fn per_case_and_global_weights_differ() {
        // Weights exp(x): case 0 gets e^0 and e^2, case 1 gets e^1.
        let set = TrainingSet::new(vec![
            case(0.0, &[Some(0.0), Some(2.0)]),
            case(0.0, &[Some(1.0)]),
        ])
        .unwrap();
        let net = weighted(1.0);
        let e = std::f64::consts::E;

        let per_case = CostFunction::Msbw {
            norm: WeightNorm::PerCase,
        }
        .evaluate_detailed(&net, &set)
        .unwrap();
        let est = per_case.per_case.unwrap();
        assert_relative_eq!(est[0].estimate.unwrap(), 2.0 * e * e / (1.0 + e * e), epsilon = 1e-12);
        assert_relative_eq!(est[1].estimate.unwrap(), 1.0);

        let global = CostFunction::Msbw {
            norm: WeightNorm::Global,
        }
        .evaluate_detailed(&net, &set)
        .unwrap();
        let mean_w = (1.0 + e * e + e) / 3.0;
        let est = global.per_case.unwrap();
        assert_relative_eq!(
            est[0].estimate.unwrap(),
            (2.0 * e * e / mean_w) / 2.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(est[1].estimate.unwrap(), e / mean_w, epsilon = 1e-12);
    }

    #[test]
    fn huge_raw_weights_never_exclude_valid_cases() {
        // Raw weight 1000 x: exp overflows unless shifted.
        let set = TrainingSet::new(vec![
            case(100.0, &[Some(1.0), Some(1.0)]),
            case(0.0, &[Some(0.0)]),
        ])
        .unwrap();
        let net = weighted(1000.0);

        let per_case = CostFunction::Msbw {
            norm: WeightNorm::PerCase,
        }
        .evaluate(&net, &set)
        .unwrap();
        assert_eq!(per_case.excluded_cases, 0);
        assert_relative_eq!(per_case.value, 99.0 * 99.0 / 2.0);

        // Global: weights 1, 1 and e^-1000 against a mean of 2/3.
        let global = CostFunction::Msbw {
            norm: WeightNorm::Global,
        }
        .evaluate(&net, &set)
        .unwrap();
        assert_eq!(global.excluded_cases, 0);
        assert_relative_eq!(global.value, 98.5 * 98.5 / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn weighted_costs_exclude_only_cases_without_valid_realizations() {
        let set = TrainingSet::new(vec![
            case(1.0, &[Some(800.0), Some(-800.0), None]),
            case(2.0, &[None, None]),
            case(3.0, &[Some(-900.0)]),
        ])
        .unwrap();
        let net = weighted(1.0);
        for norm in [WeightNorm::PerCase, WeightNorm::Global] {
            let report = CostFunction::Msbw { norm }.evaluate_detailed(&net, &set).unwrap();
            assert_eq!(report.excluded_cases, 1, "{norm:?}");
            assert_eq!(report.cases_used, 2, "{norm:?}");
            assert!(report.value.is_finite(), "{norm:?}");
            let per_case = report.per_case.unwrap();
            assert!(per_case[0].estimate.is_some() && per_case[2].estimate.is_some());
            assert_eq!(per_case[1].estimate, None);
        }
    }

    #[test]
    fn shape_problems_fail_before_evaluation() {
        let set = TrainingSet::new(vec![case(0.0, &[Some(1.0)])]).unwrap();
        let err = CostFunction::Msbw {
            norm: WeightNorm::PerCase,
        }
        .evaluate(&linear(1.0, 0.0), &set)
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 2, actual: 1, .. }));

        let wide = Network::new_with_seed(&[3, 1], 0).unwrap();
        assert!(CostFunction::Mse.evaluate(&wide, &set).is_err());
    }
}
