//! Training: a minimizer driving a cost over a network's flat parameters.
//!
//! [`Training`] walks through `Initialized -> Iterating -> Converged -> Committed`.
//! The minimizer owns a working copy of the parameters; the network itself is
//! only written once, at commit, with the best parameters found. Non-convergence
//! is a status on the [`TrainReport`], never an error.
//!
//! Calling [`Training::run`] again resumes from the committed network, so staged
//! training (for example a cheap cost first, then the bias cost) is a sequence of
//! runs with different configs via [`Training::set_config`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::optim::{
    Bfgs, ConjugateGradient, IterationInfo, MinimizeOutcome, MinimizeStatus, Minimizer, NelderMead,
    StopCriteria,
};
use crate::{CostFunction, Error, Network, Result, TrainingSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Bfgs,
    ConjugateGradient,
    NelderMead,
}

impl Algorithm {
    fn minimizer(self) -> Box<dyn Minimizer> {
        match self {
            Algorithm::Bfgs => Box::new(Bfgs),
            Algorithm::ConjugateGradient => Box::new(ConjugateGradient),
            Algorithm::NelderMead => Box::new(NelderMead::default()),
        }
    }
}

/// Which cases the minimizer sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Minibatch {
    #[default]
    Full,
    /// `loops` rounds, each minimizing on `size` random cases. After each round
    /// the candidate is scored on the full set and kept only if it improves.
    Random { size: usize, loops: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub cost: CostFunction,
    pub algorithm: Algorithm,
    /// Per minimizer call (per loop with `Minibatch::Random`).
    pub max_iterations: usize,
    pub max_evaluations: Option<usize>,
    pub ftol: f64,
    pub gtol: f64,
    pub minibatch: Minibatch,
    /// Seed for minibatch selection.
    pub seed: u64,
    /// Log an `info` line every `log_every` iterations (0 disables).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let stop = StopCriteria::default();
        Self {
            cost: CostFunction::Msb,
            algorithm: Algorithm::Bfgs,
            max_iterations: stop.max_iterations,
            max_evaluations: stop.max_evaluations,
            ftol: stop.ftol,
            gtol: stop.gtol,
            minibatch: Minibatch::Full,
            seed: 0,
            log_every: 10,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.stop_criteria().validate()?;
        if let Minibatch::Random { size, loops } = self.minibatch {
            if size == 0 || loops == 0 {
                return Err(Error::InvalidConfig(
                    "minibatch size and loops must be > 0".to_owned(),
                ));
            }
        }
        Ok(())
    }

    pub fn stop_criteria(&self) -> StopCriteria {
        StopCriteria {
            max_iterations: self.max_iterations,
            max_evaluations: self.max_evaluations,
            ftol: self.ftol,
            gtol: self.gtol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initialized,
    Iterating,
    Converged,
    Committed,
}

/// One minimizer iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    /// Counted across runs and minibatch loops.
    pub iteration: usize,
    /// Best cost of the current minimizer call (on the minibatch, if any).
    pub train_cost: f64,
    pub val_cost: Option<f64>,
    /// Cumulative cost evaluations.
    pub evaluations: usize,
    pub elapsed: Duration,
    /// Running minimum of `train_cost` within the current minimizer call. Restarts
    /// with each run and each minibatch, where the cost scale can change.
    pub best_cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub status: MinimizeStatus,
    pub initial_cost: f64,
    /// Full training-set cost of the committed network.
    pub final_cost: f64,
    pub iterations: usize,
    pub evaluations: usize,
    /// Proposals rejected because a product unit left its domain.
    pub domain_failures: usize,
    pub excluded_cases: usize,
    pub elapsed: Duration,
}

impl TrainReport {
    #[inline]
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Training state for one network.
#[derive(Debug)]
pub struct Training {
    net: Network,
    train: TrainingSet,
    validation: Option<TrainingSet>,
    config: TrainConfig,
    state: TrainingState,
    history: Vec<IterationRecord>,
    iteration: usize,
    evaluations: usize,
    stop: Option<Arc<AtomicBool>>,
}

impl Training {
    /// Fails fast on config or shape problems.
    pub fn new(net: Network, train: TrainingSet, config: TrainConfig) -> Result<Self> {
        check_config(&config, &net, &train)?;
        Ok(Self {
            net,
            train,
            validation: None,
            config,
            state: TrainingState::Initialized,
            history: Vec::new(),
            iteration: 0,
            evaluations: 0,
            stop: None,
        })
    }

    /// Evaluate `validation` after every iteration. It never steers the minimizer.
    pub fn with_validation(mut self, validation: TrainingSet) -> Result<Self> {
        self.config.cost.check(&self.net, &validation)?;
        self.validation = Some(validation);
        Ok(self)
    }

    /// Cooperative cancellation, checked once per iteration.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Replace the config for the next run (staged training).
    pub fn set_config(&mut self, config: TrainConfig) -> Result<()> {
        check_config(&config, &self.net, &self.train)?;
        self.config = config;
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> TrainingState {
        self.state
    }

    #[inline]
    pub fn network(&self) -> &Network {
        &self.net
    }

    #[inline]
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    #[inline]
    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// Total cost evaluations over all runs.
    #[inline]
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn into_network(self) -> Network {
        self.net
    }

    /// Optimize from the current network state and commit the best parameters.
    ///
    /// Errors only if the starting point cannot be evaluated (domain failure or no
    /// usable case); everything after that is reported on the [`TrainReport`].
    pub fn run(&mut self) -> Result<TrainReport> {
        let cost = self.config.cost;
        let start = Instant::now();
        let initial = cost.evaluate(&self.net, &self.train)?;
        if !initial.value.is_finite() {
            return Err(Error::InvalidData(format!(
                "initial {} cost is not finite ({} of {} cases usable)",
                cost.name(),
                initial.cases_used,
                self.train.len()
            )));
        }
        if initial.excluded_cases > 0 {
            warn!(
                cost = cost.name(),
                excluded_cases = initial.excluded_cases,
                degenerate_cases = self.train.count_degenerate(),
                "training cases excluded from the cost"
            );
        }
        info!(
            cost = cost.name(),
            algorithm = ?self.config.algorithm,
            nparams = self.net.nparams(),
            cases = self.train.len(),
            initial_cost = initial.value,
            "starting training"
        );

        self.state = TrainingState::Iterating;
        let evals_before = self.evaluations;
        let iters_before = self.iteration;
        let mut domain_failures = 0usize;

        let (status, best_params) = match self.config.minibatch {
            Minibatch::Full => {
                let train = self.train.clone();
                let x0 = self.net.parameters().into_vec();
                let out = self.minimize_on(&train, &x0, &mut domain_failures);
                (out.status, out.x)
            }
            Minibatch::Random { size, loops } => {
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                let mut best = self.net.parameters().into_vec();
                let mut best_cost = initial.value;
                let mut status = MinimizeStatus::MaxIterations;
                for l in 0..loops {
                    if self.stop_requested() {
                        status = MinimizeStatus::Cancelled;
                        break;
                    }
                    let batch = self.train.random_minibatch(size, &mut rng)?;
                    debug!(loop_index = l, size, "new minibatch");
                    let out = self.minimize_on(&batch, &best, &mut domain_failures);
                    status = out.status;
                    let candidate = self.net.with_parameters(&out.x)?;
                    match cost.evaluate(&candidate, &self.train) {
                        Ok(r) if r.value < best_cost => {
                            best_cost = r.value;
                            best = out.x;
                        }
                        Ok(_) => {}
                        Err(e) if e.is_domain() => domain_failures += 1,
                        Err(e) => return Err(e),
                    }
                    if status == MinimizeStatus::Cancelled {
                        break;
                    }
                }
                (status, best)
            }
        };

        self.state = TrainingState::Converged;
        self.net.set_parameters(&best_params)?;
        self.state = TrainingState::Committed;

        let final_report = cost.evaluate(&self.net, &self.train)?;
        let report = TrainReport {
            status,
            initial_cost: initial.value,
            final_cost: final_report.value,
            iterations: self.iteration - iters_before,
            evaluations: self.evaluations - evals_before,
            domain_failures,
            excluded_cases: final_report.excluded_cases,
            elapsed: start.elapsed(),
        };
        info!(
            status = ?report.status,
            final_cost = report.final_cost,
            iterations = report.iterations,
            evaluations = report.evaluations,
            domain_failures = report.domain_failures,
            "training done"
        );
        Ok(report)
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// One minimizer call on `batch`, starting at `x0`.
    fn minimize_on(
        &mut self,
        batch: &TrainingSet,
        x0: &[f64],
        domain_failures: &mut usize,
    ) -> MinimizeOutcome {
        let cost = self.config.cost;
        let stop_criteria = self.config.stop_criteria();
        let minimizer = self.config.algorithm.minimizer();
        let log_every = self.config.log_every;

        let mut work = self.net.clone();
        let mut scratch = work.scratch();
        let mut objective = |p: &[f64]| -> f64 {
            if work.set_parameters(p).is_err() {
                return f64::INFINITY;
            }
            match cost.evaluate_with(&work, batch, &mut scratch, false) {
                Ok(r) => r.value,
                Err(e) => {
                    if e.is_domain() {
                        *domain_failures += 1;
                    }
                    f64::INFINITY
                }
            }
        };

        let mut val_net = self.net.clone();
        let validation = self.validation.as_ref();
        let stop = self.stop.clone();
        let evals_base = self.evaluations;
        let history = &mut self.history;
        let call_start = history.len();
        let iteration = &mut self.iteration;
        let mut last = Instant::now();
        let mut observer = |it: &IterationInfo<'_>| -> ControlFlow<()> {
            *iteration += 1;
            let val_cost = validation.and_then(|v| {
                val_net.set_parameters(it.x).ok()?;
                cost.evaluate(&val_net, v).ok().map(|r| r.value)
            });
            let best_cost = history[call_start..]
                .last()
                .map_or(it.fx, |h| h.best_cost.min(it.fx));
            let record = IterationRecord {
                iteration: *iteration,
                train_cost: it.fx,
                val_cost,
                evaluations: evals_base + it.evaluations,
                elapsed: last.elapsed(),
                best_cost,
            };
            last = Instant::now();
            debug!(
                iteration = record.iteration,
                cost = record.train_cost,
                val_cost = ?record.val_cost,
                evaluations = record.evaluations,
                "iteration"
            );
            if log_every > 0 && record.iteration % log_every == 0 {
                info!(iteration = record.iteration, cost = record.train_cost, "training progress");
            }
            history.push(record);

            match &stop {
                Some(flag) if flag.load(Ordering::Relaxed) => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        };

        let out = minimizer.minimize(&mut objective, x0, &stop_criteria, &mut observer);
        self.evaluations += out.evaluations;
        out
    }
}

fn check_config(config: &TrainConfig, net: &Network, train: &TrainingSet) -> Result<()> {
    config.validate()?;
    config.cost.check(net, train)?;
    if let Minibatch::Random { size, .. } = config.minibatch {
        if size > train.len() {
            return Err(Error::InvalidConfig(format!(
                "minibatch size {size} exceeds {} training cases",
                train.len()
            )));
        }
    }
    Ok(())
}

impl Network {
    /// Train this network in place with `config`.
    pub fn fit(&mut self, train: &TrainingSet, config: TrainConfig) -> Result<TrainReport> {
        let mut t = Training::new(self.clone(), train.clone(), config)?;
        let report = t.run()?;
        *self = t.into_network();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{Activation, Layer, LayerMode, MaskPolicy, MaskedArray, TrainingCase};

    fn linear_set(n: usize) -> TrainingSet {
        // feature = 2 theta + 1, two identical realizations per case.
        let cases = (0..n)
            .map(|i| {
                let theta = i as f64 / n as f64;
                let x = 2.0 * theta + 1.0;
                TrainingCase::from_rows(theta, &[vec![x], vec![x]]).unwrap()
            })
            .collect();
        TrainingSet::new(cases).unwrap()
    }

    fn linear_net() -> Network {
        let l = Layer::from_parts(1, 1, Activation::Identity, LayerMode::Sum, vec![0.1], vec![0.0])
            .unwrap();
        Network::from_layers(vec![l], MaskPolicy::Propagate).unwrap()
    }

    #[test]
    fn recovers_a_linear_map() {
        for algorithm in [Algorithm::Bfgs, Algorithm::ConjugateGradient, Algorithm::NelderMead] {
            let cfg = TrainConfig {
                algorithm,
                max_iterations: 500,
                ftol: 1e-14,
                ..TrainConfig::default()
            };
            let mut t = Training::new(linear_net(), linear_set(10), cfg).unwrap();
            let report = t.run().unwrap();
            assert_eq!(t.state(), TrainingState::Committed);
            assert!(report.final_cost < 1e-8, "{algorithm:?}: {}", report.final_cost);
            let layer = t.network().layer(0).unwrap();
            assert_abs_diff_eq!(layer.weights()[0], 0.5, epsilon = 1e-3);
            assert_abs_diff_eq!(layer.biases()[0], -0.5, epsilon = 1e-3);
        }
    }

    #[test]
    fn best_cost_history_is_non_increasing() {
        let cfg = TrainConfig {
            max_iterations: 30,
            ..TrainConfig::default()
        };
        let mut t = Training::new(linear_net(), linear_set(6), cfg)
            .unwrap()
            .with_validation(linear_set(3))
            .unwrap();
        t.run().unwrap();
        let h = t.history();
        assert!(!h.is_empty());
        assert!(h.windows(2).all(|w| w[1].best_cost <= w[0].best_cost));
        assert!(h.iter().all(|r| r.val_cost.is_some()));
    }

    #[test]
    fn best_cost_restarts_with_each_run() {
        // Spread realizations: MSE carries the within-case variance, MSB does not.
        let cases = (0..8)
            .map(|i| {
                let theta = i as f64 / 8.0;
                let x = 2.0 * theta + 1.0;
                TrainingCase::from_rows(theta, &[vec![x - 0.2], vec![x + 0.2]]).unwrap()
            })
            .collect();
        let set = TrainingSet::new(cases).unwrap();
        let cfg = |cost| TrainConfig {
            cost,
            max_iterations: 10,
            ..TrainConfig::default()
        };
        let mut t = Training::new(linear_net(), set, cfg(CostFunction::Msb)).unwrap();
        let first = t.run().unwrap();
        t.set_config(cfg(CostFunction::Mse)).unwrap();
        t.run().unwrap();

        let second = &t.history()[first.iterations..];
        assert!(!second.is_empty());
        assert!(second[0].train_cost > first.final_cost);
        assert_eq!(second[0].best_cost, second[0].train_cost);
        assert!(second.windows(2).all(|w| w[1].best_cost <= w[0].best_cost));
    }

    #[test]
    fn resume_continues_from_committed_state() {
        let cfg = TrainConfig {
            max_iterations: 2,
            ..TrainConfig::default()
        };
        let mut t = Training::new(linear_net(), linear_set(8), cfg).unwrap();
        let first = t.run().unwrap();
        let second = t.run().unwrap();
        assert_eq!(second.initial_cost, first.final_cost);
        assert!(second.final_cost <= first.final_cost);
        assert_eq!(t.history().last().unwrap().iteration, first.iterations + second.iterations);
    }

    #[test]
    fn minibatch_commits_full_set_improvements_only() {
        let cfg = TrainConfig {
            minibatch: Minibatch::Random { size: 3, loops: 4 },
            max_iterations: 20,
            seed: 7,
            ..TrainConfig::default()
        };
        let mut t = Training::new(linear_net(), linear_set(10), cfg).unwrap();
        let report = t.run().unwrap();
        assert!(report.final_cost <= report.initial_cost);

        let too_big = TrainConfig {
            minibatch: Minibatch::Random { size: 11, loops: 1 },
            ..TrainConfig::default()
        };
        assert!(Training::new(linear_net(), linear_set(10), too_big).is_err());
    }

    #[test]
    fn stop_flag_cancels_and_still_commits() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut t = Training::new(linear_net(), linear_set(5), TrainConfig::default())
            .unwrap()
            .with_stop_flag(flag);
        let report = t.run().unwrap();
        assert_eq!(report.status, MinimizeStatus::Cancelled);
        assert_eq!(report.iterations, 1);
        assert!(report.final_cost <= report.initial_cost);
    }

    #[test]
    fn product_domain_failures_are_rejected_steps() {
        // A single product unit x^w with x in [0, 1] including exactly 0: negative
        // exponents are out of domain.
        let l =
            Layer::from_parts(1, 1, Activation::Identity, LayerMode::Product, vec![1.0], vec![0.0])
                .unwrap();
        let net = Network::from_layers(vec![l], MaskPolicy::Propagate).unwrap();
        let cases = vec![
            TrainingCase::from_rows(0.0, &[vec![0.0]]).unwrap(),
            TrainingCase::from_rows(0.5, &[vec![0.25]]).unwrap(),
            TrainingCase::from_rows(1.0, &[vec![1.0]]).unwrap(),
        ];
        let set = TrainingSet::new(cases).unwrap();
        let cfg = TrainConfig {
            algorithm: Algorithm::NelderMead,
            max_iterations: 200,
            ..TrainConfig::default()
        };
        let mut t = Training::new(net, set, cfg).unwrap();
        let report = t.run().unwrap();
        assert!(report.final_cost.is_finite());
        assert!(report.final_cost <= report.initial_cost);
        // Best exponent is 0.5 (square root).
        assert_abs_diff_eq!(t.network().layer(0).unwrap().weights()[0], 0.5, epsilon = 1e-2);
    }

    #[test]
    fn unusable_start_is_an_error() {
        let set = TrainingSet::new(vec![TrainingCase::new(
            0.0,
            MaskedArray::from_options(&[vec![None]]).unwrap(),
        )
        .unwrap()])
        .unwrap();
        let mut t = Training::new(linear_net(), set, TrainConfig::default()).unwrap();
        assert!(t.run().is_err());
        assert_eq!(t.state(), TrainingState::Initialized);
    }

    #[test]
    fn fit_updates_network_in_place() {
        let mut net = linear_net();
        let before = net.clone();
        let report = net.fit(&linear_set(5), TrainConfig::default()).unwrap();
        assert!(report.final_cost < report.initial_cost);
        assert_ne!(net, before);
    }
}
