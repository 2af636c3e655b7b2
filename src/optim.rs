//! Gradient-free minimizers over a flat parameter vector.
//!
//! The objective is a black box `FnMut(&[f64]) -> f64`; nothing here knows about
//! networks or costs. The solvers are `argmin`'s, with forward-difference
//! gradients from `finitediff`. This module adapts them to the [`Minimizer`]
//! trait:
//!
//! - [`Bfgs`]: quasi-Newton with a dense inverse-Hessian estimate
//! - [`ConjugateGradient`]: nonlinear CG, Polak-Ribiere+ with periodic restarts
//! - [`NelderMead`]: downhill simplex, no gradients at all
//!
//! Every minimizer returns the best point it ever evaluated, so the reported
//! best cost is non-increasing over iterations. `NaN` objective values are
//! treated as `+inf`.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State, KV};
use argmin::solver::conjugategradient::beta::PolakRibierePlus;
use argmin::solver::conjugategradient::NonlinearConjugateGradient;
use argmin::solver::linesearch::condition::ArmijoCondition;
use argmin::solver::linesearch::BacktrackingLineSearch;
use argmin::solver::neldermead::NelderMead as Simplex;
use argmin::solver::quasinewton::BFGS;
use finitediff::FiniteDiff;
use tracing::debug;

use crate::{Error, Result};

type SolverResult<T> = std::result::Result<T, ArgminError>;

/// Sufficient-decrease constant of the backtracking line search.
const ARMIJO_C1: f64 = 1e-4;

/// Stopping rules shared by all minimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopCriteria {
    pub max_iterations: usize,
    /// Objective evaluation budget. May be exceeded by at most one gradient estimate.
    pub max_evaluations: Option<usize>,
    /// Relative change of the best value below which the run has converged. For
    /// Nelder-Mead, the spread of the simplex values instead.
    pub ftol: f64,
    /// Max-norm of the gradient below which the run has converged.
    pub gtol: f64,
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_evaluations: None,
            ftol: 1e-10,
            gtol: 1e-8,
        }
    }
}

impl StopCriteria {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("max_iterations must be > 0".to_owned()));
        }
        if self.max_evaluations == Some(0) {
            return Err(Error::InvalidConfig("max_evaluations must be > 0".to_owned()));
        }
        if !(self.ftol.is_finite() && self.ftol >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "ftol must be finite and >= 0, got {}",
                self.ftol
            )));
        }
        if !(self.gtol.is_finite() && self.gtol >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "gtol must be finite and >= 0, got {}",
                self.gtol
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizeStatus {
    Converged,
    MaxIterations,
    MaxEvaluations,
    Cancelled,
    /// The solver gave up, usually in a line search that found no usable step.
    LineSearchFailed,
}

impl MinimizeStatus {
    #[inline]
    pub fn is_converged(self) -> bool {
        self == MinimizeStatus::Converged
    }
}

/// Passed to the observer after each iteration.
#[derive(Debug)]
pub struct IterationInfo<'a> {
    /// 1-based.
    pub iteration: usize,
    /// Best point so far.
    pub x: &'a [f64],
    pub fx: f64,
    pub evaluations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    pub x: Vec<f64>,
    pub fx: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub status: MinimizeStatus,
}

/// A black-box minimization strategy.
pub trait Minimizer {
    fn name(&self) -> &'static str;

    /// Minimize `f` from `x0`. The observer runs after each iteration and may stop
    /// the run by returning `ControlFlow::Break`.
    fn minimize(
        &self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        stop: &StopCriteria,
        observer: &mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
    ) -> MinimizeOutcome;
}

/// Records the number of finished solver iterations.
///
/// Executor observers must be `'static`, so the caller's observer cannot live
/// here. [`Session::sync`] reads the counter and calls it instead.
struct IterationTap(Arc<AtomicU64>);

impl<I: State> Observe<I> for IterationTap {
    fn observe_iter(&mut self, _state: &I, _kv: &KV) -> SolverResult<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Evaluation bookkeeping for one minimization: counts evaluations, keeps the
/// best point seen and applies the stopping rules.
struct Session<'f, 'o> {
    f: &'f mut dyn FnMut(&[f64]) -> f64,
    observer: &'o mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
    stop: StopCriteria,
    /// Nelder-Mead relies on the simplex spread instead.
    check_ftol: bool,
    evaluations: usize,
    best_x: Vec<f64>,
    best_f: f64,
    /// Best value at the previous delivered iteration.
    last_best: f64,
    /// Max-norm of the latest gradient estimate.
    grad_norm: f64,
    finished: Arc<AtomicU64>,
    delivered: usize,
    status: Option<MinimizeStatus>,
}

impl<'f, 'o> Session<'f, 'o> {
    fn new(
        f: &'f mut dyn FnMut(&[f64]) -> f64,
        observer: &'o mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
        x0: &[f64],
        stop: &StopCriteria,
        check_ftol: bool,
    ) -> Self {
        Self {
            f,
            observer,
            stop: *stop,
            check_ftol,
            evaluations: 0,
            best_x: x0.to_vec(),
            best_f: f64::INFINITY,
            last_best: f64::INFINITY,
            grad_norm: f64::INFINITY,
            finished: Arc::new(AtomicU64::new(0)),
            delivered: 0,
            status: None,
        }
    }

    fn tap(&self) -> IterationTap {
        IterationTap(Arc::clone(&self.finished))
    }

    fn eval(&mut self, x: &[f64]) -> f64 {
        let v = (self.f)(x);
        let v = if v.is_nan() { f64::INFINITY } else { v };
        self.evaluations += 1;
        if v < self.best_f {
            self.best_f = v;
            self.best_x.copy_from_slice(x);
        }
        v
    }

    #[inline]
    fn exhausted(&self) -> bool {
        self.stop.max_evaluations.is_some_and(|m| self.evaluations >= m)
    }

    /// Record `status` and produce the error that unwinds the executor.
    fn halt(&mut self, status: MinimizeStatus) -> ArgminError {
        self.status = Some(status);
        ArgminError::msg(format!("minimization stopped: {status:?}"))
    }

    /// Deliver finished iterations to the observer and check the stopping rules.
    fn sync(&mut self) -> SolverResult<()> {
        let finished = self.finished.load(Ordering::Relaxed) as usize;
        while self.delivered < finished {
            self.delivered += 1;
            let info = IterationInfo {
                iteration: self.delivered,
                x: &self.best_x,
                fx: self.best_f,
                evaluations: self.evaluations,
            };
            if (self.observer)(&info).is_break() {
                return Err(self.halt(MinimizeStatus::Cancelled));
            }
            let stalled = self.check_ftol
                && self.last_best.is_finite()
                && self.best_f.is_finite()
                && small_change(self.last_best, self.best_f, self.stop.ftol);
            self.last_best = self.best_f;
            if stalled || self.grad_norm <= self.stop.gtol {
                return Err(self.halt(MinimizeStatus::Converged));
            }
            if self.exhausted() {
                return Err(self.halt(MinimizeStatus::MaxEvaluations));
            }
        }
        Ok(())
    }

    fn finish(mut self, run: SolverResult<()>) -> MinimizeOutcome {
        if self.status.is_none() {
            // Stopping here only records the status.
            let _ = self.sync();
        }
        let status = match (self.status, run) {
            (Some(status), _) => status,
            (None, Ok(())) if self.delivered >= self.stop.max_iterations => {
                MinimizeStatus::MaxIterations
            }
            (None, Ok(())) => MinimizeStatus::Converged,
            (None, Err(e)) => {
                debug!(error = %e, iterations = self.delivered, "solver gave up");
                MinimizeStatus::LineSearchFailed
            }
        };
        MinimizeOutcome {
            x: self.best_x,
            fx: self.best_f,
            iterations: self.delivered,
            evaluations: self.evaluations,
            status,
        }
    }
}

/// The argmin problem: every call goes through the shared [`Session`].
struct Objective<'s, 'f, 'o> {
    session: &'s RefCell<Session<'f, 'o>>,
}

impl CostFunction for Objective<'_, '_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> SolverResult<Self::Output> {
        let mut s = self.session.borrow_mut();
        s.sync()?;
        if s.exhausted() {
            return Err(s.halt(MinimizeStatus::MaxEvaluations));
        }
        Ok(s.eval(x))
    }
}

impl Gradient for Objective<'_, '_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> SolverResult<Self::Gradient> {
        self.session.borrow_mut().sync()?;
        let g = fd_gradient(&|p: &Vec<f64>| self.session.borrow_mut().eval(p), x);
        self.session.borrow_mut().grad_norm = max_abs(&g);
        Ok(g)
    }
}

/// Forward-difference gradient of `f` at `x`.
///
/// Components whose forward point is not finite fall back to a backward
/// difference, and to zero when neither side is finite.
fn fd_gradient(f: &dyn Fn(&Vec<f64>) -> f64, x: &[f64]) -> Vec<f64> {
    let x = x.to_vec();
    let mut g = x.forward_diff(f);
    if g.iter().all(|v| v.is_finite()) {
        return g;
    }
    let h = f64::EPSILON.sqrt();
    let fx = f(&x);
    let mut back = x.clone();
    for (i, gi) in g.iter_mut().enumerate().filter(|(_, v)| !v.is_finite()) {
        back[i] = x[i] - h;
        let bwd = f(&back);
        *gi = if fx.is_finite() && bwd.is_finite() {
            (fx - bwd) / h
        } else {
            0.0
        };
        back[i] = x[i];
    }
    g
}

#[inline]
fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}

#[inline]
fn small_change(f_old: f64, f_new: f64, ftol: f64) -> bool {
    (f_old - f_new).abs() <= ftol * f_old.abs().max(f_new.abs()).max(1.0)
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let mut row = vec![0.0; n];
            row[i] = 1.0;
            row
        })
        .collect()
}

/// Quasi-Newton minimizer keeping a dense inverse-Hessian estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bfgs;

impl Minimizer for Bfgs {
    fn name(&self) -> &'static str {
        "bfgs"
    }

    fn minimize(
        &self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        stop: &StopCriteria,
        observer: &mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
    ) -> MinimizeOutcome {
        let session = RefCell::new(Session::new(f, observer, x0, stop, true));
        let tap = session.borrow().tap();
        let run = (|| -> SolverResult<()> {
            let line_search =
                BacktrackingLineSearch::new(ArmijoCondition::new(ARMIJO_C1)?).rho(0.5)?;
            // The session decides convergence on the cost; argmin's own test is off.
            let solver = BFGS::new(line_search)
                .with_tolerance_grad(stop.gtol)?
                .with_tolerance_cost(0.0)?;
            Executor::new(Objective { session: &session }, solver)
                .configure(|state| {
                    state
                        .param(x0.to_vec())
                        .inv_hessian(identity(x0.len()))
                        .max_iters(stop.max_iterations as u64)
                })
                .add_observer(tap, ObserverMode::Always)
                .run()?;
            Ok(())
        })();
        session.into_inner().finish(run)
    }
}

/// Nonlinear conjugate gradient (Polak-Ribiere+, restarted every `n` iterations).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConjugateGradient;

impl Minimizer for ConjugateGradient {
    fn name(&self) -> &'static str {
        "cg"
    }

    fn minimize(
        &self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        stop: &StopCriteria,
        observer: &mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
    ) -> MinimizeOutcome {
        let session = RefCell::new(Session::new(f, observer, x0, stop, true));
        let tap = session.borrow().tap();
        let run = (|| -> SolverResult<()> {
            let line_search =
                BacktrackingLineSearch::new(ArmijoCondition::new(ARMIJO_C1)?).rho(0.5)?;
            let solver = NonlinearConjugateGradient::new(line_search, PolakRibierePlus::new())
                .restart_iters(x0.len().max(1) as u64);
            Executor::new(Objective { session: &session }, solver)
                .configure(|state| state.param(x0.to_vec()).max_iters(stop.max_iterations as u64))
                .add_observer(tap, ObserverMode::Always)
                .run()?;
            Ok(())
        })();
        session.into_inner().finish(run)
    }
}

/// Downhill simplex. Converges when the standard deviation of the simplex
/// values drops below `ftol`.
#[derive(Debug, Clone, Copy)]
pub struct NelderMead {
    /// Relative size of the initial simplex.
    pub initial_step: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self { initial_step: 0.05 }
    }
}

impl NelderMead {
    /// `x0` plus one vertex per coordinate, stepped by `initial_step` (or a small
    /// absolute step where the coordinate is zero).
    fn simplex(&self, x0: &[f64]) -> Vec<Vec<f64>> {
        let mut vertices = Vec::with_capacity(x0.len() + 1);
        vertices.push(x0.to_vec());
        for i in 0..x0.len() {
            let mut v = x0.to_vec();
            v[i] = if v[i] != 0.0 {
                v[i] * (1.0 + self.initial_step)
            } else {
                0.00025
            };
            vertices.push(v);
        }
        vertices
    }
}

impl Minimizer for NelderMead {
    fn name(&self) -> &'static str {
        "nelder-mead"
    }

    fn minimize(
        &self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        stop: &StopCriteria,
        observer: &mut dyn FnMut(&IterationInfo<'_>) -> ControlFlow<()>,
    ) -> MinimizeOutcome {
        let session = RefCell::new(Session::new(f, observer, x0, stop, false));
        let tap = session.borrow().tap();
        let run = (|| -> SolverResult<()> {
            let solver = Simplex::new(self.simplex(x0)).with_sd_tolerance(stop.ftol)?;
            Executor::new(Objective { session: &session }, solver)
                .configure(|state| state.max_iters(stop.max_iterations as u64))
                .add_observer(tap, ObserverMode::Always)
                .run()?;
            Ok(())
        })();
        session.into_inner().finish(run)
    }
}
