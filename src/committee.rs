//! Committee training and aggregation.
//!
//! Each member is trained on its own thread with its own network, parameters and
//! minimizer. The training set is shared read-only; results come back over a
//! channel. Nothing else is shared, so there is no locking.
//!
//! A member that errors, panics or times out is recorded as a failure and the
//! others carry on. Cancelling the committee (see [`Committee::stop_handle`])
//! abandons running members and returns whatever already finished. The flag is
//! cleared when [`Committee::train`] returns, so a committee can train again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::{
    masked, Architecture, Error, MaskedArray, Network, Result, TrainConfig, TrainReport, Training,
    TrainingSet,
};

/// Interval at which the collector re-checks the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a member's network is initialized before training.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum InitStrategy {
    /// Default random initialization per activation.
    #[default]
    Random,
    /// Identity layers plus Gaussian noise on weights and biases.
    IdentityWithNoise { wscale: f64, bscale: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberConfig {
    pub architecture: Architecture,
    pub init: InitStrategy,
    pub train: TrainConfig,
    /// Seeds initialization and bootstrap resampling.
    pub seed: u64,
    /// Train on a bootstrap resample of the cases.
    pub bootstrap: bool,
}

impl MemberConfig {
    pub fn new(architecture: Architecture, train: TrainConfig) -> Self {
        Self {
            architecture,
            init: InitStrategy::Random,
            train,
            seed: 0,
            bootstrap: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.architecture.validate()?;
        self.train.validate()?;
        if let InitStrategy::IdentityWithNoise { wscale, bscale } = self.init {
            if !(wscale.is_finite() && wscale >= 0.0 && bscale.is_finite() && bscale >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "noise scales must be finite and >= 0, got wscale={wscale} bscale={bscale}"
                )));
            }
        }
        Ok(())
    }

    /// Builds the initial network for this member.
    pub fn build_network(&self) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        match self.init {
            InitStrategy::Random => self.architecture.build_with_rng(&mut rng),
            InitStrategy::IdentityWithNoise { wscale, bscale } => {
                let mut net = self.architecture.build_zeroed()?;
                net.set_identity(None);
                net.add_noise(wscale, bscale, &mut rng);
                Ok(net)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitteeConfig {
    pub members: Vec<MemberConfig>,
    /// Concurrent workers; `None` uses the available parallelism.
    pub max_workers: Option<usize>,
    /// Per-member wall-clock limit.
    pub timeout: Option<Duration>,
}

impl CommitteeConfig {
    /// `n` copies of `member` with seeds `member.seed + i`.
    pub fn uniform(n: usize, member: MemberConfig) -> Self {
        let members = (0..n)
            .map(|i| MemberConfig {
                seed: member.seed.wrapping_add(i as u64),
                ..member.clone()
            })
            .collect();
        Self {
            members,
            max_workers: None,
            timeout: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::InvalidConfig(
                "committee needs at least one member".to_owned(),
            ));
        }
        if self.max_workers == Some(0) {
            return Err(Error::InvalidConfig("max_workers must be > 0".to_owned()));
        }
        for (i, m) in self.members.iter().enumerate() {
            m.validate()
                .map_err(|e| Error::InvalidConfig(format!("member {i}: {e}")))?;
        }
        Ok(())
    }

    fn workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .min(self.members.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitteeMember {
    pub index: usize,
    pub network: Network,
    pub final_cost: f64,
    /// `None` for members loaded from disk.
    pub report: Option<TrainReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub index: usize,
    pub reason: String,
}

/// Trained members (by index) plus failed ones.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitteeResult {
    pub members: Vec<CommitteeMember>,
    pub failures: Vec<MemberFailure>,
}

/// How member predictions are combined.
#[derive(Debug, Clone, Copy)]
pub enum Aggregation {
    Mean,
    Median,
    /// Receives the valid member values of one output element.
    Custom(fn(&[f64]) -> f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitteePrediction {
    /// Shape `(rows, output_dim)`. Valid where at least one member is valid.
    pub values: MaskedArray,
    /// Population std across members, same shape and mask as `values`.
    pub spread: MaskedArray,
    pub n_members: usize,
}

/// Parallel committee trainer.
#[derive(Debug)]
pub struct Committee {
    config: CommitteeConfig,
    stop: Arc<AtomicBool>,
}

type WorkerResult = std::result::Result<(Network, TrainReport), String>;

impl Committee {
    pub fn new(config: CommitteeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &CommitteeConfig {
        &self.config
    }

    /// Setting this flag abandons running members. [`Committee::train`] clears it
    /// on return.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Train every member. Errors only on up-front shape problems; member
    /// failures are listed on the result.
    pub fn train(&self, set: &TrainingSet) -> Result<CommitteeResult> {
        for (i, m) in self.config.members.iter().enumerate() {
            if m.architecture.input_dim != set.feature_dim() {
                return Err(Error::shape(
                    format!("member {i} input_dim vs training feature_dim"),
                    m.architecture.input_dim,
                    set.feature_dim(),
                ));
            }
        }

        let n = self.config.members.len();
        let workers = self.config.workers();
        info!(members = n, workers, "training committee");

        let (tx, rx) = mpsc::channel::<(usize, WorkerResult)>();
        let mut result = CommitteeResult::default();
        // (index, started, member stop flag)
        let mut running: Vec<(usize, Instant, Arc<AtomicBool>)> = Vec::with_capacity(workers);
        let mut next = 0usize;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                for (index, _, flag) in running.drain(..) {
                    flag.store(true, Ordering::Relaxed);
                    result.fail(index, "cancelled while running".to_owned());
                }
                for index in next..n {
                    result.fail(index, "cancelled before start".to_owned());
                }
                break;
            }

            while running.len() < workers && next < n {
                let flag = Arc::new(AtomicBool::new(false));
                self.spawn(next, set, tx.clone(), Arc::clone(&flag));
                running.push((next, Instant::now(), flag));
                next += 1;
            }
            if running.is_empty() {
                break;
            }

            let mut wait = POLL_INTERVAL;
            if let Some(limit) = self.config.timeout {
                for (_, started, _) in &running {
                    wait = wait.min(limit.saturating_sub(started.elapsed()));
                }
            }

            match rx.recv_timeout(wait) {
                Ok((index, outcome)) => {
                    let Some(pos) = running.iter().position(|(i, _, _)| *i == index) else {
                        // Late result from an abandoned member.
                        continue;
                    };
                    running.swap_remove(pos);
                    match outcome {
                        Ok((network, report)) => {
                            info!(
                                member = index,
                                final_cost = report.final_cost,
                                status = ?report.status,
                                "member finished"
                            );
                            result.members.push(CommitteeMember {
                                index,
                                network,
                                final_cost: report.final_cost,
                                report: Some(report),
                            });
                        }
                        Err(reason) => result.fail(index, reason),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(limit) = self.config.timeout {
                        let mut i = 0;
                        while i < running.len() {
                            if running[i].1.elapsed() >= limit {
                                let (index, _, flag) = running.swap_remove(i);
                                flag.store(true, Ordering::Relaxed);
                                result.fail(index, format!("timed out after {limit:?}"));
                            } else {
                                i += 1;
                            }
                        }
                    }
                }
                // Unreachable while `tx` is alive.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.stop.store(false, Ordering::Relaxed);
        result.members.sort_by_key(|m| m.index);
        result.failures.sort_by_key(|f| f.index);
        info!(
            trained = result.members.len(),
            failed = result.failures.len(),
            "committee done"
        );
        Ok(result)
    }

    fn spawn(
        &self,
        index: usize,
        set: &TrainingSet,
        tx: mpsc::Sender<(usize, WorkerResult)>,
        stop: Arc<AtomicBool>,
    ) {
        let member = self.config.members[index].clone();
        let set = set.clone();
        info!(member = index, seed = member.seed, bootstrap = member.bootstrap, "member started");
        thread::spawn(move || {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| train_member(&member, &set, stop)))
                    .unwrap_or_else(|payload| {
                        Err(format!("panicked: {}", panic_message(&*payload)))
                    });
            // The collector may be gone after cancellation.
            let _ = tx.send((index, outcome));
        });
    }
}

fn train_member(member: &MemberConfig, set: &TrainingSet, stop: Arc<AtomicBool>) -> WorkerResult {
    let run = || -> Result<(Network, TrainReport)> {
        let net = member.build_network()?;
        let set = if member.bootstrap {
            // Distinct stream from the initialization seed.
            let mut rng = StdRng::seed_from_u64(member.seed ^ 0x9E37_79B9_7F4A_7C15);
            set.bootstrap(&mut rng)?
        } else {
            set.clone()
        };
        let mut training = Training::new(net, set, member.train.clone())?.with_stop_flag(stop);
        let report = training.run()?;
        Ok((training.into_network(), report))
    };
    run().map_err(|e| e.to_string())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl CommitteeResult {
    fn fail(&mut self, index: usize, reason: String) {
        warn!(member = index, %reason, "member failed");
        self.failures.push(MemberFailure { index, reason });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True if no member failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.members.iter().map(|m| &m.network)
    }

    /// Member with the lowest final cost.
    pub fn best_member(&self) -> Option<&CommitteeMember> {
        self.members
            .iter()
            .min_by(|a, b| a.final_cost.total_cmp(&b.final_cost))
    }

    /// One line per member and per failure.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.members.len() + self.failures.len() + 1);
        lines.push(format!(
            "committee: {} trained, {} failed",
            self.members.len(),
            self.failures.len()
        ));
        for m in &self.members {
            let status = m
                .report
                .as_ref()
                .map_or_else(|| "loaded".to_owned(), |r| format!("{:?}", r.status));
            lines.push(format!("  member {:>3}: cost {:.6e} ({status})", m.index, m.final_cost));
        }
        for f in &self.failures {
            lines.push(format!("  member {:>3}: FAILED {}", f.index, f.reason));
        }
        lines.join("\n")
    }

    /// Evaluate every member on `inputs` and combine per output element.
    pub fn predict(
        &self,
        inputs: &MaskedArray,
        aggregation: Aggregation,
    ) -> Result<CommitteePrediction> {
        if self.members.is_empty() {
            return Err(Error::InvalidData(
                "committee has no trained member".to_owned(),
            ));
        }
        let outputs = self
            .members
            .iter()
            .map(|m| m.network.forward_batch(inputs))
            .collect::<Result<Vec<_>>>()?;
        let out_dim = outputs[0].cols();
        for o in &outputs {
            if o.cols() != out_dim {
                return Err(Error::shape("member output_dim", out_dim, o.cols()));
            }
        }

        let rows = inputs.rows();
        let mut values = Vec::with_capacity(rows * out_dim);
        let mut spread = Vec::with_capacity(rows * out_dim);
        let mut valid = Vec::with_capacity(rows * out_dim);
        let mut vals = Vec::with_capacity(outputs.len());
        let mut oks = Vec::with_capacity(outputs.len());
        for r in 0..rows {
            for c in 0..out_dim {
                vals.clear();
                oks.clear();
                for o in &outputs {
                    vals.push(o.row(r)[c]);
                    oks.push(o.row_mask(r)[c]);
                }
                let agg = match aggregation {
                    Aggregation::Mean => masked::mean_skip_invalid(&vals, &oks),
                    Aggregation::Median => masked::median_skip_invalid(&vals, &oks),
                    Aggregation::Custom(f) => {
                        let kept: Vec<f64> = vals
                            .iter()
                            .zip(&oks)
                            .filter(|(_, &ok)| ok)
                            .map(|(&v, _)| v)
                            .collect();
                        if kept.is_empty() {
                            None
                        } else {
                            Some(f(&kept))
                        }
                    }
                };
                let std = masked::std_skip_invalid(&vals, &oks);
                match (agg, std) {
                    (Some(a), Some(s)) => {
                        values.push(a);
                        spread.push(s);
                        valid.push(true);
                    }
                    _ => {
                        values.push(0.0);
                        spread.push(0.0);
                        valid.push(false);
                    }
                }
            }
        }
        Ok(CommitteePrediction {
            values: MaskedArray::new(rows, out_dim, values, valid.clone())?,
            spread: MaskedArray::new(rows, out_dim, spread, valid)?,
            n_members: outputs.len(),
        })
    }
}
