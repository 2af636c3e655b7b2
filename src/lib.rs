//! Bias-optimized feedforward regression networks.
//!
//! `calibnet` trains small feedforward networks for noisy inverse regression
//! ("calibration"): predict a true explanatory value `theta` from noisy observed
//! features. Each training case carries a whole population of noise realizations
//! of the same truth, and the cost can target the *bias* of the network (error of
//! the per-case mean prediction) instead of the error of single predictions.
//!
//! # Design
//!
//! - Masked data everywhere: features live in [`MaskedArray`]s. Elementwise work
//!   propagates invalidity; case/realization averaging skips invalid entries.
//! - Product units: a layer may compute `act(prod_k spow(x_k, w_k) + b)` with the
//!   sign-preserving power `spow(x, e) = sign(x) |x|^e`. Leaving the domain is an
//!   [`Error::Domain`], never a silent `NaN`.
//! - Black-box optimization: the network is flattened into a [`ParameterVector`]
//!   and minimized with a [`Minimizer`] (BFGS, conjugate gradient, Nelder-Mead)
//!   using finite differences only. No backpropagation.
//! - Committees: [`Committee`] trains independent members on worker threads that
//!   share nothing mutable, and aggregates their predictions with a spread.
//!
//! # Panics vs `Result`
//!
//! - Low-level hot path (panics on misuse): [`Network::forward`] asserts shapes.
//! - Everything else validates at the boundary and returns [`Result`].
//!   Training-level conditions (non-convergence, excluded cases, failed committee
//!   members) are fields on reports, not errors.
//!
//! # Logging
//!
//! The crate emits [`tracing`] events and never installs a subscriber.
//!
//! # Quick start
//!
//! ```rust
//! use calibnet::{
//!     Activation, CostFunction, NetworkBuilder, TrainConfig, TrainingCase, TrainingSet,
//! };
//!
//! # fn main() -> calibnet::Result<()> {
//! // feature = theta + noise, four realizations per case
//! let noise = [-0.1, 0.05, 0.1, -0.05];
//! let cases = (0..10)
//!     .map(|i| {
//!         let theta = i as f64 / 10.0;
//!         let rows: Vec<Vec<f64>> = noise.iter().map(|n| vec![theta + n]).collect();
//!         TrainingCase::from_rows(theta, &rows)
//!     })
//!     .collect::<calibnet::Result<Vec<_>>>()?;
//! let train = TrainingSet::new(cases)?;
//!
//! let mut net = NetworkBuilder::new(1)?
//!     .add_layer(3, Activation::Tanh)?
//!     .add_layer(1, Activation::Identity)?
//!     .build_with_seed(0)?;
//!
//! let report = net.fit(
//!     &train,
//!     TrainConfig {
//!         cost: CostFunction::Msb,
//!         max_iterations: 50,
//!         ..TrainConfig::default()
//!     },
//! )?;
//! assert!(report.final_cost <= report.initial_cost);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod builder;
pub mod committee;
pub mod cost;
pub mod data;
pub mod error;
pub mod layer;
pub mod masked;
pub mod metrics;
pub mod network;
pub mod normer;
pub mod optim;
pub mod params;
pub mod train;

#[cfg(feature = "serde")]
pub mod serde_model;

pub use activation::Activation;
pub use builder::{Architecture, LayerSpec, NetworkBuilder};
pub use committee::{
    Aggregation, Committee, CommitteeConfig, CommitteeMember, CommitteePrediction, CommitteeResult,
    InitStrategy, MemberConfig, MemberFailure,
};
pub use cost::{CaseCost, CostFunction, CostReport, WeightNorm};
pub use data::{Shuffle, TrainingCase, TrainingSet};
pub use error::{Error, Result};
pub use layer::{signed_pow, Init, Layer, LayerMode, MaskPolicy};
pub use masked::MaskedArray;
pub use metrics::BiasSummary;
pub use network::{Network, Scratch};
pub use normer::{norm_set, NormKind, Normer};
pub use optim::{
    Bfgs, ConjugateGradient, IterationInfo, MinimizeOutcome, MinimizeStatus, Minimizer, NelderMead,
    StopCriteria,
};
pub use params::ParameterVector;
pub use train::{
    Algorithm, IterationRecord, Minibatch, TrainConfig, TrainReport, Training, TrainingState,
};
