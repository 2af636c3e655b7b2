use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{Activation, Error, Result};

/// How a layer's nodes combine their inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerMode {
    /// `act(sum_k w_k * x_k + b)`.
    #[default]
    Sum,
    /// Product unit: `act(prod_k spow(x_k, w_k) + b)`, where the weights are exponents.
    Product,
}

/// What a layer does with invalid (masked) inputs.
///
/// The policy is set once per network and applied identically in every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskPolicy {
    /// Any invalid input invalidates every node it feeds. Dense layers connect
    /// every input to every node, so one missing feature invalidates the whole
    /// realization output.
    #[default]
    Propagate,
    /// Invalid inputs are replaced by the neutral element of the node's reduction
    /// (`0` for sums, base `1` for products). A node is invalid only when all of
    /// its inputs are invalid.
    Neutral,
}

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// Uniform in `[-sqrt(6/(in+out)), sqrt(6/(in+out))]`.
    Xavier,
    /// Uniform in `[-sqrt(6/in), sqrt(6/in)]`.
    He,
    /// All parameters zero.
    Zeros,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    in_dim: usize,
    out_dim: usize,
    /// Row-major matrix with shape (out_dim, in_dim). Exponents for product layers.
    weights: Vec<f64>,
    biases: Vec<f64>,
    activation: Activation,
    mode: LayerMode,
}

impl Layer {
    /// A zero-initialized layer.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        mode: LayerMode,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "layer dims must be > 0, got in_dim={in_dim} out_dim={out_dim}"
            )));
        }
        activation.validate()?;
        Ok(Self {
            in_dim,
            out_dim,
            weights: vec![0.0; in_dim * out_dim],
            biases: vec![0.0; out_dim],
            activation,
            mode,
        })
    }

    pub fn new_with_rng<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        init: Init,
        activation: Activation,
        mode: LayerMode,
        rng: &mut R,
    ) -> Result<Self> {
        let mut layer = Self::new(in_dim, out_dim, activation, mode)?;
        let limit = match init {
            Init::Xavier => (6.0 / (in_dim + out_dim) as f64).sqrt(),
            Init::He => (6.0 / in_dim as f64).sqrt(),
            Init::Zeros => return Ok(layer),
        };
        let dist = Uniform::new_inclusive(-limit, limit);
        for w in layer.weights.iter_mut() {
            *w = dist.sample(rng);
        }
        Ok(layer)
    }

    /// Build a layer from explicit parameters, validating shapes and finiteness.
    pub fn from_parts(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        mode: LayerMode,
        weights: Vec<f64>,
        biases: Vec<f64>,
    ) -> Result<Self> {
        let mut layer = Self::new(in_dim, out_dim, activation, mode)?;
        if weights.len() != in_dim * out_dim {
            return Err(Error::shape("layer weights", in_dim * out_dim, weights.len()));
        }
        if biases.len() != out_dim {
            return Err(Error::shape("layer biases", out_dim, biases.len()));
        }
        if weights.iter().chain(&biases).any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(
                "layer parameters must be finite".to_owned(),
            ));
        }
        layer.weights = weights;
        layer.biases = biases;
        Ok(layer)
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }

    #[inline]
    pub fn mode(&self) -> LayerMode {
        self.mode
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }

    #[inline]
    pub fn biases(&self) -> &[f64] {
        &self.biases
    }

    #[inline]
    pub fn biases_mut(&mut self) -> &mut [f64] {
        &mut self.biases
    }

    /// Number of trainable parameters: weights (or exponents) plus biases.
    #[inline]
    pub fn nparams(&self) -> usize {
        self.out_dim * (self.in_dim + 1)
    }

    /// Forward pass for a single realization.
    ///
    /// `layer_idx` is only used to locate domain errors.
    ///
    /// Shape contract:
    /// - `inputs.len() == in_valid.len() == self.in_dim`
    /// - `outputs.len() == out_valid.len() == self.out_dim`
    ///
    /// Invalid inputs are never read, so any stored value is harmless.
    pub fn forward(
        &self,
        layer_idx: usize,
        inputs: &[f64],
        in_valid: &[bool],
        policy: MaskPolicy,
        outputs: &mut [f64],
        out_valid: &mut [bool],
    ) -> Result<()> {
        debug_assert_eq!(inputs.len(), self.in_dim);
        debug_assert_eq!(in_valid.len(), self.in_dim);
        debug_assert_eq!(outputs.len(), self.out_dim);
        debug_assert_eq!(out_valid.len(), self.out_dim);

        let n_valid = in_valid.iter().filter(|&&v| v).count();
        let node_valid = match policy {
            MaskPolicy::Propagate => n_valid == self.in_dim,
            MaskPolicy::Neutral => n_valid > 0,
        };

        for o in 0..self.out_dim {
            out_valid[o] = node_valid;
            if !node_valid {
                outputs[o] = 0.0;
                continue;
            }

            let row = &self.weights[o * self.in_dim..(o + 1) * self.in_dim];
            let z = match self.mode {
                LayerMode::Sum => {
                    let mut sum = self.biases[o];
                    for i in 0..self.in_dim {
                        if in_valid[i] {
                            sum = row[i].mul_add(inputs[i], sum);
                        }
                    }
                    sum
                }
                LayerMode::Product => {
                    let mut prod = 1.0;
                    for i in 0..self.in_dim {
                        if in_valid[i] {
                            prod *= signed_pow(inputs[i], row[i]).ok_or(Error::Domain {
                                layer: layer_idx,
                                node: o,
                                base: inputs[i],
                                exponent: row[i],
                            })?;
                        }
                    }
                    if !prod.is_finite() {
                        return Err(Error::Domain {
                            layer: layer_idx,
                            node: o,
                            base: f64::NAN,
                            exponent: f64::NAN,
                        });
                    }
                    prod + self.biases[o]
                }
            };
            outputs[o] = self.activation.forward(z);
        }
        Ok(())
    }

    /// Sets weights to a (partial) identity and biases to zero.
    ///
    /// Node `k` receives input `k` with weight (or exponent) 1 for
    /// `k < min(in_dim, out_dim, only_n)`; everything else is zero.
    pub fn set_identity(&mut self, only_n: Option<usize>) {
        self.weights.fill(0.0);
        self.biases.fill(0.0);
        let n = self
            .in_dim
            .min(self.out_dim)
            .min(only_n.unwrap_or(usize::MAX));
        for k in 0..n {
            self.weights[k * self.in_dim + k] = 1.0;
        }
    }

    /// Sets all weights and biases to zero.
    pub fn zero(&mut self) {
        self.weights.fill(0.0);
        self.biases.fill(0.0);
    }

    /// Adds Gaussian noise with standard deviations `wscale` (weights) and `bscale` (biases).
    pub fn add_noise<R: Rng + ?Sized>(&mut self, wscale: f64, bscale: f64, rng: &mut R) {
        for w in self.weights.iter_mut() {
            let n: f64 = StandardNormal.sample(rng);
            *w += wscale * n;
        }
        for b in self.biases.iter_mut() {
            let n: f64 = StandardNormal.sample(rng);
            *b += bscale * n;
        }
    }

    /// One line per node describing the formula it computes.
    pub fn report(&self, name: &str) -> String {
        let mut lines = vec![format!(
            "Layer '{name}', mode {:?}, ni {}, nn {}, act {}:",
            self.mode,
            self.in_dim,
            self.out_dim,
            self.activation.name()
        )];
        for o in 0..self.out_dim {
            let row = &self.weights[o * self.in_dim..(o + 1) * self.in_dim];
            let inner = match self.mode {
                LayerMode::Sum => format!("input * {row:?}"),
                LayerMode::Product => format!("prod(spow(input, {row:?}))"),
            };
            lines.push(format!(
                "    output {o} = {} ( {inner} + {} )",
                self.activation.name(),
                self.biases[o]
            ));
        }
        lines.join("\n")
    }
}

/// Sign-preserving power: `sign(x) * |x|^e`.
///
/// `spow(0, e)` is `0` for `e > 0` and `1` for `e == 0`. Returns `None` for a zero
/// base with a negative exponent, or when the result is not finite.
#[inline]
pub fn signed_pow(x: f64, e: f64) -> Option<f64> {
    if x == 0.0 {
        return if e > 0.0 {
            Some(0.0)
        } else if e == 0.0 {
            Some(1.0)
        } else {
            None
        };
    }
    let y = x.signum() * x.abs().powf(e);
    if y.is_finite() {
        Some(y)
    } else {
        None
    }
}
