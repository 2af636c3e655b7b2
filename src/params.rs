//! Flat parameter vectors.
//!
//! A network's trainable state is exposed to optimizers as one flat vector. The
//! layout is fixed and independent of in-memory representation:
//!
//! ```text
//! [ layer 0 weights (row-major, out x in) | layer 0 biases | layer 1 weights | ... ]
//! ```
//!
//! For product layers the "weights" are the exponents. `Network::parameters` and
//! `Network::set_parameters` are exact inverses of each other.

use std::ops::{Deref, DerefMut};

use crate::{Error, Network, Result};

/// A flat, ordered buffer of all trainable parameters of a network.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterVector {
    values: Vec<f64>,
}

impl ParameterVector {
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self { values }
    }

    #[inline]
    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// True if every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl Deref for ParameterVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.values
    }
}

impl DerefMut for ParameterVector {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

impl From<Vec<f64>> for ParameterVector {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl Network {
    /// Flatten all weights and biases into a new vector.
    pub fn parameters(&self) -> ParameterVector {
        let mut values = Vec::with_capacity(self.nparams());
        self.write_parameters(&mut values);
        ParameterVector { values }
    }

    /// Flatten into `out`, reusing its allocation.
    pub fn write_parameters(&self, out: &mut Vec<f64>) {
        out.clear();
        for layer in self.layers() {
            out.extend_from_slice(layer.weights());
            out.extend_from_slice(layer.biases());
        }
    }

    /// Overwrite all weights and biases from a flat vector.
    ///
    /// Fails with `ShapeMismatch` if `params.len() != self.nparams()`; the network is
    /// left untouched in that case.
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        let expected = self.nparams();
        if params.len() != expected {
            return Err(Error::shape("parameter vector", expected, params.len()));
        }
        let mut ind = 0;
        for idx in 0..self.num_layers() {
            if let Some(layer) = self.layer_mut(idx) {
                let nw = layer.weights().len();
                let nb = layer.biases().len();
                layer.weights_mut().copy_from_slice(&params[ind..ind + nw]);
                layer.biases_mut().copy_from_slice(&params[ind + nw..ind + nw + nb]);
                ind += nw + nb;
            }
        }
        debug_assert_eq!(ind, expected);
        Ok(())
    }

    /// A copy of this network carrying `params`.
    pub fn with_parameters(&self, params: &[f64]) -> Result<Network> {
        let mut net = self.clone();
        net.set_parameters(params)?;
        Ok(net)
    }

    /// One label per parameter, in flat-vector order.
    ///
    /// Weights are `layer-<l>_w<node>_<input>`, biases `layer-<l>_b<node>`; the output
    /// layer is named `o`, hidden layers by index.
    pub fn param_labels(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(self.nparams());
        let n = self.num_layers();
        for (l, layer) in self.layers().iter().enumerate() {
            let name = if l + 1 == n {
                "o".to_owned()
            } else {
                l.to_string()
            };
            for o in 0..layer.out_dim() {
                for i in 0..layer.in_dim() {
                    labels.push(format!("layer-{name}_w{o}_{i}"));
                }
            }
            for o in 0..layer.out_dim() {
                labels.push(format!("layer-{name}_b{o}"));
            }
        }
        labels
    }
}
