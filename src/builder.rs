//! Network builder.
//!
//! `NetworkBuilder` is the recommended way to define a network. It produces an
//! [`Architecture`]: the ordered layer sizes, per-layer activation, and per-layer
//! product-unit flag. An `Architecture` is plain data, so the same one can be handed
//! to every committee member and stored alongside saved parameters.
//!
//! Default weight initialization per activation:
//!
//! - `tanh` / `sigmoid` / `identity`: Xavier/Glorot
//! - `relu` / `leaky relu`: He/Kaiming

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Activation, Error, Init, Layer, LayerMode, MaskPolicy, Network, Result};

/// One layer of an [`Architecture`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub out_dim: usize,
    pub activation: Activation,
    pub mode: LayerMode,
}

/// A network's shape, independent of its parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct Architecture {
    pub input_dim: usize,
    pub layers: Vec<LayerSpec>,
    pub mask_policy: MaskPolicy,
}

impl Architecture {
    /// Checks sizes and activations.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        if self.layers.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one layer".to_owned(),
            ));
        }
        for (i, spec) in self.layers.iter().enumerate() {
            if spec.out_dim == 0 {
                return Err(Error::InvalidConfig(format!("layer {i} out_dim must be > 0")));
            }
            spec.activation.validate()?;
        }
        Ok(())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.out_dim).unwrap_or(0)
    }

    /// Number of parameters a network of this shape holds.
    pub fn nparams(&self) -> usize {
        let mut in_dim = self.input_dim;
        let mut n = 0;
        for spec in &self.layers {
            n += spec.out_dim * (in_dim + 1);
            in_dim = spec.out_dim;
        }
        n
    }

    /// Builds a zero-parameter network with this shape.
    pub fn build_zeroed(&self) -> Result<Network> {
        self.build_with_init(|_| Init::Zeros, &mut StdRng::seed_from_u64(0))
    }

    /// Builds a network with the default initializer for each activation.
    pub fn build_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Network> {
        self.build_with_init(|spec| default_init_for_activation(spec.activation), rng)
    }

    fn build_with_init<R, F>(&self, init_for: F, rng: &mut R) -> Result<Network>
    where
        R: Rng + ?Sized,
        F: Fn(&LayerSpec) -> Init,
    {
        self.validate()?;
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut in_dim = self.input_dim;
        for spec in &self.layers {
            let layer = Layer::new_with_rng(
                in_dim,
                spec.out_dim,
                init_for(spec),
                spec.activation,
                spec.mode,
                rng,
            )?;
            layers.push(layer);
            in_dim = spec.out_dim;
        }
        Network::from_layers(layers, self.mask_policy)
    }
}

impl From<&Network> for Architecture {
    fn from(net: &Network) -> Self {
        Self {
            input_dim: net.input_dim(),
            layers: net
                .layers()
                .iter()
                .map(|l| LayerSpec {
                    out_dim: l.out_dim(),
                    activation: l.activation(),
                    mode: l.mode(),
                })
                .collect(),
            mask_policy: net.mask_policy(),
        }
    }
}

#[derive(Debug, Clone)]
/// Builder for a `Network`.
///
/// Example:
///
/// ```rust
/// use calibnet::{Activation, NetworkBuilder};
///
/// # fn main() -> calibnet::Result<()> {
/// let net = NetworkBuilder::new(2)?
///     .add_product_layer(2, Activation::Identity)?
///     .add_layer(5, Activation::Tanh)?
///     .add_layer(1, Activation::Identity)?
///     .build_with_seed(0)?;
/// assert_eq!(net.output_dim(), 1);
/// # Ok(())
/// # }
/// ```
pub struct NetworkBuilder {
    arch: Architecture,
}

impl NetworkBuilder {
    /// Start building a network that accepts inputs of length `input_dim`.
    pub fn new(input_dim: usize) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        Ok(Self {
            arch: Architecture {
                input_dim,
                layers: Vec::new(),
                mask_policy: MaskPolicy::default(),
            },
        })
    }

    /// Convenience constructor from a sizes list + activations (all sum layers).
    ///
    /// `sizes` includes input and output dimensions, so its length must be at least 2.
    /// `activations` must have length `sizes.len() - 1`.
    pub fn from_sizes(sizes: &[usize], activations: &[Activation]) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(Error::InvalidConfig(
                "sizes must include input and output dims".to_owned(),
            ));
        }
        if activations.len() != sizes.len() - 1 {
            return Err(Error::InvalidConfig(format!(
                "activations length {} does not match sizes.len() - 1 ({})",
                activations.len(),
                sizes.len() - 1
            )));
        }

        let mut b = Self::new(sizes[0])?;
        for (out_dim, &act) in sizes[1..].iter().zip(activations) {
            b = b.add_layer(*out_dim, act)?;
        }
        Ok(b)
    }

    /// Add a dense sum layer.
    pub fn add_layer(self, out_dim: usize, activation: Activation) -> Result<Self> {
        self.push(out_dim, activation, LayerMode::Sum)
    }

    /// Add a layer of product units.
    pub fn add_product_layer(self, out_dim: usize, activation: Activation) -> Result<Self> {
        self.push(out_dim, activation, LayerMode::Product)
    }

    /// Choose how masked inputs flow through the layers.
    pub fn mask_policy(mut self, policy: MaskPolicy) -> Self {
        self.arch.mask_policy = policy;
        self
    }

    fn push(mut self, out_dim: usize, activation: Activation, mode: LayerMode) -> Result<Self> {
        if out_dim == 0 {
            return Err(Error::InvalidConfig("layer out_dim must be > 0".to_owned()));
        }
        activation.validate()?;
        self.arch.layers.push(LayerSpec {
            out_dim,
            activation,
            mode,
        });
        Ok(self)
    }

    /// The architecture described so far.
    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    pub fn into_architecture(self) -> Result<Architecture> {
        self.arch.validate()?;
        Ok(self.arch)
    }

    /// Build using a deterministic seed.
    pub fn build_with_seed(self, seed: u64) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    /// Build using the provided RNG.
    pub fn build_with_rng<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Network> {
        self.arch.build_with_rng(rng)
    }
}

#[inline]
fn default_init_for_activation(act: Activation) -> Init {
    match act {
        Activation::Tanh | Activation::Sigmoid | Activation::Identity => Init::Xavier,
        Activation::ReLU | Activation::LeakyReLU { .. } => Init::He,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_empty_and_zero_sized() {
        assert!(NetworkBuilder::new(0).is_err());
        assert!(NetworkBuilder::new(2).unwrap().add_layer(0, Activation::Tanh).is_err());
        assert!(NetworkBuilder::new(2).unwrap().build_with_seed(0).is_err());
        assert!(NetworkBuilder::from_sizes(&[2, 3], &[]).is_err());
    }

    #[test]
    fn architecture_round_trips_through_network() {
        let b = NetworkBuilder::new(3)
            .unwrap()
            .add_product_layer(2, Activation::Identity)
            .unwrap()
            .add_layer(1, Activation::Identity)
            .unwrap()
            .mask_policy(MaskPolicy::Neutral);
        let arch = b.architecture().clone();
        let net = b.build_with_seed(1).unwrap();
        assert_eq!(Architecture::from(&net), arch);
        assert_eq!(arch.nparams(), net.nparams());
        assert_eq!(arch.output_dim(), 1);
        assert_eq!(net.layer(0).unwrap().mode(), LayerMode::Product);
        assert_eq!(net.mask_policy(), MaskPolicy::Neutral);
    }

    #[test]
    fn zeroed_build_has_no_nonzero_params() {
        let acts = [Activation::Sigmoid, Activation::Identity];
        let arch = NetworkBuilder::from_sizes(&[2, 3, 1], &acts)
            .unwrap()
            .into_architecture()
            .unwrap();
        let net = arch.build_zeroed().unwrap();
        assert!(net
            .layers()
            .iter()
            .all(|l| l.weights().iter().chain(l.biases()).all(|&v| v == 0.0)));
    }
}
