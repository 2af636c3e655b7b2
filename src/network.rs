use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::{Activation, Error, Init, Layer, LayerMode, MaskPolicy, MaskedArray, Result};

/// A feedforward network: an ordered sequence of layers.
///
/// The input is not a layer; the first layer is the first hidden layer and the
/// last layer produces the outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    layers: Vec<Layer>,
    mask_policy: MaskPolicy,
}

/// Reusable buffers for `Network::forward`.
///
/// The output of the most recent forward pass lives inside `Scratch`.
#[derive(Debug, Clone)]
pub struct Scratch {
    layer_outputs: Vec<Vec<f64>>,
    layer_valid: Vec<Vec<bool>>,
}

impl Network {
    /// Sum-mode network with `tanh` hidden layers and an identity output layer.
    ///
    /// `sizes` includes the input and output dimensions.
    pub fn new_with_seed(sizes: &[usize], seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new_with_rng(sizes, &mut rng)
    }

    pub fn new_with_rng<R: Rng + ?Sized>(sizes: &[usize], rng: &mut R) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(Error::InvalidConfig(
                "sizes must include input and output dims".to_owned(),
            ));
        }
        if sizes.contains(&0) {
            return Err(Error::InvalidConfig(
                "all layer sizes must be > 0".to_owned(),
            ));
        }

        let n = sizes.len() - 1;
        let mut layers = Vec::with_capacity(n);
        for (idx, w) in sizes.windows(2).enumerate() {
            let act = if idx + 1 == n {
                Activation::Identity
            } else {
                Activation::Tanh
            };
            layers.push(Layer::new_with_rng(w[0], w[1], Init::Xavier, act, LayerMode::Sum, rng)?);
        }
        Self::from_layers(layers, MaskPolicy::default())
    }

    /// Assemble a network from layers, checking that consecutive dimensions chain.
    pub fn from_layers(layers: Vec<Layer>, mask_policy: MaskPolicy) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one layer".to_owned(),
            ));
        }
        for i in 1..layers.len() {
            if layers[i].in_dim() != layers[i - 1].out_dim() {
                return Err(Error::shape(
                    format!("layer {i} in_dim"),
                    layers[i - 1].out_dim(),
                    layers[i].in_dim(),
                ));
            }
        }
        let net = Self {
            layers,
            mask_policy,
        };
        debug!(network = %net, "built network");
        Ok(net)
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.layers[0].in_dim()
    }

    #[inline]
    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].out_dim()
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    #[inline]
    pub fn layer(&self, idx: usize) -> Option<&Layer> {
        self.layers.get(idx)
    }

    #[inline]
    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut Layer> {
        self.layers.get_mut(idx)
    }

    #[inline]
    pub fn mask_policy(&self) -> MaskPolicy {
        self.mask_policy
    }

    #[inline]
    pub fn set_mask_policy(&mut self, policy: MaskPolicy) {
        self.mask_policy = policy;
    }

    /// Layer sizes including the input dimension.
    pub fn architecture(&self) -> Vec<usize> {
        let mut arch = Vec::with_capacity(self.layers.len() + 1);
        arch.push(self.input_dim());
        arch.extend(self.layers.iter().map(Layer::out_dim));
        arch
    }

    /// Total number of trainable parameters.
    pub fn nparams(&self) -> usize {
        self.layers.iter().map(Layer::nparams).sum()
    }

    pub fn scratch(&self) -> Scratch {
        Scratch::new(self)
    }

    /// Forward pass for a single realization.
    ///
    /// Writes intermediate activations into `scratch`; the result is available via
    /// `scratch.output()` and `scratch.output_mask()`.
    ///
    /// Shape contract (panics on misuse):
    /// - `input.len() == valid.len() == self.input_dim()`
    /// - `scratch` must be built for this network
    pub fn forward(&self, input: &[f64], valid: &[bool], scratch: &mut Scratch) -> Result<()> {
        assert_eq!(
            input.len(),
            self.input_dim(),
            "input len {} does not match network input_dim {}",
            input.len(),
            self.input_dim()
        );
        assert_eq!(valid.len(), input.len(), "mask len does not match input len");
        assert_eq!(
            scratch.layer_outputs.len(),
            self.layers.len(),
            "scratch has {} layer outputs, network has {} layers",
            scratch.layer_outputs.len(),
            self.layers.len()
        );

        for (idx, layer) in self.layers.iter().enumerate() {
            if idx == 0 {
                layer.forward(
                    0,
                    input,
                    valid,
                    self.mask_policy,
                    &mut scratch.layer_outputs[0],
                    &mut scratch.layer_valid[0],
                )?;
            } else {
                // Borrow the previous output immutably and the current output mutably.
                let (left_out, right_out) = scratch.layer_outputs.split_at_mut(idx);
                let (left_ok, right_ok) = scratch.layer_valid.split_at_mut(idx);
                layer.forward(
                    idx,
                    &left_out[idx - 1],
                    &left_ok[idx - 1],
                    self.mask_policy,
                    &mut right_out[0],
                    &mut right_ok[0],
                )?;
            }
        }
        Ok(())
    }

    /// Forward pass over a batch: one row per realization.
    ///
    /// Returns an array with shape `(batch.rows(), output_dim)`; output masks follow
    /// the network's `MaskPolicy`.
    pub fn forward_batch(&self, batch: &MaskedArray) -> Result<MaskedArray> {
        let mut scratch = self.scratch();
        self.forward_batch_with(batch, &mut scratch)
    }

    /// As [`Network::forward_batch`], reusing caller-provided buffers.
    pub fn forward_batch_with(
        &self,
        batch: &MaskedArray,
        scratch: &mut Scratch,
    ) -> Result<MaskedArray> {
        self.check_input(batch)?;
        let out_dim = self.output_dim();
        let mut values = Vec::with_capacity(batch.rows() * out_dim);
        let mut valid = Vec::with_capacity(batch.rows() * out_dim);
        for r in 0..batch.rows() {
            self.forward(batch.row(r), batch.row_mask(r), scratch)?;
            values.extend_from_slice(scratch.output());
            valid.extend_from_slice(scratch.output_mask());
        }
        MaskedArray::new(batch.rows(), out_dim, values, valid)
    }

    fn check_input(&self, batch: &MaskedArray) -> Result<()> {
        if batch.cols() != self.input_dim() {
            return Err(Error::shape("network input", self.input_dim(), batch.cols()));
        }
        Ok(())
    }

    /// Sets every layer to a (partial) identity; see [`Layer::set_identity`].
    pub fn set_identity(&mut self, only_n: Option<usize>) {
        for layer in &mut self.layers {
            layer.set_identity(only_n);
        }
    }

    pub fn zero(&mut self) {
        for layer in &mut self.layers {
            layer.zero();
        }
    }

    /// Adds Gaussian noise to all weights and biases.
    pub fn add_noise<R: Rng + ?Sized>(&mut self, wscale: f64, bscale: f64, rng: &mut R) {
        for layer in &mut self.layers {
            layer.add_noise(wscale, bscale, rng);
        }
    }

    /// Multi-line description of every node, useful for debugging.
    pub fn report(&self) -> String {
        let rule = "=".repeat(80);
        let mut txt = vec![rule.clone(), self.to_string()];
        for (i, layer) in self.layers.iter().enumerate() {
            let name = if i + 1 == self.layers.len() {
                "o".to_owned()
            } else {
                format!("h{i}")
            };
            txt.push(layer.report(&name));
        }
        txt.push(rule);
        txt.join("\n")
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n_product = self
            .layers
            .iter()
            .filter(|l| l.mode() == LayerMode::Product)
            .count();
        write!(
            f,
            "Network with architecture {:?} ({} product layers) and {} params",
            self.architecture(),
            n_product,
            self.nparams()
        )
    }
}

impl Scratch {
    pub fn new(net: &Network) -> Self {
        let mut layer_outputs = Vec::with_capacity(net.layers.len());
        let mut layer_valid = Vec::with_capacity(net.layers.len());
        for layer in &net.layers {
            layer_outputs.push(vec![0.0; layer.out_dim()]);
            layer_valid.push(vec![false; layer.out_dim()]);
        }
        Self {
            layer_outputs,
            layer_valid,
        }
    }

    #[inline]
    pub fn output(&self) -> &[f64] {
        self.layer_outputs
            .last()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[inline]
    pub fn output_mask(&self) -> &[bool] {
        self.layer_valid
            .last()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_init_is_deterministic() {
        let a = Network::new_with_seed(&[2, 3, 1], 123).unwrap();
        let b = Network::new_with_seed(&[2, 3, 1], 123).unwrap();
        let batch = MaskedArray::from_rows(&[vec![0.3, -0.7], vec![1.0, 2.0]]).unwrap();
        assert_eq!(a.forward_batch(&batch).unwrap(), b.forward_batch(&batch).unwrap());
        assert_eq!(a.nparams(), 3 * 3 + 1 * 4);
        assert_eq!(a.architecture(), vec![2, 3, 1]);
    }

    #[test]
    fn from_layers_rejects_broken_chains() {
        let l1 = Layer::new(2, 3, Activation::Tanh, LayerMode::Sum).unwrap();
        let l2 = Layer::new(4, 1, Activation::Identity, LayerMode::Sum).unwrap();
        let err = Network::from_layers(vec![l1, l2], MaskPolicy::Propagate).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 3, actual: 4, .. }));
        assert!(Network::from_layers(vec![], MaskPolicy::Propagate).is_err());
    }

    #[test]
    fn forward_batch_rejects_wrong_feature_count() {
        let net = Network::new_with_seed(&[2, 1], 0).unwrap();
        let batch = MaskedArray::from_rows(&[vec![1.0, 2.0, 3.0]]).unwrap();
        assert!(matches!(
            net.forward_batch(&batch),
            Err(Error::ShapeMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn missing_feature_invalidates_only_its_realization() {
        let net = Network::new_with_seed(&[2, 4, 1], 0).unwrap();
        let rows = [vec![Some(0.1), None], vec![Some(0.1), Some(0.2)]];
        let batch = MaskedArray::from_options(&rows).unwrap();
        let out = net.forward_batch(&batch).unwrap();
        assert_eq!(out.get(0, 0), None);
        assert!(out.get(1, 0).is_some());
    }

    #[test]
    fn product_then_sum_learns_a_product_exactly() {
        // z = x * y with a single product unit followed by an identity sum layer.
        let identity = Activation::Identity;
        let prod = Layer::from_parts(2, 1, identity, LayerMode::Product, vec![1.0, 1.0], vec![0.0])
            .unwrap();
        let out = Layer::from_parts(1, 1, identity, LayerMode::Sum, vec![1.0], vec![0.0]).unwrap();
        let net = Network::from_layers(vec![prod, out], MaskPolicy::Propagate).unwrap();
        let batch = MaskedArray::from_rows(&[vec![-2.0, 3.0], vec![0.5, 0.5]]).unwrap();
        let y = net.forward_batch(&batch).unwrap();
        assert_eq!(y.get(0, 0), Some(-6.0));
        assert_eq!(y.get(1, 0), Some(0.25));
    }

    #[test]
    fn identity_network_passes_input_through() {
        let mut net = Network::new_with_seed(&[1, 1], 3).unwrap();
        net.set_identity(None);
        let batch = MaskedArray::from_rows(&[vec![0.42]]).unwrap();
        assert_eq!(net.forward_batch(&batch).unwrap().get(0, 0), Some(0.42));
        assert!(net.report().contains("output 0"));
    }

    #[test]
    #[should_panic]
    fn forward_panics_on_scratch_mismatch() {
        let a = Network::new_with_seed(&[2, 3, 1], 0).unwrap();
        let b = Network::new_with_seed(&[2, 3, 4, 1], 0).unwrap();
        let mut scratch_b = b.scratch();
        let _ = a.forward(&[0.0, 0.0], &[true, true], &mut scratch_b);
    }
}
