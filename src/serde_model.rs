//! Saved-model records (feature: `serde`).
//!
//! A saved network is its architecture plus the flat parameter vector, in the
//! same order as [`Network::parameters`]. Internal structs are never serialized
//! directly, so the file format stays stable if the in-memory layout changes.
//!
//! Every load validates the version, the dimensions, the parameter count and
//! that all parameters are finite.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    Activation, Architecture, CommitteeMember, CommitteeResult, Error, LayerMode, LayerSpec,
    MaskPolicy, Network, Result,
};

pub const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNetwork {
    pub format_version: u32,
    pub input_dim: usize,
    pub mask_policy: SerializedMaskPolicy,
    pub layers: Vec<SerializedLayer>,
    /// Per layer: weights (row-major, out x in) then biases.
    pub parameters: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedLayer {
    pub out_dim: usize,
    pub activation: SerializedActivation,
    pub mode: SerializedLayerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SerializedActivation {
    Tanh,
    Relu,
    LeakyRelu { alpha: f64 },
    Sigmoid,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializedLayerMode {
    Sum,
    Product,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializedMaskPolicy {
    Propagate,
    Neutral,
}

impl From<Activation> for SerializedActivation {
    fn from(value: Activation) -> Self {
        match value {
            Activation::Tanh => SerializedActivation::Tanh,
            Activation::ReLU => SerializedActivation::Relu,
            Activation::LeakyReLU { alpha } => SerializedActivation::LeakyRelu { alpha },
            Activation::Sigmoid => SerializedActivation::Sigmoid,
            Activation::Identity => SerializedActivation::Identity,
        }
    }
}

impl From<SerializedActivation> for Activation {
    fn from(value: SerializedActivation) -> Self {
        match value {
            SerializedActivation::Tanh => Activation::Tanh,
            SerializedActivation::Relu => Activation::ReLU,
            SerializedActivation::LeakyRelu { alpha } => Activation::LeakyReLU { alpha },
            SerializedActivation::Sigmoid => Activation::Sigmoid,
            SerializedActivation::Identity => Activation::Identity,
        }
    }
}

impl From<LayerMode> for SerializedLayerMode {
    fn from(value: LayerMode) -> Self {
        match value {
            LayerMode::Sum => SerializedLayerMode::Sum,
            LayerMode::Product => SerializedLayerMode::Product,
        }
    }
}

impl From<SerializedLayerMode> for LayerMode {
    fn from(value: SerializedLayerMode) -> Self {
        match value {
            SerializedLayerMode::Sum => LayerMode::Sum,
            SerializedLayerMode::Product => LayerMode::Product,
        }
    }
}

impl From<MaskPolicy> for SerializedMaskPolicy {
    fn from(value: MaskPolicy) -> Self {
        match value {
            MaskPolicy::Propagate => SerializedMaskPolicy::Propagate,
            MaskPolicy::Neutral => SerializedMaskPolicy::Neutral,
        }
    }
}

impl From<SerializedMaskPolicy> for MaskPolicy {
    fn from(value: SerializedMaskPolicy) -> Self {
        match value {
            SerializedMaskPolicy::Propagate => MaskPolicy::Propagate,
            SerializedMaskPolicy::Neutral => MaskPolicy::Neutral,
        }
    }
}

impl SerializedNetwork {
    pub fn architecture(&self) -> Architecture {
        Architecture {
            input_dim: self.input_dim,
            layers: self
                .layers
                .iter()
                .map(|l| LayerSpec {
                    out_dim: l.out_dim,
                    activation: l.activation.into(),
                    mode: l.mode.into(),
                })
                .collect(),
            mask_policy: self.mask_policy.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported model format_version {}; expected {}",
                self.format_version, MODEL_FORMAT_VERSION
            )));
        }
        let arch = self.architecture();
        arch.validate()
            .map_err(|e| Error::InvalidData(format!("invalid architecture: {e}")))?;
        if self.parameters.len() != arch.nparams() {
            return Err(Error::InvalidData(format!(
                "parameters length {} does not match architecture ({} expected)",
                self.parameters.len(),
                arch.nparams()
            )));
        }
        if self.parameters.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(
                "parameters must contain only finite values".to_owned(),
            ));
        }
        Ok(())
    }
}

impl From<&Network> for SerializedNetwork {
    fn from(net: &Network) -> Self {
        let arch = Architecture::from(net);
        Self {
            format_version: MODEL_FORMAT_VERSION,
            input_dim: arch.input_dim,
            mask_policy: arch.mask_policy.into(),
            layers: arch
                .layers
                .iter()
                .map(|l| SerializedLayer {
                    out_dim: l.out_dim,
                    activation: l.activation.into(),
                    mode: l.mode.into(),
                })
                .collect(),
            parameters: net.parameters().into_vec(),
        }
    }
}

impl TryFrom<SerializedNetwork> for Network {
    type Error = Error;

    fn try_from(value: SerializedNetwork) -> std::result::Result<Self, Self::Error> {
        value.validate()?;
        let mut net = value.architecture().build_zeroed()?;
        net.set_parameters(&value.parameters)?;
        Ok(net)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedCommittee {
    pub format_version: u32,
    pub members: Vec<SerializedMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedMember {
    pub index: usize,
    /// `None` when the cost was not finite.
    pub final_cost: Option<f64>,
    pub network: SerializedNetwork,
}

impl From<&CommitteeResult> for SerializedCommittee {
    fn from(res: &CommitteeResult) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            members: res
                .members
                .iter()
                .map(|m| SerializedMember {
                    index: m.index,
                    final_cost: Some(m.final_cost).filter(|c| c.is_finite()),
                    network: SerializedNetwork::from(&m.network),
                })
                .collect(),
        }
    }
}

impl TryFrom<SerializedCommittee> for CommitteeResult {
    type Error = Error;

    fn try_from(value: SerializedCommittee) -> std::result::Result<Self, Self::Error> {
        if value.format_version != MODEL_FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported committee format_version {}; expected {}",
                value.format_version, MODEL_FORMAT_VERSION
            )));
        }
        let mut members = Vec::with_capacity(value.members.len());
        for m in value.members {
            let network = Network::try_from(m.network)
                .map_err(|e| Error::InvalidData(format!("member {} invalid: {e}", m.index)))?;
            members.push(CommitteeMember {
                index: m.index,
                network,
                final_cost: m.final_cost.unwrap_or(f64::INFINITY),
                report: None,
            });
        }
        Ok(CommitteeResult {
            members,
            failures: Vec::new(),
        })
    }
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    let s = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    s.map_err(|e| Error::Serialization(format!("failed to serialize: {e}")))
}

fn write_file(path: &Path, contents: String) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

impl Network {
    /// Serialize the network to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String> {
        to_json(&SerializedNetwork::from(self), true)
    }

    /// Serialize the network to a compact JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        to_json(&SerializedNetwork::from(self), false)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let ser: SerializedNetwork = serde_json::from_str(s)
            .map_err(|e| Error::Serialization(format!("failed to parse model json: {e}")))?;
        ser.try_into()
    }

    /// Save the network to a JSON file (pretty-printed).
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_file(path.as_ref(), self.to_json_string_pretty()?)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }
}

impl CommitteeResult {
    /// Trained members only; failures and training reports are not saved.
    pub fn to_json_string(&self) -> Result<String> {
        to_json(&SerializedCommittee::from(self), false)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let ser: SerializedCommittee = serde_json::from_str(s)
            .map_err(|e| Error::Serialization(format!("failed to parse committee json: {e}")))?;
        ser.try_into()
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_file(path.as_ref(), to_json(&SerializedCommittee::from(self), true)?)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }
}
