//! Construction-time configuration for [`KgVae`](crate::KgVae).
//!
//! Every field maps onto one constructor argument of the model. The configuration is
//! validated in full before any parameter is allocated, so a bad value never reaches a
//! forward pass.

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{error::KgVaeError, nn::latent::ScalePolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgVaeConfig {
    /// Number of rows in the node embedding table.
    pub num_nodes: usize,
    /// Width of the embedding and of the shared hidden layers.
    pub h_dim: usize,
    /// Width of the latent code produced by the mean and log-scale branches.
    pub out_dim: usize,
    /// Number of relation types in the graph.
    pub num_rels: usize,
    /// Number of shared basis matrices. Negative means unset: every relation then owns
    /// a dedicated weight matrix and the decoder grows to `num_rels` channels directly.
    #[serde(default = "default_num_bases")]
    pub num_bases: i64,
    #[serde(default = "default_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default = "default_output_layers")]
    pub num_encoder_output_layers: usize,
    /// Kept for interface parity. Encoder layers always carry a self-loop transform, so
    /// setting this to `false` only logs a warning.
    #[serde(default = "default_self_loop")]
    pub use_self_loop: bool,
    /// Run on the first CUDA device when one is available.
    #[serde(default)]
    pub use_accelerator: bool,
    #[serde(default)]
    pub scale_policy: ScalePolicy,
    /// Seed for the latent noise source. `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_num_bases() -> i64 {
    -1
}

fn default_self_loop() -> bool {
    true
}

fn default_hidden_layers() -> usize {
    1
}

fn default_output_layers() -> usize {
    2
}

impl KgVaeConfig {
    /// Creates a configuration with the required sizes and defaults everywhere else.
    pub fn new(num_nodes: usize, h_dim: usize, out_dim: usize, num_rels: usize) -> Self {
        Self {
            num_nodes,
            h_dim,
            out_dim,
            num_rels,
            num_bases: default_num_bases(),
            num_hidden_layers: default_hidden_layers(),
            dropout: 0.0,
            num_encoder_output_layers: default_output_layers(),
            use_self_loop: default_self_loop(),
            use_accelerator: false,
            scale_policy: ScalePolicy::default(),
            seed: None,
        }
    }

    pub fn with_bases(mut self, num_bases: i64) -> Self {
        self.num_bases = num_bases;
        self
    }

    pub fn with_hidden_layers(mut self, num_hidden_layers: usize) -> Self {
        self.num_hidden_layers = num_hidden_layers;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_scale_policy(mut self, scale_policy: ScalePolicy) -> Self {
        self.scale_policy = scale_policy;
        self
    }

    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, KgVaeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, KgVaeError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// The configured basis count, or `None` when sharing is disabled.
    pub fn bases(&self) -> Option<usize> {
        if self.num_bases < 0 {
            None
        } else {
            Some(self.num_bases as usize)
        }
    }

    /// Channel count of the decoder's middle stage.
    pub fn effective_bases(&self) -> usize {
        self.bases().unwrap_or(self.num_rels)
    }

    /// Checks every configuration invariant.
    pub fn validate(&self) -> Result<(), KgVaeError> {
        if self.num_nodes == 0 {
            return Err(KgVaeError::EmptyConfig("num_nodes"));
        }
        if self.h_dim == 0 {
            return Err(KgVaeError::EmptyConfig("h_dim"));
        }
        if self.out_dim == 0 {
            return Err(KgVaeError::EmptyConfig("out_dim"));
        }
        if self.num_rels == 0 {
            return Err(KgVaeError::EmptyConfig("num_rels"));
        }
        if self.bases() == Some(0) {
            return Err(KgVaeError::EmptyConfig("num_bases"));
        }
        if self.num_encoder_output_layers != 2 {
            return Err(KgVaeError::OutputBranches(self.num_encoder_output_layers));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(KgVaeError::InvalidDropout(self.dropout));
        }
        self.scale_policy.validate()
    }

    /// Resolves the hardware-acceleration flag to a device.
    pub fn device(&self) -> Result<Device, KgVaeError> {
        if self.use_accelerator {
            Ok(Device::cuda_if_available(0)?)
        } else {
            Ok(Device::Cpu)
        }
    }
}
