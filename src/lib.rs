//! Variational autoencoder over a multi-relational knowledge graph.
//!
//! The encoder learns a per-node latent code with basis-decomposed relational graph
//! convolutions and a reparameterized Gaussian draw. The decoder turns that code back
//! into one soft adjacency matrix per relation type by alternating latent-feature and
//! relation-adjacency refinement while growing the adjacency's channel count.
//!
//! `encode` and `decode` are separate entry points: a training loop typically needs
//! the encoder's distribution parameters as well as the decoder's reconstruction, and
//! the encoder's hidden state is handed to the decoder explicitly through [`Encoding`].
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::{info, warn};

use crate::{
    math::graph::RelationalGraph,
    nn::{
        decoder::{Decoder, StageSpec},
        encoder::Encoder,
        latent::LatentDistribution,
    },
};

pub mod config;
pub mod error;
pub mod math;
pub mod nn;

pub use config::KgVaeConfig;
pub use error::KgVaeError;
pub use nn::encoder::Encoding;

/// High level trait for any module that has parameters that can be optimized.
///
/// The optimizer itself lives outside this crate; it only needs the `Var`s.
pub trait Parameterized {
    /// Returns a Vec of every Var (learnable parameter) this module owns.
    fn parameters(&self) -> Vec<Var>;
}

/// The knowledge graph VAE.
///
/// Weights are only read during a forward pass, so one model can serve several
/// independent encode/decode passes.
pub struct KgVae {
    config: KgVaeConfig,
    device: Device,
    varmap: VarMap,
    encoder: Encoder,
    decoder: Decoder,
}

impl KgVae {
    /// Builds the model with the default four-stage decoder.
    ///
    /// # Errors
    /// Any configuration error is reported before parameters are allocated.
    pub fn new(config: KgVaeConfig) -> Result<Self, KgVaeError> {
        let stages = StageSpec::default_pipeline(config.effective_bases(), config.num_rels);
        Self::with_stages(config, stages)
    }

    /// Builds the model with a custom decoder stage list, which must end in
    /// `num_rels` channels.
    pub fn with_stages(config: KgVaeConfig, stages: Vec<StageSpec>) -> Result<Self, KgVaeError> {
        config.validate()?;
        nn::decoder::validate_stages(&stages, config.num_rels)?;
        let device = config.device()?;
        if !config.use_self_loop {
            warn!("use_self_loop = false is ignored: encoder layers always apply the self-loop");
        }
        info!(
            "building kg-vae: {} nodes, {} relations, h_dim {}, out_dim {}, bases {:?}, {} decoder stages on {:?}",
            config.num_nodes,
            config.num_rels,
            config.h_dim,
            config.out_dim,
            config.bases(),
            stages.len(),
            device
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&config, vb.pp("encoder"))?;
        let decoder = Decoder::new(
            stages,
            config.out_dim,
            config.h_dim,
            config.num_rels,
            vb.pp("decoder"),
        )?;
        Ok(Self {
            config,
            device,
            varmap,
            encoder,
            decoder,
        })
    }

    /// Encodes `graph` in evaluation mode (no dropout).
    ///
    /// `node_ids` is a `u32` vector with one embedding row per graph node.
    pub fn encode(
        &self,
        graph: &RelationalGraph,
        node_ids: &Tensor,
    ) -> Result<Encoding, KgVaeError> {
        self.encoder.forward(graph, node_ids, false)
    }

    /// Encodes `graph`, applying dropout when `train` is set.
    pub fn encode_t(
        &self,
        graph: &RelationalGraph,
        node_ids: &Tensor,
        train: bool,
    ) -> Result<Encoding, KgVaeError> {
        self.encoder.forward(graph, node_ids, train)
    }

    /// Same as [`KgVae::encode`]; decoding is left to the caller.
    pub fn forward(
        &self,
        graph: &RelationalGraph,
        node_ids: &Tensor,
    ) -> Result<Encoding, KgVaeError> {
        self.encode(graph, node_ids)
    }

    /// Reconstructs the `num_rels x N x N` adjacency from a latent sample and the
    /// encoder hidden state of the same pass.
    pub fn decode(&self, z: &Tensor, hidden: &Tensor) -> Result<Tensor, KgVaeError> {
        self.decoder.forward(z, hidden)
    }

    /// Node ids `0..num_nodes` on the model's device.
    pub fn all_node_ids(&self) -> Result<Tensor, KgVaeError> {
        Ok(Tensor::arange(0u32, self.config.num_nodes as u32, &self.device)?)
    }

    /// Replaces the latent distribution strategy.
    pub fn set_distribution(&mut self, distribution: Box<dyn LatentDistribution>) {
        self.encoder.set_distribution(distribution);
    }

    pub fn config(&self) -> &KgVaeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }
}

impl Parameterized for KgVae {
    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}
