//! Relational encoder: embedding, shared hidden propagation, and the two latent branches.
//!
//! `Embed -> SharedHidden x num_hidden_layers -> {Mean, LogScale} -> Sample`. The last
//! shared hidden state is returned alongside the sample so the decoder can reuse it as
//! a skip source without the encoder holding on to it.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use log::{debug, trace};

use crate::{
    config::KgVaeConfig,
    error::KgVaeError,
    math::{graph::RelationalGraph, tensors::expect_dim},
    nn::{
        activate::Activations,
        embed::NodeEmbedding,
        latent::{gaussian_kl, GaussianLatent, LatentDistribution},
        rgcn::{RelGraphConv, RelGraphConvConfig, RelationWeighting},
    },
};

/// Everything one encoder pass produces.
#[derive(Debug, Clone)]
pub struct Encoding {
    /// The latent sample, `N x out_dim`.
    pub z: Tensor,
    pub mean: Tensor,
    /// Raw log-scale branch output.
    pub log_scale: Tensor,
    /// `log_scale` after the distribution's scale policy.
    pub scale: Tensor,
    /// `log(scale^2)` as computed by the distribution, finite even when `scale` underflows.
    pub log_var: Tensor,
    /// Output of the last shared hidden layer, `N x h_dim`.
    pub hidden: Tensor,
}

impl Encoding {
    /// KL divergence of the encoded distribution from the standard normal prior.
    pub fn kl_divergence(&self) -> Result<Tensor, KgVaeError> {
        gaussian_kl(&self.mean, &self.scale, &self.log_var)
    }
}

pub struct Encoder {
    embedding: NodeEmbedding,
    hidden: Vec<RelGraphConv>,
    mean_branch: RelGraphConv,
    log_scale_branch: RelGraphConv,
    distribution: Box<dyn LatentDistribution>,
    num_rels: usize,
}

impl Encoder {
    /// Builds the encoder from the model configuration.
    ///
    /// # Arguments
    /// * `config` - Model configuration; only two output branches are accepted
    /// * `vb` - Builder the `embedding`, `hidden_{i}`, `mean` and `log_scale` layers are
    ///   registered under
    ///
    /// # Returns
    /// The encoder with a [`GaussianLatent`] distribution using the configured scale
    /// policy and seed
    pub fn new(config: &KgVaeConfig, vb: VarBuilder) -> Result<Self, KgVaeError> {
        if config.num_encoder_output_layers != 2 {
            return Err(KgVaeError::OutputBranches(config.num_encoder_output_layers));
        }
        let weighting = RelationWeighting::from_bases(config.bases(), config.num_rels);
        let hidden_config = RelGraphConvConfig {
            in_dim: config.h_dim,
            out_dim: config.h_dim,
            num_rels: config.num_rels,
            weighting,
            activation: Activations::ReLU,
            self_loop: true,
            dropout: config.dropout,
        };
        let branch_config = RelGraphConvConfig {
            out_dim: config.out_dim,
            activation: Activations::Identity,
            ..hidden_config
        };

        let embedding = NodeEmbedding::new(config.num_nodes, config.h_dim, vb.pp("embedding"))?;
        let hidden = (0..config.num_hidden_layers)
            .map(|i| RelGraphConv::new(&hidden_config, vb.pp(format!("hidden_{i}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let mean_branch = RelGraphConv::new(&branch_config, vb.pp("mean"))?;
        let log_scale_branch = RelGraphConv::new(&branch_config, vb.pp("log_scale"))?;

        Ok(Self {
            embedding,
            hidden,
            mean_branch,
            log_scale_branch,
            distribution: Box::new(GaussianLatent::new(config.scale_policy, config.seed)),
            num_rels: config.num_rels,
        })
    }

    /// Swaps the latent distribution strategy.
    pub fn set_distribution(&mut self, distribution: Box<dyn LatentDistribution>) {
        self.distribution = distribution;
    }

    /// Runs one encoder pass.
    ///
    /// # Arguments
    /// * `graph` - The relational graph, with the relation count the encoder was built for
    /// * `node_ids` - `u32` ids, one per graph node, in graph order
    /// * `train` - Whether dropout is active
    ///
    /// # Returns
    /// The latent sample together with its distribution parameters and the last shared
    /// hidden state
    pub fn forward(
        &self,
        graph: &RelationalGraph,
        node_ids: &Tensor,
        train: bool,
    ) -> Result<Encoding, KgVaeError> {
        if graph.num_rels() != self.num_rels {
            return Err(KgVaeError::DimensionMismatch {
                context: "graph relation count",
                expected: self.num_rels,
                found: graph.num_rels(),
            });
        }
        expect_dim(node_ids, 0, graph.num_nodes(), "node id count")?;

        let mut h = self.embedding.forward(node_ids)?;
        let edges = graph.to_tensors(h.device(), h.dtype())?;
        trace!("embedded {} nodes, {} edges", edges.num_nodes, edges.num_edges);

        for (i, layer) in self.hidden.iter().enumerate() {
            h = layer.forward(&edges, &h, train)?;
            trace!("hidden layer {i}: {:?}", h.dims());
        }

        let mean = self.mean_branch.forward(&edges, &h, train)?;
        let log_scale = self.log_scale_branch.forward(&edges, &h, train)?;
        let scale = self.distribution.scale(&log_scale)?;
        let log_var = self.distribution.log_variance(&log_scale, &scale)?;
        let z = self.distribution.sample(&mean, &scale)?;
        debug!("encoded latent sample {:?}", z.dims());

        Ok(Encoding {
            z,
            mean,
            log_scale,
            scale,
            log_var,
            hidden: h,
        })
    }
}
