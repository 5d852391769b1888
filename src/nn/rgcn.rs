//! Basis-decomposed relational graph convolution.
//!
//! Every node receives, along each incoming edge `e = (u -> v, r)`, the message
//! `norm(e) * h[u] W_r`, and adds its own self-loop term `h[v] W_self`. With basis
//! decomposition the per-relation matrices are never stored: `W_r = sum_b a[r, b] V_b`
//! over a small shared set of bases `V_b`, which bounds the parameter count when there
//! are many relation types.

use candle_core::Tensor;
use candle_nn::{Dropout, Init, VarBuilder};

use crate::{
    error::KgVaeError,
    math::{graph::EdgeTensors, tensors::expect_dim},
    nn::activate::Activations,
};

/// How the per-relation transforms are parameterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationWeighting {
    /// `num_bases` shared `in x out` matrices mixed by an `R x num_bases` coefficient matrix.
    Basis(usize),
    /// One dedicated `in x out` matrix per relation.
    PerRelation,
}

impl RelationWeighting {
    /// Basis sharing only pays off when there are fewer bases than relations.
    pub fn from_bases(num_bases: Option<usize>, num_rels: usize) -> Self {
        match num_bases {
            Some(b) if b > 0 && b < num_rels => RelationWeighting::Basis(b),
            _ => RelationWeighting::PerRelation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelGraphConvConfig {
    pub in_dim: usize,
    pub out_dim: usize,
    pub num_rels: usize,
    pub weighting: RelationWeighting,
    pub activation: Activations,
    pub self_loop: bool,
    pub dropout: f64,
}

enum RelationWeights {
    Basis { bases: Tensor, coefficients: Tensor },
    PerRelation(Tensor),
}

/// One relational message-passing layer. The encoder's hidden, mean and log-scale roles
/// are separate instances of this type with independent parameters.
pub struct RelGraphConv {
    in_dim: usize,
    out_dim: usize,
    num_rels: usize,
    weights: RelationWeights,
    loop_weight: Option<Tensor>,
    bias: Tensor,
    activation: Activations,
    dropout: Dropout,
}

impl RelGraphConv {
    /// Creates a relational convolution and registers its parameters under `vb`.
    ///
    /// Parameter names: `bases` and `coefficients` (basis mode) or `weight` (per-relation
    /// mode), plus `loop_weight` when the self-loop is enabled and `bias`.
    ///
    /// # Arguments
    /// * `config` - Widths, relation count, weighting mode, activation and dropout
    /// * `vb` - Builder the parameters are registered under
    ///
    /// # Returns
    /// The layer with glorot-initialized transforms and a zero bias
    pub fn new(config: &RelGraphConvConfig, vb: VarBuilder) -> Result<Self, KgVaeError> {
        let RelGraphConvConfig {
            in_dim,
            out_dim,
            num_rels,
            weighting,
            activation,
            self_loop,
            dropout,
        } = *config;
        if num_rels == 0 {
            return Err(KgVaeError::EmptyConfig("num_rels"));
        }
        let glorot = Init::Randn {
            mean: 0.0,
            stdev: (2.0 / (in_dim + out_dim) as f64).sqrt(),
        };
        let weights = match weighting {
            RelationWeighting::Basis(num_bases) => {
                if num_bases == 0 {
                    return Err(KgVaeError::EmptyConfig("num_bases"));
                }
                let bases = vb.get_with_hints((num_bases, in_dim, out_dim), "bases", glorot)?;
                let coefficients = vb.get_with_hints(
                    (num_rels, num_bases),
                    "coefficients",
                    Init::Randn {
                        mean: 0.0,
                        stdev: (1.0 / num_bases as f64).sqrt(),
                    },
                )?;
                RelationWeights::Basis {
                    bases,
                    coefficients,
                }
            }
            RelationWeighting::PerRelation => RelationWeights::PerRelation(vb.get_with_hints(
                (num_rels, in_dim, out_dim),
                "weight",
                glorot,
            )?),
        };
        let loop_weight = if self_loop {
            Some(vb.get_with_hints((in_dim, out_dim), "loop_weight", glorot)?)
        } else {
            None
        };
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self {
            in_dim,
            out_dim,
            num_rels,
            weights,
            loop_weight,
            bias,
            activation,
            dropout: Dropout::new(dropout as f32),
        })
    }

    /// The effective `R x in x out` transform of every relation.
    pub fn relation_weights(&self) -> Result<Tensor, KgVaeError> {
        match &self.weights {
            RelationWeights::Basis {
                bases,
                coefficients,
            } => {
                let num_bases = bases.dim(0)?;
                let flat = bases.reshape((num_bases, self.in_dim * self.out_dim))?;
                Ok(coefficients
                    .matmul(&flat)?
                    .reshape((self.num_rels, self.in_dim, self.out_dim))?)
            }
            RelationWeights::PerRelation(weight) => Ok(weight.clone()),
        }
    }

    pub fn loop_weight(&self) -> Option<&Tensor> {
        self.loop_weight.as_ref()
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Propagates node features one hop over the graph.
    ///
    /// Each node sums its normalized incoming messages and its own self-loop transform,
    /// then the bias and activation are applied. Dropout is applied only when `train`
    /// is set.
    ///
    /// # Arguments
    /// * `edges` - Tensor view of the graph
    /// * `h` - Node features, `N x in`
    /// * `train` - Whether dropout is active
    ///
    /// # Returns
    /// The updated `N x out` features
    pub fn forward(
        &self,
        edges: &EdgeTensors,
        h: &Tensor,
        train: bool,
    ) -> Result<Tensor, KgVaeError> {
        expect_dim(h, 0, edges.num_nodes, "relational conv node count")?;
        expect_dim(h, 1, self.in_dim, "relational conv input width")?;

        let mut out = if edges.is_empty() {
            Tensor::zeros((edges.num_nodes, self.out_dim), h.dtype(), h.device())?
        } else {
            let weights = self.relation_weights()?;
            let h_src = h.index_select(&edges.src, 0)?;
            let w_edge = weights.index_select(&edges.rel, 0)?;
            let messages = h_src
                .unsqueeze(1)?
                .matmul(&w_edge)?
                .squeeze(1)?
                .broadcast_mul(&edges.norm)?;
            Tensor::zeros((edges.num_nodes, self.out_dim), h.dtype(), h.device())?.index_add(
                &edges.dst,
                &messages,
                0,
            )?
        };

        if let Some(loop_weight) = &self.loop_weight {
            out = (out + h.matmul(loop_weight)?)?;
        }
        out = out.broadcast_add(&self.bias.unsqueeze(0)?)?;
        let out = self.activation.activate(out)?;
        Ok(self.dropout.forward(&out, train)?)
    }
}
