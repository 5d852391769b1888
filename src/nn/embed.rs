//! Learned per-node input representation.

use candle_core::{DType, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use crate::error::KgVaeError;

/// A `num_nodes x dim` lookup table, the encoder's input layer.
pub struct NodeEmbedding {
    table: Embedding,
    num_nodes: usize,
}

impl NodeEmbedding {
    /// Registers the table as `weight` under `vb`.
    pub fn new(num_nodes: usize, dim: usize, vb: VarBuilder) -> Result<Self, KgVaeError> {
        Ok(Self {
            table: candle_nn::embedding(num_nodes, dim, vb)?,
            num_nodes,
        })
    }

    /// Looks up the rows for `node_ids` (a `u32` vector).
    pub fn forward(&self, node_ids: &Tensor) -> Result<Tensor, KgVaeError> {
        if node_ids.elem_count() > 0 {
            let max = node_ids
                .to_dtype(DType::U32)?
                .max(0)?
                .to_scalar::<u32>()? as usize;
            if max >= self.num_nodes {
                return Err(KgVaeError::InvalidNode {
                    node: max,
                    num_nodes: self.num_nodes,
                });
            }
        }
        Ok(self.table.forward(node_ids)?)
    }

    pub fn embeddings(&self) -> &Tensor {
        self.table.embeddings()
    }
}
