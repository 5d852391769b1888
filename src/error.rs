//! Error types for the knowledge graph VAE.
//!
//! Configuration errors are fatal and surface at construction or graph-load time.
//! Tensor runtime failures are wrapped unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KgVaeError {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("relation id {relation} out of range for {num_rels} relations")]
    InvalidRelation { relation: usize, num_rels: usize },

    #[error("node id {node} out of range for {num_nodes} nodes")]
    InvalidNode { node: usize, num_nodes: usize },

    #[error("dimension mismatch in {context}: expected {expected}, got {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("decoder stage {stage} expects {expected} adjacency channels, got {found}")]
    ChannelMismatch {
        stage: usize,
        expected: usize,
        found: usize,
    },

    #[error("decoder stage {stage}: {reason}")]
    StageLayout { stage: usize, reason: &'static str },

    #[error("channel-mixing kernel width must be odd, got {0}")]
    InvalidKernel(usize),

    #[error("encoder needs exactly 2 output branches (mean, log-scale), got {0}")]
    OutputBranches(usize),

    #[error("dropout probability must lie in [0, 1), got {0}")]
    InvalidDropout(f64),

    #[error("scale floor must be positive and finite, got {0}")]
    InvalidScaleFloor(f64),

    #[error("`{0}` must be non-zero")]
    EmptyConfig(&'static str),

    #[error("non-finite values produced by {0}")]
    NonFinite(&'static str),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}
