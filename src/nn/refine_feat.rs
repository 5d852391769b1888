//! Latent-feature refinement: adjacency-weighted aggregation fused with the current
//! features and an optional skip source.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use crate::{
    error::KgVaeError,
    math::tensors::expect_dim,
    nn::activate::Activations,
};

#[derive(Debug, Clone, Copy)]
pub struct RefineFeatConfig {
    /// Adjacency channels consumed.
    pub channels: usize,
    pub in_dim: usize,
    pub out_dim: usize,
    /// Width of the skip source, when the layer takes one.
    pub skip_dim: Option<usize>,
    pub activation: Activations,
}

/// Each adjacency channel aggregates the latent features as a separate view
/// (`A_c z`); the views are concatenated and projected back to `out_dim`, then fused
/// with `z` and the skip source by a second projection.
pub struct RefineLatentFeat {
    channel_proj: Linear,
    fuse: Linear,
    config: RefineFeatConfig,
}

impl RefineLatentFeat {
    /// Creates a feature refinement layer.
    ///
    /// # Arguments
    /// * `config` - Channel count, feature widths and the optional skip width
    /// * `vb` - Builder the `channel_proj` and `fuse` projections are registered under
    ///
    /// # Returns
    /// The layer with freshly initialized projections
    pub fn new(config: &RefineFeatConfig, vb: VarBuilder) -> Result<Self, KgVaeError> {
        if config.channels == 0 {
            return Err(KgVaeError::EmptyConfig("adjacency channels"));
        }
        let channel_proj = candle_nn::linear(
            config.channels * config.in_dim,
            config.out_dim,
            vb.pp("channel_proj"),
        )?;
        let fused_dim = config.out_dim + config.in_dim + config.skip_dim.unwrap_or(0);
        let fuse = candle_nn::linear(fused_dim, config.out_dim, vb.pp("fuse"))?;
        Ok(Self {
            channel_proj,
            fuse,
            config: *config,
        })
    }

    /// Refines the latent features against an adjacency stack.
    ///
    /// # Arguments
    /// * `adj` - The previous stage's `C x N x N` adjacency
    /// * `z` - Latent features, `N x in_dim`
    /// * `skip` - Extra `N x skip_dim` features, required exactly when the layer was
    ///   built with a skip width
    ///
    /// # Returns
    /// The refined `N x out_dim` features
    pub fn forward(
        &self,
        adj: &Tensor,
        z: &Tensor,
        skip: Option<&Tensor>,
    ) -> Result<Tensor, KgVaeError> {
        let RefineFeatConfig {
            channels, in_dim, ..
        } = self.config;
        let (c, n, n_cols) = adj.dims3()?;
        if c != channels {
            return Err(KgVaeError::DimensionMismatch {
                context: "feature refinement channels",
                expected: channels,
                found: c,
            });
        }
        expect_dim(z, 0, n, "feature refinement node count")?;
        expect_dim(z, 0, n_cols, "feature refinement node count")?;
        expect_dim(z, 1, in_dim, "feature refinement width")?;

        let z_views = z.unsqueeze(0)?.broadcast_as((c, n, in_dim))?.contiguous()?;
        let aggregated = adj
            .contiguous()?
            .matmul(&z_views)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((n, c * in_dim))?;
        let aggregated = self.channel_proj.forward(&aggregated)?;

        let mut parts = vec![aggregated, z.clone()];
        match (skip, self.config.skip_dim) {
            (Some(x), Some(skip_dim)) => {
                expect_dim(x, 0, n, "skip source node count")?;
                expect_dim(x, 1, skip_dim, "skip source width")?;
                parts.push(x.clone());
            }
            (None, None) => {}
            (Some(x), None) => {
                return Err(KgVaeError::DimensionMismatch {
                    context: "unexpected skip source",
                    expected: 0,
                    found: x.dim(1)?,
                });
            }
            (None, Some(skip_dim)) => {
                return Err(KgVaeError::DimensionMismatch {
                    context: "missing skip source",
                    expected: skip_dim,
                    found: 0,
                });
            }
        }
        let fused = self.fuse.forward(&Tensor::cat(&parts, 1)?)?;
        Ok(self.config.activation.activate(fused)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::tensors::max_abs_diff;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(skip_dim: Option<usize>) -> Result<(VarMap, RefineLatentFeat), KgVaeError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = RefineFeatConfig {
            channels: 2,
            in_dim: 4,
            out_dim: 3,
            skip_dim,
            activation: Activations::Tanh,
        };
        Ok((varmap, RefineLatentFeat::new(&config, vb)?))
    }

    #[test]
    fn test_output_shape_with_and_without_skip() -> Result<(), KgVaeError> {
        let adj = Tensor::rand(0f32, 1., (2, 5, 5), &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1., (5, 4), &Device::Cpu)?;

        let (_vm, plain) = layer(None)?;
        assert_eq!(plain.forward(&adj, &z, None)?.dims(), &[5, 3]);

        let (_vm, with_skip) = layer(Some(6))?;
        let x = Tensor::randn(0f32, 1., (5, 6), &Device::Cpu)?;
        assert_eq!(with_skip.forward(&adj, &z, Some(&x))?.dims(), &[5, 3]);
        Ok(())
    }

    #[test]
    fn test_skip_source_must_match_layout() -> Result<(), KgVaeError> {
        let adj = Tensor::rand(0f32, 1., (2, 5, 5), &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1., (5, 4), &Device::Cpu)?;
        let x = Tensor::randn(0f32, 1., (5, 6), &Device::Cpu)?;

        let (_vm, plain) = layer(None)?;
        assert!(matches!(
            plain.forward(&adj, &z, Some(&x)),
            Err(KgVaeError::DimensionMismatch {
                context: "unexpected skip source",
                ..
            })
        ));

        let (_vm, with_skip) = layer(Some(6))?;
        assert!(matches!(
            with_skip.forward(&adj, &z, None),
            Err(KgVaeError::DimensionMismatch {
                context: "missing skip source",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_channel_count() -> Result<(), KgVaeError> {
        let (_vm, plain) = layer(None)?;
        let adj = Tensor::rand(0f32, 1., (3, 5, 5), &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1., (5, 4), &Device::Cpu)?;
        assert!(matches!(
            plain.forward(&adj, &z, None),
            Err(KgVaeError::DimensionMismatch {
                expected: 2,
                found: 3,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_empty_adjacency_keeps_nodes_independent() -> Result<(), KgVaeError> {
        let (_vm, plain) = layer(None)?;
        let adj = Tensor::zeros((2, 3, 3), DType::F32, &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1., (3, 4), &Device::Cpu)?;
        let moved = Tensor::cat(&[z.narrow(0, 0, 2)?, (z.narrow(0, 2, 1)? * 3.0)?], 0)?;

        let a = plain.forward(&adj, &z, None)?;
        let b = plain.forward(&adj, &moved, None)?;
        assert_eq!(max_abs_diff(&a.narrow(0, 0, 2)?, &b.narrow(0, 0, 2)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_neighbours_reach_through_adjacency() -> Result<(), KgVaeError> {
        let (_vm, plain) = layer(None)?;
        let adj = Tensor::ones((2, 3, 3), DType::F32, &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1., (3, 4), &Device::Cpu)?;
        let moved = Tensor::cat(&[z.narrow(0, 0, 2)?, (z.narrow(0, 2, 1)? + 1.0)?], 0)?;

        let a = plain.forward(&adj, &z, None)?;
        let b = plain.forward(&adj, &moved, None)?;
        assert!(max_abs_diff(&a.narrow(0, 0, 1)?, &b.narrow(0, 0, 1)?)? > 0.0);
        Ok(())
    }
}
