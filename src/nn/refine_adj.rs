//! Relation-adjacency refinement: latent node features to a soft, multi-channel adjacency.
//!
//! Channel `c` scores the ordered pair `(i, j)` with a diagonal bilinear form,
//! `s_c(i, j) = sum_k z[i, k] d[c, k] z[j, k]`, then applies the activation, optional row
//! normalization and optional non-negativity projection. With a single channel and
//! `d = 1` this is the plain inner-product decoder.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::{
    error::KgVaeError,
    math::tensors::{expect_dim, row_normalize},
    nn::activate::Activations,
};

#[derive(Debug, Clone, Copy)]
pub struct RefineAdjConfig {
    pub channels: usize,
    pub dim: usize,
    pub activation: Activations,
    /// Target row sum, if rows are normalized.
    pub normalize: Option<f64>,
    pub non_negative: bool,
}

pub struct RefineRelationAdj {
    relation_diag: Tensor,
    channels: usize,
    dim: usize,
    activation: Activations,
    normalize: Option<f64>,
    non_negative: bool,
}

impl RefineRelationAdj {
    /// Registers one `dim`-wide diagonal per channel, initialized to ones.
    pub fn new(config: &RefineAdjConfig, vb: VarBuilder) -> Result<Self, KgVaeError> {
        if config.channels == 0 {
            return Err(KgVaeError::EmptyConfig("adjacency channels"));
        }
        let relation_diag = vb.get_with_hints(
            (config.channels, config.dim),
            "relation_diag",
            Init::Const(1.0),
        )?;
        Ok(Self {
            relation_diag,
            channels: config.channels,
            dim: config.dim,
            activation: config.activation,
            normalize: config.normalize,
            non_negative: config.non_negative,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Scores every ordered node pair of `z` (`N x dim`), returning `C x N x N`.
    pub fn forward(&self, z: &Tensor) -> Result<Tensor, KgVaeError> {
        expect_dim(z, 1, self.dim, "adjacency refinement width")?;
        let n = z.dim(0)?;

        let scaled = z
            .unsqueeze(0)?
            .broadcast_mul(&self.relation_diag.unsqueeze(1)?)?;
        let z_t = z
            .t()?
            .unsqueeze(0)?
            .broadcast_as((self.channels, self.dim, n))?
            .contiguous()?;
        let scores = scaled.contiguous()?.matmul(&z_t)?;

        let mut adj = self.activation.activate(scores)?;
        if let Some(target) = self.normalize {
            adj = row_normalize(&adj, target)?;
        }
        if self.non_negative {
            adj = adj.relu()?;
        }
        Ok(adj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::tensors::max_abs_diff;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn refine(config: RefineAdjConfig) -> Result<(VarMap, RefineRelationAdj), KgVaeError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = RefineRelationAdj::new(&config, vb)?;
        Ok((varmap, layer))
    }

    #[test]
    fn test_rows_sum_to_target() -> Result<(), KgVaeError> {
        let (_vm, layer) = refine(RefineAdjConfig {
            channels: 3,
            dim: 5,
            activation: Activations::Sigmoid,
            normalize: Some(1.0),
            non_negative: false,
        })?;
        for n in [1usize, 2, 7] {
            let z = Tensor::randn(0f32, 2., (n, 5), &Device::Cpu)?;
            let adj = layer.forward(&z)?;
            assert_eq!(adj.dims(), &[3, n, n]);
            for channel in adj.to_vec3::<f32>()? {
                for row in channel {
                    let sum: f32 = row.iter().sum();
                    assert!((sum - 1.0).abs() < 1e-5, "row sum {sum} for n = {n}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_non_negative_for_negative_latents() -> Result<(), KgVaeError> {
        // identity activation lets negative scores through until the projection
        let (_vm, layer) = refine(RefineAdjConfig {
            channels: 2,
            dim: 4,
            activation: Activations::Identity,
            normalize: None,
            non_negative: true,
        })?;
        let z = Tensor::randn(0f32, 1., (6, 4), &Device::Cpu)?;
        let flipped = Tensor::cat(&[z.narrow(0, 0, 3)?, z.narrow(0, 3, 3)?.neg()?], 0)?;
        let adj = layer.forward(&flipped)?;
        let min = adj.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }

    #[test]
    fn test_inner_product_scores() -> Result<(), KgVaeError> {
        let (_vm, layer) = refine(RefineAdjConfig {
            channels: 1,
            dim: 2,
            activation: Activations::Identity,
            normalize: None,
            non_negative: false,
        })?;
        let z = Tensor::from_slice(&[1f32, 2., -1., 0.5], (2, 2), &Device::Cpu)?;
        let adj = layer.forward(&z)?.to_vec3::<f32>()?;
        assert_eq!(adj[0], vec![vec![5., 0.], vec![0., 1.25]]);
        Ok(())
    }

    #[test]
    fn test_channels_use_their_own_diagonal() -> Result<(), KgVaeError> {
        let (mut varmap, layer) = refine(RefineAdjConfig {
            channels: 2,
            dim: 2,
            activation: Activations::Identity,
            normalize: None,
            non_negative: false,
        })?;
        varmap.set_one(
            "relation_diag",
            Tensor::from_slice(&[1f32, 0., 0., 2.], (2, 2), &Device::Cpu)?,
        )?;
        let z = Tensor::from_slice(&[1f32, 1., 2., 3.], (2, 2), &Device::Cpu)?;
        let adj = layer.forward(&z)?.to_vec3::<f32>()?;
        assert_eq!(adj[0], vec![vec![1., 2.], vec![2., 4.]]);
        assert_eq!(adj[1], vec![vec![2., 6.], vec![6., 18.]]);
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<(), KgVaeError> {
        let (_vm, layer) = refine(RefineAdjConfig {
            channels: 1,
            dim: 3,
            activation: Activations::Sigmoid,
            normalize: Some(1.0),
            non_negative: true,
        })?;
        let z = Tensor::randn(0f32, 1., (4, 3), &Device::Cpu)?;
        assert_eq!(max_abs_diff(&layer.forward(&z)?, &layer.forward(&z)?)?, 0.0);
        Ok(())
    }
}
