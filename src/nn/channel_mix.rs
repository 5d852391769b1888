//! 1-D convolution across the channel axis of an adjacency tensor.
//!
//! Each row of the `N x N` slices is a length-`N` sequence with `C_in` channels, so the
//! `C_in x N x N` tensor is run through the convolution as a batch of `N` rows and the
//! output restacked as `C_out x N x N`. Padding keeps the row length unchanged.

use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder};

use crate::{error::KgVaeError, math::tensors::expect_dim};

pub struct ChannelMix {
    conv: Conv1d,
    in_channels: usize,
    out_channels: usize,
}

impl ChannelMix {
    /// Creates a channel-mixing convolution.
    ///
    /// # Arguments
    /// * `in_channels` - Adjacency channels consumed
    /// * `out_channels` - Adjacency channels produced
    /// * `kernel_size` - Odd kernel width along each adjacency row, zero padded to keep `N`
    /// * `vb` - Builder the convolution's `weight` and `bias` are registered under
    ///
    /// # Returns
    /// The layer, or [`KgVaeError::InvalidKernel`] for an even kernel
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self, KgVaeError> {
        if kernel_size % 2 == 0 {
            return Err(KgVaeError::InvalidKernel(kernel_size));
        }
        if in_channels == 0 || out_channels == 0 {
            return Err(KgVaeError::EmptyConfig("adjacency channels"));
        }
        let config = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_channels, out_channels, kernel_size, config, vb)?;
        Ok(Self {
            conv,
            in_channels,
            out_channels,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Mixes channels position by position along each adjacency row.
    ///
    /// # Arguments
    /// * `adj` - A `C_in x N x N` adjacency stack
    ///
    /// # Returns
    /// The `C_out x N x N` mixed stack
    pub fn forward(&self, adj: &Tensor) -> Result<Tensor, KgVaeError> {
        expect_dim(adj, 0, self.in_channels, "channel mix input channels")?;
        let rows = adj.transpose(0, 1)?.contiguous()?;
        let mixed = self.conv.forward(&rows)?;
        Ok(mixed.transpose(0, 1)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_shapes_are_preserved() -> Result<(), KgVaeError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let expand = ChannelMix::new(1, 3, 1, vb.pp("expand"))?;
        let mix = ChannelMix::new(3, 2, 3, vb.pp("mix"))?;

        let adj = Tensor::rand(0f32, 1., (1, 5, 5), &Device::Cpu)?;
        let expanded = expand.forward(&adj)?;
        assert_eq!(expanded.dims(), &[3, 5, 5]);
        let mixed = mix.forward(&expanded)?;
        assert_eq!(mixed.dims(), &[2, 5, 5]);
        assert_eq!(mix.out_channels(), 2);
        Ok(())
    }

    #[test]
    fn test_unit_kernel_is_per_position() -> Result<(), KgVaeError> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let expand = ChannelMix::new(1, 2, 1, vb)?;
        varmap.set_one(
            "weight",
            Tensor::from_slice(&[2f32, -1.], (2, 1, 1), &Device::Cpu)?,
        )?;
        varmap.set_one("bias", Tensor::from_slice(&[0.5f32, 0.], 2, &Device::Cpu)?)?;

        let adj = Tensor::from_slice(&[1f32, 2., 3., 4.], (1, 2, 2), &Device::Cpu)?;
        let out = expand.forward(&adj)?.to_vec3::<f32>()?;
        assert_eq!(out[0], vec![vec![2.5, 4.5], vec![6.5, 8.5]]);
        assert_eq!(out[1], vec![vec![-1., -2.], vec![-3., -4.]]);
        Ok(())
    }

    #[test]
    fn test_wide_kernel_mixes_only_neighbouring_columns() -> Result<(), KgVaeError> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mix = ChannelMix::new(2, 1, 3, vb)?;
        varmap.set_one("bias", Tensor::zeros(1, DType::F32, &Device::Cpu)?)?;

        // single impulse at channel 0, row 1, column 3
        let mut data = vec![0f32; 2 * 4 * 6];
        data[6 + 3] = 1.0;
        let adj = Tensor::from_vec(data, (2, 4, 6), &Device::Cpu)?;
        let out = mix.forward(&adj)?.to_vec3::<f32>()?;
        for (row, values) in out[0].iter().enumerate() {
            for (col, v) in values.iter().enumerate() {
                if row != 1 || !(2..=4).contains(&col) {
                    assert_eq!(*v, 0.0, "leak at ({row}, {col})");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_even_kernel_and_wrong_channels() -> Result<(), KgVaeError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            ChannelMix::new(1, 2, 2, vb.pp("even")),
            Err(KgVaeError::InvalidKernel(2))
        ));
        let mix = ChannelMix::new(2, 2, 1, vb.pp("mix"))?;
        let adj = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(mix.forward(&adj).is_err());
        Ok(())
    }
}
