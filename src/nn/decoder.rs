//! Iterative structure/feature decoder.
//!
//! The decoder is an ordered list of stages. Every stage optionally refines the latent
//! features against the previous stage's adjacency, rescores the adjacency from the
//! refined features, and optionally changes its channel count with a channel-mixing
//! convolution. The stage list is plain data ([`StageSpec`]), checked for channel
//! consistency when the decoder is built.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use log::{debug, trace};

use crate::{
    error::KgVaeError,
    nn::{
        activate::Activations,
        channel_mix::ChannelMix,
        refine_adj::{RefineAdjConfig, RefineRelationAdj},
        refine_feat::{RefineFeatConfig, RefineLatentFeat},
    },
};

/// Extra input fused into a feature refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipSource {
    Absent,
    /// The encoder's last shared hidden state.
    EncoderHidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    /// Adjacency channels arriving from the previous stage.
    pub in_channels: usize,
    pub skip: SkipSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMixSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
}

/// Descriptor of one decoder stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    /// Feature refinement run before rescoring. The first stage has no adjacency to
    /// refine against and must leave this unset; every later stage must set it.
    pub refine_features: Option<FeatureSpec>,
    /// Channels produced by the adjacency rescoring.
    pub adj_channels: usize,
    pub channel_mix: Option<ChannelMixSpec>,
    /// Target row sum of the rescored adjacency.
    pub normalize: Option<f64>,
    pub non_negative: bool,
}

impl StageSpec {
    pub fn output_channels(&self) -> usize {
        self.channel_mix
            .map_or(self.adj_channels, |mix| mix.out_channels)
    }

    /// The four-stage pipeline growing the adjacency from one channel to `num_bases`
    /// and then `num_rels` channels. The encoder hidden state enters at the third stage
    /// and only the last stage is projected to be non-negative.
    pub fn default_pipeline(num_bases: usize, num_rels: usize) -> Vec<StageSpec> {
        vec![
            StageSpec {
                refine_features: None,
                adj_channels: 1,
                channel_mix: None,
                normalize: Some(1.0),
                non_negative: false,
            },
            StageSpec {
                refine_features: Some(FeatureSpec {
                    in_channels: 1,
                    skip: SkipSource::Absent,
                }),
                adj_channels: 1,
                channel_mix: Some(ChannelMixSpec {
                    in_channels: 1,
                    out_channels: num_bases,
                    kernel_size: 1,
                }),
                normalize: Some(1.0),
                non_negative: false,
            },
            StageSpec {
                refine_features: Some(FeatureSpec {
                    in_channels: num_bases,
                    skip: SkipSource::EncoderHidden,
                }),
                adj_channels: num_bases,
                channel_mix: Some(ChannelMixSpec {
                    in_channels: num_bases,
                    out_channels: num_rels,
                    kernel_size: 3,
                }),
                normalize: Some(1.0),
                non_negative: false,
            },
            StageSpec {
                refine_features: Some(FeatureSpec {
                    in_channels: num_rels,
                    skip: SkipSource::Absent,
                }),
                adj_channels: num_rels,
                channel_mix: None,
                normalize: Some(1.0),
                non_negative: true,
            },
        ]
    }
}

/// Checks stage ordering and that every stage consumes the channels its predecessor
/// produces.
pub fn validate_stages(specs: &[StageSpec], output_channels: usize) -> Result<(), KgVaeError> {
    let Some(last) = specs.last() else {
        return Err(KgVaeError::EmptyConfig("decoder stages"));
    };
    let mut previous: Option<usize> = None;
    for (stage, spec) in specs.iter().enumerate() {
        if spec.adj_channels == 0 {
            return Err(KgVaeError::EmptyConfig("adjacency channels"));
        }
        match (previous, spec.refine_features) {
            (None, Some(_)) => {
                return Err(KgVaeError::StageLayout {
                    stage,
                    reason: "first stage has no adjacency to refine features against",
                })
            }
            (Some(_), None) => {
                return Err(KgVaeError::StageLayout {
                    stage,
                    reason: "later stages must refine features",
                })
            }
            (Some(found), Some(features)) if features.in_channels != found => {
                return Err(KgVaeError::ChannelMismatch {
                    stage,
                    expected: features.in_channels,
                    found,
                })
            }
            _ => {}
        }
        if let Some(mix) = spec.channel_mix {
            if mix.in_channels != spec.adj_channels {
                return Err(KgVaeError::ChannelMismatch {
                    stage,
                    expected: mix.in_channels,
                    found: spec.adj_channels,
                });
            }
        }
        previous = Some(spec.output_channels());
    }
    if last.output_channels() != output_channels {
        return Err(KgVaeError::ChannelMismatch {
            stage: specs.len() - 1,
            expected: output_channels,
            found: last.output_channels(),
        });
    }
    Ok(())
}

/// One instantiated stage.
pub struct DecoderStage {
    refine_features: Option<(RefineLatentFeat, SkipSource)>,
    refine_adj: RefineRelationAdj,
    channel_mix: Option<ChannelMix>,
}

impl DecoderStage {
    fn new(
        spec: &StageSpec,
        latent_dim: usize,
        hidden_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self, KgVaeError> {
        let refine_features = spec
            .refine_features
            .map(|features| -> Result<_, KgVaeError> {
                let skip_dim = match features.skip {
                    SkipSource::Absent => None,
                    SkipSource::EncoderHidden => Some(hidden_dim),
                };
                let config = RefineFeatConfig {
                    channels: features.in_channels,
                    in_dim: latent_dim,
                    out_dim: latent_dim,
                    skip_dim,
                    activation: Activations::Tanh,
                };
                Ok((
                    RefineLatentFeat::new(&config, vb.pp("refine_features"))?,
                    features.skip,
                ))
            })
            .transpose()?;
        let refine_adj = RefineRelationAdj::new(
            &RefineAdjConfig {
                channels: spec.adj_channels,
                dim: latent_dim,
                activation: Activations::Sigmoid,
                normalize: spec.normalize,
                non_negative: spec.non_negative,
            },
            vb.pp("refine_adj"),
        )?;
        let channel_mix = spec
            .channel_mix
            .map(|mix| {
                ChannelMix::new(
                    mix.in_channels,
                    mix.out_channels,
                    mix.kernel_size,
                    vb.pp("channel_mix"),
                )
            })
            .transpose()?;
        Ok(Self {
            refine_features,
            refine_adj,
            channel_mix,
        })
    }

    /// Runs the stage. `adj` is the previous stage's output (`None` for the first
    /// stage). Returns the refined features and this stage's adjacency.
    pub fn forward(
        &self,
        adj: Option<&Tensor>,
        z: &Tensor,
        hidden: &Tensor,
    ) -> Result<(Tensor, Tensor), KgVaeError> {
        let z = match (&self.refine_features, adj) {
            (Some((refine, skip)), Some(adj)) => {
                let skip = match skip {
                    SkipSource::Absent => None,
                    SkipSource::EncoderHidden => Some(hidden),
                };
                refine.forward(adj, z, skip)?
            }
            (None, _) => z.clone(),
            (Some(_), None) => return Err(KgVaeError::EmptyConfig("previous adjacency")),
        };
        let mut adj = self.refine_adj.forward(&z)?;
        if let Some(mix) = &self.channel_mix {
            adj = mix.forward(&adj)?;
        }
        Ok((z, adj))
    }
}

pub struct Decoder {
    specs: Vec<StageSpec>,
    stages: Vec<DecoderStage>,
}

impl Decoder {
    /// Builds a decoder from its stage descriptors.
    ///
    /// # Arguments
    /// * `specs` - Stage descriptors, checked with [`validate_stages`]
    /// * `latent_dim` - Width of the latent features
    /// * `hidden_dim` - Width of the encoder hidden state used as a skip source
    /// * `output_channels` - Channels the last stage must produce
    /// * `vb` - Builder each stage is registered under as `stage_{i}`
    ///
    /// # Returns
    /// The decoder, or a layout error if the stages do not chain
    pub fn new(
        specs: Vec<StageSpec>,
        latent_dim: usize,
        hidden_dim: usize,
        output_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self, KgVaeError> {
        validate_stages(&specs, output_channels)?;
        let stages = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                DecoderStage::new(spec, latent_dim, hidden_dim, vb.pp(format!("stage_{i}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specs, stages })
    }

    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    pub fn stage(&self, idx: usize) -> Option<&DecoderStage> {
        self.stages.get(idx)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Runs every stage in order.
    ///
    /// # Arguments
    /// * `z` - Latent sample, `N x latent_dim`
    /// * `hidden` - Encoder hidden state of the same pass, `N x hidden_dim`
    ///
    /// # Returns
    /// The last stage's `output_channels x N x N` adjacency
    pub fn forward(&self, z: &Tensor, hidden: &Tensor) -> Result<Tensor, KgVaeError> {
        let mut z = z.clone();
        let mut adj: Option<Tensor> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            let (next_z, next_adj) = stage.forward(adj.as_ref(), &z, hidden)?;
            trace!("decoder stage {i}: adjacency {:?}", next_adj.dims());
            z = next_z;
            adj = Some(next_adj);
        }
        let adj = adj.ok_or(KgVaeError::EmptyConfig("decoder stages"))?;
        debug!("decoded adjacency {:?}", adj.dims());
        Ok(adj)
    }
}
