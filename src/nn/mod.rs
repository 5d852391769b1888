pub mod activate;
pub mod channel_mix;
pub mod decoder;
pub mod embed;
pub mod encoder;
pub mod latent;
pub mod refine_adj;
pub mod refine_feat;
pub mod rgcn;
