//! Elementwise activation functions applied at the end of a layer.

use candle_core::{Result as CandleResult, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activations {
    #[default]
    Identity,
    ReLU,
    Sigmoid,
    Tanh,
}

impl Activations {
    pub fn activate(&self, xs: Tensor) -> CandleResult<Tensor> {
        match self {
            Activations::Identity => Ok(xs),
            Activations::ReLU => xs.relu(),
            Activations::Sigmoid => candle_nn::ops::sigmoid(&xs),
            Activations::Tanh => xs.tanh(),
        }
    }
}
