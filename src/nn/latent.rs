//! Latent distribution strategies.
//!
//! The encoder produces a `mean` and a `log_scale` per node and latent dimension, and a
//! [`LatentDistribution`] turns them into one stochastic draw. Sampling is
//! reparameterized, `z = mean + scale * eps`, so gradients reach both branches while
//! the randomness lives entirely in `eps`.

use std::sync::Mutex;

use candle_core::Tensor;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    error::KgVaeError,
    math::tensors::{all_finite, softplus, NORM_EPS},
};

/// How the log-scale branch output becomes a strictly positive scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalePolicy {
    /// `scale = exp(log_scale)`.
    #[default]
    Exp,
    /// `scale = ln(1 + exp(log_scale))`.
    Softplus,
    /// The raw branch output used as the scale, floored at `min`.
    Clamp { min: f64 },
}

impl ScalePolicy {
    pub fn validate(&self) -> Result<(), KgVaeError> {
        match self {
            ScalePolicy::Clamp { min } if !(min.is_finite() && *min > 0.0) => {
                Err(KgVaeError::InvalidScaleFloor(*min))
            }
            _ => Ok(()),
        }
    }

    pub fn scale(&self, log_scale: &Tensor) -> Result<Tensor, KgVaeError> {
        let scale = match self {
            ScalePolicy::Exp => log_scale.exp()?,
            ScalePolicy::Softplus => softplus(log_scale)?,
            ScalePolicy::Clamp { min } => log_scale.maximum(*min)?,
        };
        Ok(scale)
    }

    /// `log(scale^2)` for the scale this policy produced from `log_scale`.
    ///
    /// `Exp` is computed in closed form so the log-variance stays finite after
    /// `scale^2` underflows. The other policies floor the variance at [`NORM_EPS`].
    pub fn log_variance(&self, log_scale: &Tensor, scale: &Tensor) -> Result<Tensor, KgVaeError> {
        let log_var = match self {
            ScalePolicy::Exp => (log_scale * 2.0)?,
            ScalePolicy::Softplus | ScalePolicy::Clamp { .. } => {
                scale.sqr()?.maximum(NORM_EPS)?.log()?
            }
        };
        Ok(log_var)
    }
}

/// A strategy for drawing the latent code from the encoder's distribution parameters.
pub trait LatentDistribution: Send + Sync {
    /// Maps the raw log-scale branch output to the distribution's scale.
    fn scale(&self, log_scale: &Tensor) -> Result<Tensor, KgVaeError>;

    /// Draws one sample per entry of `mean`.
    fn sample(&self, mean: &Tensor, scale: &Tensor) -> Result<Tensor, KgVaeError>;

    /// `log(scale^2)`, floored so an underflowing scale still yields a finite value.
    fn log_variance(&self, _log_scale: &Tensor, scale: &Tensor) -> Result<Tensor, KgVaeError> {
        Ok(scale.sqr()?.maximum(NORM_EPS)?.log()?)
    }
}

/// Diagonal Gaussian with reparameterized sampling.
pub struct GaussianLatent {
    policy: ScalePolicy,
    rng: Mutex<StdRng>,
}

impl GaussianLatent {
    pub fn new(policy: ScalePolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            policy,
            rng: Mutex::new(rng),
        }
    }

    /// Standard normal noise shaped like `like`.
    fn noise(&self, like: &Tensor) -> Result<Tensor, KgVaeError> {
        let count = like.elem_count();
        let values: Vec<f32> = {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (0..count).map(|_| rng.sample(StandardNormal)).collect()
        };
        Ok(Tensor::from_vec(values, like.dims(), like.device())?.to_dtype(like.dtype())?)
    }
}

impl LatentDistribution for GaussianLatent {
    fn scale(&self, log_scale: &Tensor) -> Result<Tensor, KgVaeError> {
        let scale = self.policy.scale(log_scale)?;
        if !all_finite(&scale)? {
            return Err(KgVaeError::NonFinite("latent scale"));
        }
        Ok(scale)
    }

    fn sample(&self, mean: &Tensor, scale: &Tensor) -> Result<Tensor, KgVaeError> {
        let eps = self.noise(mean)?;
        Ok((mean + scale.mul(&eps)?)?)
    }

    fn log_variance(&self, log_scale: &Tensor, scale: &Tensor) -> Result<Tensor, KgVaeError> {
        self.policy.log_variance(log_scale, scale)
    }
}

/// Closed-form `KL(N(mean, scale^2) || N(0, 1))`, summed over all entries.
///
/// # Arguments
/// * `mean` - distribution means.
/// * `scale` - standard deviations, shaped like `mean`.
/// * `log_var` - `log(scale^2)` as reported by the distribution that produced `scale`.
///
/// # Errors
/// [`KgVaeError::NonFinite`] if the divergence overflows.
pub fn gaussian_kl(
    mean: &Tensor,
    scale: &Tensor,
    log_var: &Tensor,
) -> Result<Tensor, KgVaeError> {
    let var = scale.sqr()?;
    let per_entry = (((var + mean.sqr()?)? - log_var)? - 1.0)?;
    let kl = (per_entry.sum_all()? * 0.5)?;
    if !all_finite(&kl)? {
        return Err(KgVaeError::NonFinite("kl divergence"));
    }
    Ok(kl)
}
