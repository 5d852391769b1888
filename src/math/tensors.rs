//! Small tensor utilities shared by the encoder and decoder operators.

use candle_core::{DType, Tensor, D};

use crate::error::KgVaeError;

/// Floor applied to normalization denominators.
pub const NORM_EPS: f64 = 1e-12;

/// Checks that `tensor` has `expected` entries along `dim`.
pub fn expect_dim(
    tensor: &Tensor,
    dim: usize,
    expected: usize,
    context: &'static str,
) -> Result<(), KgVaeError> {
    let found = tensor.dim(dim)?;
    if found != expected {
        return Err(KgVaeError::DimensionMismatch {
            context,
            expected,
            found,
        });
    }
    Ok(())
}

/// Rescales `tensor` so every slice along the last axis sums to `target`.
///
/// Denominators are floored at [`NORM_EPS`], so an all-zero row stays zero instead of
/// turning into NaN.
pub fn row_normalize(tensor: &Tensor, target: f64) -> Result<Tensor, KgVaeError> {
    let sums = tensor.sum_keepdim(D::Minus1)?.maximum(NORM_EPS)?;
    Ok((tensor.broadcast_div(&sums)? * target)?)
}

/// `ln(1 + e^x)`, computed as `max(x, 0) + ln(1 + e^-|x|)` to stay finite for large `x`.
pub fn softplus(tensor: &Tensor) -> Result<Tensor, KgVaeError> {
    let positive = tensor.relu()?;
    let tail = ((tensor.abs()?.neg()?.exp()? + 1.0)?).log()?;
    Ok((positive + tail)?)
}

/// True when every entry of `tensor` is finite.
pub fn all_finite(tensor: &Tensor) -> Result<bool, KgVaeError> {
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

/// Largest absolute elementwise difference, for comparing layer outputs in tests.
#[cfg(test)]
pub(crate) fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32, KgVaeError> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_expect_dim() -> Result<(), KgVaeError> {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        expect_dim(&t, 1, 3, "cols")?;
        let err = expect_dim(&t, 0, 3, "rows").unwrap_err();
        assert!(matches!(
            err,
            KgVaeError::DimensionMismatch {
                context: "rows",
                expected: 3,
                found: 2
            }
        ));
        Ok(())
    }

    #[test]
    fn test_row_normalize_sums_to_target() -> Result<(), KgVaeError> {
        let t = Tensor::from_slice(&[1f32, 3., 2., 2., 0.5, 0.5], (2, 3), &Device::Cpu)?;
        let normalized = row_normalize(&t, 2.0)?;
        let sums = normalized.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 2.0).abs() < 1e-6, "row sum {s}");
        }
        Ok(())
    }

    #[test]
    fn test_row_normalize_zero_row_stays_finite() -> Result<(), KgVaeError> {
        let t = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu)?;
        let normalized = row_normalize(&t, 1.0)?;
        assert!(all_finite(&normalized)?);
        assert_eq!(normalized.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_softplus_matches_reference() -> Result<(), KgVaeError> {
        let xs = [-30f32, -1., 0., 2., 80.];
        let t = Tensor::from_slice(&xs, 5, &Device::Cpu)?;
        let out = softplus(&t)?.to_vec1::<f32>()?;
        for (x, y) in xs.iter().zip(out.iter()) {
            let expected = if *x > 20.0 { *x } else { (1.0 + x.exp()).ln() };
            assert!((y - expected).abs() < 1e-4, "softplus({x}) = {y}");
        }
        Ok(())
    }

    #[test]
    fn test_all_finite_detects_inf() -> Result<(), KgVaeError> {
        let t = Tensor::from_slice(&[1f32, f32::INFINITY], 2, &Device::Cpu)?;
        assert!(!all_finite(&t)?);
        Ok(())
    }
}
