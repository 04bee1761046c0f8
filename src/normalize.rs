// L2 row normalization and its adjoint.
//
// Both normalization stages of the filter objective go through here. The
// forward pass records (raw, normalized, norms) so the reverse pass can be
// applied stage by stage in the opposite order.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::{matrix_dims, FilterError};

/// Floor added under every square root (row norms and the smoothed absolute
/// value). Fixed: the backward pass relies on the exact forward norms.
pub const EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Forward
// ---------------------------------------------------------------------------

/// Scale each row of `matrix` to unit L2 norm.
///
/// Returns `(normalized, norms)` where `norms[i] = sqrt(sum_j m[i,j]^2 + 1e-8)`
/// is a rank-1 tensor with one entry per row.
pub fn normalize_rows(matrix: &Tensor) -> Result<(Tensor, Tensor)> {
    matrix_dims("matrix", matrix)?;
    let norms = (matrix.sqr()?.sum_keepdim(1)? + EPSILON)?.sqrt()?;
    let normalized = matrix.broadcast_div(&norms)?;
    Ok((normalized, norms.squeeze(1)?))
}

// ---------------------------------------------------------------------------
// Backward
// ---------------------------------------------------------------------------

/// Gradient of a loss w.r.t. the raw input of [`normalize_rows`].
///
/// `upstream` is dLoss/d`normalized`. Per row:
///   dX = D / N - Y * (D . X) / N^2
pub fn normalize_rows_backward(
    raw: &Tensor,
    normalized: &Tensor,
    norms: &Tensor,
    upstream: &Tensor,
) -> Result<Tensor> {
    let (rows, cols) = matrix_dims("raw", raw)?;
    for (name, t) in [("normalized", normalized), ("upstream", upstream)] {
        if matrix_dims(name, t)? != (rows, cols) {
            return Err(FilterError::ShapeMismatch(format!(
                "{name} is {:?}, raw is ({rows}, {cols})",
                t.dims()
            ))
            .into());
        }
    }
    if norms.dims() != [rows] {
        return Err(FilterError::ShapeMismatch(format!(
            "norms is {:?}, expected ({rows},)",
            norms.dims()
        ))
        .into());
    }

    let n = norms.unsqueeze(1)?;
    let proj = upstream.mul(raw)?.sum_keepdim(1)?;
    let scale = proj.broadcast_div(&n.sqr()?)?;
    let direct = upstream.broadcast_div(&n)?;
    direct.sub(&normalized.broadcast_mul(&scale)?).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Recorded stage
// ---------------------------------------------------------------------------

/// One normalization stage: the forward triple kept for backprop.
#[derive(Clone, Debug)]
pub struct RowNormalization {
    pub raw: Tensor,
    pub normalized: Tensor,
    pub norms: Tensor,
}

impl RowNormalization {
    pub fn forward(raw: Tensor) -> Result<Self> {
        let (normalized, norms) = normalize_rows(&raw)?;
        Ok(Self {
            raw,
            normalized,
            norms,
        })
    }

    /// Map dLoss/d`normalized` to dLoss/d`raw` using this stage's triple.
    pub fn backward(&self, upstream: &Tensor) -> Result<Tensor> {
        normalize_rows_backward(&self.raw, &self.normalized, &self.norms, upstream)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Result<Tensor> {
        let data: Vec<f64> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
    }

    #[test]
    fn test_rows_have_unit_norm() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let m = random_matrix(5, 9, &mut rng)?;
        let (normalized, norms) = normalize_rows(&m)?;

        assert_eq!(normalized.dims2()?, (5, 9));
        assert_eq!(norms.dims(), &[5]);
        let row_norms: Vec<f64> = normalized.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        for (i, n) in row_norms.iter().enumerate() {
            assert!((n - 1.0).abs() < 1e-6, "row {i} has norm {n}");
        }
        Ok(())
    }

    #[test]
    fn test_norms_include_floor() -> Result<()> {
        let m = Tensor::new(&[[3.0f64, 4.0], [0.0, 0.0]], &Device::Cpu)?;
        let (normalized, norms) = normalize_rows(&m)?;
        let norms: Vec<f64> = norms.to_vec1()?;

        assert!((norms[0] - (25.0f64 + 1e-8).sqrt()).abs() < 1e-15);
        assert!((norms[1] - 1e-4).abs() < 1e-15);

        // zero rows stay zero instead of dividing by zero
        let rows: Vec<Vec<f64>> = normalized.to_vec2()?;
        assert_eq!(rows[1], vec![0.0, 0.0]);
        assert!(rows[0].iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_rejects_non_matrix() -> Result<()> {
        let v = Tensor::zeros(6, DType::F64, &Device::Cpu)?;
        let err = normalize_rows(&v).unwrap_err();
        let err = err.downcast_ref::<FilterError>().expect("typed error");
        assert!(matches!(err, FilterError::NotAMatrix { .. }));
        Ok(())
    }

    #[test]
    fn test_backward_matches_finite_difference() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let (rows, cols) = (4, 6);
        let raw = random_matrix(rows, cols, &mut rng)?;
        let upstream = random_matrix(rows, cols, &mut rng)?;

        // loss(X) = sum(normalize(X) * D)
        let loss = |x: &Tensor| -> Result<f64> {
            let (y, _) = normalize_rows(x)?;
            Ok(y.mul(&upstream)?.sum_all()?.to_scalar::<f64>()?)
        };

        let stage = RowNormalization::forward(raw.clone())?;
        let analytic: Vec<f64> = stage.backward(&upstream)?.flatten_all()?.to_vec1()?;

        let base: Vec<f64> = raw.flatten_all()?.to_vec1()?;
        let eps = 1e-6;
        let mut max_rel_err = 0.0f64;
        for idx in 0..base.len() {
            let mut plus = base.clone();
            plus[idx] += eps;
            let mut minus = base.clone();
            minus[idx] -= eps;
            let lp = loss(&Tensor::from_vec(plus, (rows, cols), &Device::Cpu)?)?;
            let lm = loss(&Tensor::from_vec(minus, (rows, cols), &Device::Cpu)?)?;
            let numerical = (lp - lm) / (2.0 * eps);

            let denom = numerical.abs().max(analytic[idx].abs()).max(1e-4);
            max_rel_err = max_rel_err.max((numerical - analytic[idx]).abs() / denom);
        }
        eprintln!("normalize backward max relative error: {max_rel_err:.3e}");
        assert!(max_rel_err < 1e-4, "max relative error {max_rel_err:.3e}");
        Ok(())
    }

    #[test]
    fn test_backward_rejects_mismatched_shapes() -> Result<()> {
        let device = Device::Cpu;
        let raw = Tensor::ones((3, 4), DType::F64, &device)?;
        let (normalized, norms) = normalize_rows(&raw)?;

        let bad_upstream = Tensor::ones((4, 3), DType::F64, &device)?;
        let err = normalize_rows_backward(&raw, &normalized, &norms, &bad_upstream).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FilterError>(),
            Some(FilterError::ShapeMismatch(_))
        ));

        let bad_norms = Tensor::ones(4, DType::F64, &device)?;
        let upstream = Tensor::ones((3, 4), DType::F64, &device)?;
        assert!(normalize_rows_backward(&raw, &normalized, &bad_norms, &upstream).is_err());
        Ok(())
    }
}
