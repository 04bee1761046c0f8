// Product sparse filtering objective: forward pass, exact gradient, and the
// feed-forward feature map.
//
//   F1 = W_X X        F2 = W_Y Y        F = F1 * F2
//   Fs = sqrt(F^2 + eps)
//   per-feature stage:  normalize rows of Fs          -> NFs
//   per-example stage:  normalize rows of NFs^T       -> Fhat^T
//   objective = sum(Fhat)
//
// The backward pass walks the two normalization stages in reverse using the
// triples recorded by the forward pass.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::error::{matrix_dims, FilterError};
use crate::lbfgs::Objective;
use crate::normalize::{RowNormalization, EPSILON};

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// Dimensions shared by a weight matrix and the input pair it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterShape {
    pub n_features: usize,
    pub dim_x: usize,
    pub dim_y: usize,
    pub n_examples: usize,
}

impl FilterShape {
    /// Validate an input pair. Fails if the example counts differ.
    pub fn of_inputs(n_features: usize, x: &Tensor, y: &Tensor) -> Result<Self> {
        let (dim_x, nx) = matrix_dims("x", x)?;
        let (dim_y, ny) = matrix_dims("y", y)?;
        if nx != ny {
            return Err(FilterError::ExampleCountMismatch { x: nx, y: ny }.into());
        }
        Ok(Self {
            n_features,
            dim_x,
            dim_y,
            n_examples: nx,
        })
    }

    /// Validate weights against an input pair.
    pub fn of_weights(w: &Tensor, x: &Tensor, y: &Tensor) -> Result<Self> {
        let (n_features, cols) = matrix_dims("weights", w)?;
        let shape = Self::of_inputs(n_features, x, y)?;
        if cols != shape.weight_cols() {
            return Err(FilterError::WeightColumnMismatch {
                expected: shape.weight_cols(),
                actual: cols,
            }
            .into());
        }
        Ok(shape)
    }

    pub fn weight_cols(&self) -> usize {
        self.dim_x + self.dim_y
    }

    pub fn n_params(&self) -> usize {
        self.n_features * self.weight_cols()
    }
}

fn as_f64(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_dtype(DType::F64)?.contiguous()?)
}

// ---------------------------------------------------------------------------
// Forward trace
// ---------------------------------------------------------------------------

/// Every intermediate of one forward pass, kept for the reverse pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub f1: Tensor,
    pub f2: Tensor,
    pub f: Tensor,
    pub fs: Tensor,
    /// Rows of Fs (one per feature) normalized across examples.
    pub per_feature: RowNormalization,
    /// Rows of NFs^T (one per example) normalized across features.
    pub per_example: RowNormalization,
}

impl ForwardTrace {
    pub fn objective(&self) -> Result<f64> {
        Ok(self.per_example.normalized.sum_all()?.to_scalar::<f64>()?)
    }

    /// Fhat, shaped (n_features, n_examples).
    pub fn features(&self) -> Result<Tensor> {
        Ok(self.per_example.normalized.t()?.contiguous()?)
    }

    /// dObjective/dW, shaped like W.
    fn backward(&self, x_t: &Tensor, y_t: &Tensor) -> Result<Tensor> {
        let seed = self.per_example.normalized.ones_like()?;
        let d_nfs = self.per_example.backward(&seed)?.t()?.contiguous()?;
        let d_fs = self.per_feature.backward(&d_nfs)?;

        let d_f = d_fs.mul(&self.f.div(&self.fs)?)?;
        let d_f1 = d_f.mul(&self.f2)?;
        let d_f2 = d_f.mul(&self.f1)?;

        let d_wx = d_f1.matmul(x_t)?;
        let d_wy = d_f2.matmul(y_t)?;
        Ok(Tensor::cat(&[&d_wx, &d_wy], 1)?)
    }
}

/// Forward steps 1-6. Shapes must already be validated.
fn forward_pass(w: &Tensor, x: &Tensor, y: &Tensor, shape: &FilterShape) -> Result<ForwardTrace> {
    let w_x = w.narrow(1, 0, shape.dim_x)?.contiguous()?;
    let w_y = w.narrow(1, shape.dim_x, shape.dim_y)?.contiguous()?;

    let f1 = w_x.matmul(x)?;
    let f2 = w_y.matmul(y)?;
    let f = f1.mul(&f2)?;
    let fs = (f.sqr()? + EPSILON)?.sqrt()?;

    let per_feature = RowNormalization::forward(fs.clone())?;
    let per_example = RowNormalization::forward(per_feature.normalized.t()?.contiguous()?)?;

    Ok(ForwardTrace {
        f1,
        f2,
        f,
        fs,
        per_feature,
        per_example,
    })
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// The training objective over a fixed input pair.
///
/// Holds X, Y and their transposes; every evaluation allocates its own
/// intermediates, so the same instance can be probed at any number of points.
#[derive(Debug, Clone)]
pub struct ProductSparseObjective {
    shape: FilterShape,
    x: Tensor,
    y: Tensor,
    x_t: Tensor,
    y_t: Tensor,
}

impl ProductSparseObjective {
    pub fn new(n_features: usize, x: &Tensor, y: &Tensor) -> Result<Self> {
        if n_features == 0 {
            return Err(FilterError::Config("n_features must be > 0".into()).into());
        }
        let shape = FilterShape::of_inputs(n_features, x, y)?;
        let x = as_f64(x)?;
        let y = as_f64(y)?;
        let x_t = x.t()?.contiguous()?;
        let y_t = y.t()?.contiguous()?;
        Ok(Self {
            shape,
            x,
            y,
            x_t,
            y_t,
        })
    }

    pub fn shape(&self) -> FilterShape {
        self.shape
    }

    pub fn device(&self) -> &Device {
        self.x.device()
    }

    fn check_weights(&self, w: &Tensor) -> Result<Tensor> {
        let (rows, cols) = matrix_dims("weights", w)?;
        if cols != self.shape.weight_cols() {
            return Err(FilterError::WeightColumnMismatch {
                expected: self.shape.weight_cols(),
                actual: cols,
            }
            .into());
        }
        if rows != self.shape.n_features {
            return Err(FilterError::ShapeMismatch(format!(
                "weights have {rows} rows, objective has {} features",
                self.shape.n_features
            ))
            .into());
        }
        as_f64(w)
    }

    /// Forward pass only.
    pub fn forward(&self, w: &Tensor) -> Result<ForwardTrace> {
        let w = self.check_weights(w)?;
        forward_pass(&w, &self.x, &self.y, &self.shape)
    }

    /// Objective value and its gradient w.r.t. `w` (same shape as `w`).
    pub fn evaluate_weights(&self, w: &Tensor) -> Result<(f64, Tensor)> {
        let trace = self.forward(w)?;
        let grad = trace.backward(&self.x_t, &self.y_t)?;
        Ok((trace.objective()?, grad))
    }

    /// Flat form of [`Self::evaluate_weights`]: row-major parameters in,
    /// row-major gradient out.
    pub fn evaluate_flat(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        let w = self.unflatten(params)?;
        let (value, grad) = self.evaluate_weights(&w)?;
        Ok((value, grad.flatten_all()?.to_vec1::<f64>()?))
    }

    /// Reshape a flat parameter vector into (n_features, dim_x + dim_y).
    pub fn unflatten(&self, params: &[f64]) -> Result<Tensor> {
        if params.len() != self.shape.n_params() {
            return Err(FilterError::ParameterLengthMismatch {
                expected: self.shape.n_params(),
                actual: params.len(),
            }
            .into());
        }
        Ok(Tensor::from_slice(
            params,
            (self.shape.n_features, self.shape.weight_cols()),
            self.device(),
        )?)
    }
}

impl Objective for ProductSparseObjective {
    fn evaluate(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.evaluate_flat(params)
    }
}

// ---------------------------------------------------------------------------
// Feed-forward
// ---------------------------------------------------------------------------

/// Apply learned weights to a new input pair. Returns Fhat, shaped
/// (n_features, n_examples); each example column has unit norm.
pub fn feed_forward(weights: &Tensor, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let shape = FilterShape::of_weights(weights, x, y)?;
    let trace = forward_pass(&as_f64(weights)?, &as_f64(x)?, &as_f64(y)?, &shape)?;
    trace.features()
}

// ---------------------------------------------------------------------------
// Gradient Check
// ---------------------------------------------------------------------------

/// Compare the analytic gradient against centered finite differences at
/// `weights`. Checks every parameter when there are at most
/// `n_params_to_check`, otherwise a random sample. Returns the max relative
/// error; components smaller than 1e-4 are compared absolutely.
pub fn gradient_check<R: Rng>(
    objective: &ProductSparseObjective,
    weights: &Tensor,
    n_params_to_check: usize,
    eps: f64,
    rng: &mut R,
) -> Result<f64> {
    let params: Vec<f64> = as_f64(weights)?.flatten_all()?.to_vec1()?;
    let (_, analytic) = objective.evaluate_flat(&params)?;

    let indices: Vec<usize> = if params.len() <= n_params_to_check {
        (0..params.len()).collect()
    } else {
        (0..n_params_to_check)
            .map(|_| rng.gen_range(0..params.len()))
            .collect()
    };

    let mut max_rel_err = 0.0f64;
    for idx in indices {
        let mut plus = params.clone();
        plus[idx] += eps;
        let (lp, _) = objective.evaluate_flat(&plus)?;

        let mut minus = params.clone();
        minus[idx] -= eps;
        let (lm, _) = objective.evaluate_flat(&minus)?;

        let numerical = (lp - lm) / (2.0 * eps);
        let denom = numerical.abs().max(analytic[idx].abs()).max(1e-4);
        let rel_err = (numerical - analytic[idx]).abs() / denom;
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
        }
    }

    Ok(max_rel_err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::StandardNormal;

    fn randn(rows: usize, cols: usize, rng: &mut StdRng) -> Result<Tensor> {
        let data: Vec<f64> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
    }

    #[test]
    fn test_gradient_check() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let x = randn(4, 5, &mut rng)?;
        let y = randn(4, 5, &mut rng)?;
        let w = randn(3, 8, &mut rng)?;
        let objective = ProductSparseObjective::new(3, &x, &y)?;

        let max_rel_err = gradient_check(&objective, &w, 24, 1e-6, &mut rng)?;
        eprintln!("objective gradient max relative error: {max_rel_err:.3e}");
        assert!(
            max_rel_err < 1e-4,
            "gradient check failed: max relative error {max_rel_err:.3e}"
        );
        Ok(())
    }

    #[test]
    fn test_gradient_check_unequal_dims() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let x = randn(5, 6, &mut rng)?;
        let y = randn(2, 6, &mut rng)?;
        let w = randn(4, 7, &mut rng)?;
        let objective = ProductSparseObjective::new(4, &x, &y)?;

        let max_rel_err = gradient_check(&objective, &w, 28, 1e-6, &mut rng)?;
        assert!(max_rel_err < 1e-4, "max relative error {max_rel_err:.3e}");
        Ok(())
    }

    #[test]
    fn test_ones_scenario_is_finite() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3), DType::F64, &device)?;
        let y = Tensor::ones((2, 3), DType::F64, &device)?;
        let w = Tensor::new(&[[0.1f64, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]], &device)?;
        let objective = ProductSparseObjective::new(2, &x, &y)?;

        let params: Vec<f64> = w.flatten_all()?.to_vec1()?;
        let (value, grad) = objective.evaluate_flat(&params)?;

        assert!(value.is_finite(), "objective should be finite, got {value}");
        assert_eq!(grad.len(), 8);
        assert!(grad.iter().all(|g| g.is_finite()), "non-finite gradient: {grad:?}");
        Ok(())
    }

    #[test]
    fn test_evaluate_shapes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let x = randn(3, 10, &mut rng)?;
        let y = randn(6, 10, &mut rng)?;
        let w = randn(4, 9, &mut rng)?;
        let objective = ProductSparseObjective::new(4, &x, &y)?;

        let trace = objective.forward(&w)?;
        assert_eq!(trace.f.dims2()?, (4, 10));
        assert_eq!(trace.per_feature.norms.dims(), &[4]);
        assert_eq!(trace.per_example.norms.dims(), &[10]);
        assert_eq!(trace.features()?.dims2()?, (4, 10));

        let (_, grad) = objective.evaluate_weights(&w)?;
        assert_eq!(grad.dims2()?, (4, 9));
        Ok(())
    }

    #[test]
    fn test_objective_is_sum_of_features() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(9);
        let x = randn(3, 7, &mut rng)?;
        let y = randn(2, 7, &mut rng)?;
        let w = randn(5, 5, &mut rng)?;
        let objective = ProductSparseObjective::new(5, &x, &y)?;

        let (value, _) = objective.evaluate_weights(&w)?;
        let features = feed_forward(&w, &x, &y)?;
        let total = features.sum_all()?.to_scalar::<f64>()?;
        assert!((value - total).abs() < 1e-12, "{value} vs {total}");
        Ok(())
    }

    #[test]
    fn test_feed_forward_columns_unit_norm() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(13);
        let x = randn(4, 12, &mut rng)?;
        let y = randn(3, 12, &mut rng)?;
        let w = randn(6, 7, &mut rng)?;

        let features = feed_forward(&w, &x, &y)?;
        assert_eq!(features.dims2()?, (6, 12));
        let col_norms: Vec<f64> = features.sqr()?.sum(0)?.sqrt()?.to_vec1()?;
        for (j, n) in col_norms.iter().enumerate() {
            assert!((n - 1.0).abs() < 1e-6, "example {j} has norm {n}");
        }
        // smoothed absolute values are positive, so are the features
        let min = features.min_all()?.to_scalar::<f64>()?;
        assert!(min > 0.0);
        Ok(())
    }

    #[test]
    fn test_feed_forward_deterministic() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(17);
        let x = randn(4, 8, &mut rng)?;
        let y = randn(4, 8, &mut rng)?;
        let w = randn(3, 8, &mut rng)?;

        let a: Vec<Vec<f64>> = feed_forward(&w, &x, &y)?.to_vec2()?;
        let b: Vec<Vec<f64>> = feed_forward(&w, &x, &y)?.to_vec2()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_feed_forward_accepts_f32() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(19);
        let x = randn(2, 4, &mut rng)?;
        let y = randn(3, 4, &mut rng)?;
        let w = randn(2, 5, &mut rng)?;

        let reference = feed_forward(&w, &x, &y)?;
        let from_f32 = feed_forward(
            &w.to_dtype(DType::F32)?,
            &x.to_dtype(DType::F32)?,
            &y.to_dtype(DType::F32)?,
        )?;
        assert_eq!(from_f32.dtype(), DType::F64);
        let diff = reference.sub(&from_f32)?.abs()?.max_all()?.to_scalar::<f64>()?;
        assert!(diff < 1e-4, "f32 inputs drifted by {diff}");
        Ok(())
    }

    #[test]
    fn test_example_count_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3), DType::F64, &device)?;
        let y = Tensor::ones((2, 4), DType::F64, &device)?;

        let err = ProductSparseObjective::new(2, &x, &y).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FilterError>(),
            Some(&FilterError::ExampleCountMismatch { x: 3, y: 4 })
        );

        let w = Tensor::ones((2, 4), DType::F64, &device)?;
        let err = feed_forward(&w, &x, &y).unwrap_err();
        assert!(err.downcast_ref::<FilterError>().is_some_and(|e| e.is_shape_error()));
        Ok(())
    }

    #[test]
    fn test_weight_column_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3), DType::F64, &device)?;
        let y = Tensor::ones((3, 3), DType::F64, &device)?;
        let w = Tensor::ones((2, 4), DType::F64, &device)?;

        let err = feed_forward(&w, &x, &y).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FilterError>(),
            Some(&FilterError::WeightColumnMismatch { expected: 5, actual: 4 })
        );

        let objective = ProductSparseObjective::new(2, &x, &y)?;
        assert!(objective.evaluate_weights(&w).is_err());
        Ok(())
    }

    #[test]
    fn test_parameter_length_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3), DType::F64, &device)?;
        let y = Tensor::ones((2, 3), DType::F64, &device)?;
        let objective = ProductSparseObjective::new(2, &x, &y)?;

        let err = objective.evaluate_flat(&[0.1; 7]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FilterError>(),
            Some(&FilterError::ParameterLengthMismatch { expected: 8, actual: 7 })
        );
        Ok(())
    }

    #[test]
    fn test_zero_features_rejected() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3), DType::F64, &device)?;
        let err = ProductSparseObjective::new(0, &x, &x).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FilterError>(),
            Some(FilterError::Config(_))
        ));
        Ok(())
    }
}
