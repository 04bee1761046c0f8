//! Typed failures for the filter pipeline.
//!
//! Library functions return `anyhow::Result`; these values travel inside the
//! `anyhow::Error` and can be recovered with `downcast_ref::<FilterError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FilterError {
    /// An input that must be a matrix had some other rank.
    #[error("{name} must be a 2-D matrix, got shape {shape:?}")]
    NotAMatrix { name: &'static str, shape: Vec<usize> },

    /// X and Y do not hold the same number of examples (columns).
    #[error("example count mismatch: X has {x} columns, Y has {y}")]
    ExampleCountMismatch { x: usize, y: usize },

    /// W's column count is not dim_x + dim_y.
    #[error("weight matrix has {actual} columns, expected {expected} (dim_x + dim_y)")]
    WeightColumnMismatch { expected: usize, actual: usize },

    /// Flattened parameter vector has the wrong length.
    #[error("parameter vector has {actual} entries, expected {expected}")]
    ParameterLengthMismatch { expected: usize, actual: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("objective is not finite at the starting point: {0}")]
    NonFiniteObjective(f64),
}

impl FilterError {
    /// True for every variant that reports incompatible matrix shapes.
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Self::NotAMatrix { .. }
                | Self::ExampleCountMismatch { .. }
                | Self::WeightColumnMismatch { .. }
                | Self::ParameterLengthMismatch { .. }
                | Self::ShapeMismatch(_)
        )
    }
}

/// Rank-2 dimensions of `t`, or `NotAMatrix` naming the offending input.
pub fn matrix_dims(name: &'static str, t: &candle_core::Tensor) -> Result<(usize, usize), FilterError> {
    match t.dims() {
        &[r, c] => Ok((r, c)),
        other => Err(FilterError::NotAMatrix {
            name,
            shape: other.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_matrix_dims() -> anyhow::Result<()> {
        let m = Tensor::zeros((3, 5), DType::F64, &Device::Cpu)?;
        assert_eq!(matrix_dims("m", &m)?, (3, 5));

        let v = Tensor::zeros(4, DType::F64, &Device::Cpu)?;
        let err = matrix_dims("v", &v).unwrap_err();
        assert_eq!(err, FilterError::NotAMatrix { name: "v", shape: vec![4] });
        assert!(err.is_shape_error());
        Ok(())
    }

    #[test]
    fn test_error_messages() {
        let e = FilterError::ExampleCountMismatch { x: 3, y: 4 };
        assert_eq!(e.to_string(), "example count mismatch: X has 3 columns, Y has 4");
        assert!(!FilterError::Config("x".into()).is_shape_error());
    }
}
