#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod error;
pub mod normalize;
pub mod objective;
pub mod lbfgs;
pub mod training;

pub use error::FilterError;
pub use normalize::{normalize_rows, normalize_rows_backward, RowNormalization, EPSILON};
pub use objective::{feed_forward, gradient_check, ForwardTrace, ProductSparseObjective};
pub use training::{train_product_sparse_filtering, train_with_rng, TrainOutcome, TrainingConfig};
