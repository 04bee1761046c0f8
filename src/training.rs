use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use crate::error::{matrix_dims, FilterError};
use crate::lbfgs::{minimize, LbfgsConfig, Termination};
use crate::objective::ProductSparseObjective;

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Seed for the initial weights. None draws from OS entropy.
    pub seed: Option<u64>,
    /// Print optimizer progress every N iterations (0 = silent).
    pub log_interval: usize,
    pub optimizer: LbfgsConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: None,
            log_interval: 10,
            optimizer: LbfgsConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Small seeded config for tests (fast, quiet).
    pub fn test() -> Self {
        Self {
            seed: Some(0),
            log_interval: 0,
            optimizer: LbfgsConfig::default().with_max_iterations(25),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.optimizer.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), FilterError> {
        self.optimizer.validate()
    }

    /// Whether the driver prints anything; `log_interval == 0` silences it.
    pub fn verbose(&self) -> bool {
        self.log_interval > 0
    }

    /// Load a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Standard-normal weights of shape (n_features, n_cols).
pub fn init_weights<R: Rng>(
    n_features: usize,
    n_cols: usize,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f64> = (0..n_features * n_cols)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Tensor::from_vec(data, (n_features, n_cols), device).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Learned weights, (n_features, dim_x + dim_y).
    pub weights: Tensor,
    pub dim_x: usize,
    pub initial_objective: f64,
    pub final_objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
    pub elapsed_secs: f64,
}

/// Learn `n_features` product sparse filters for the pair (x, y), drawing the
/// initial weights from `rng`.
///
/// Hitting the iteration cap is not an error; `termination` says why the
/// optimizer stopped and the weights are its best point.
pub fn train_with_rng<R: Rng>(
    n_features: usize,
    x: &Tensor,
    y: &Tensor,
    config: &TrainingConfig,
    rng: &mut R,
) -> Result<TrainOutcome> {
    config.validate()?;
    let timer = Instant::now();
    let objective = ProductSparseObjective::new(n_features, x, y)?;
    let shape = objective.shape();

    let w0 = init_weights(n_features, shape.weight_cols(), rng, objective.device())?;
    let params: Vec<f64> = w0.flatten_all()?.to_vec1()?;
    let (initial_objective, _) = objective.evaluate_flat(&params)?;

    if config.verbose() {
        eprintln!(
            "[PSF] Training {} features | dim_x={} dim_y={} examples={} | {} params | f0={:.6}",
            n_features,
            shape.dim_x,
            shape.dim_y,
            shape.n_examples,
            shape.n_params(),
            initial_objective
        );
    }

    let report = minimize(&objective, params, &config.optimizer, config.log_interval)?;
    let weights = objective.unflatten(&report.params)?;
    let elapsed_secs = timer.elapsed().as_secs_f64();

    if config.verbose() {
        eprintln!(
            "[PSF] Done: f={:.6} |g|_inf={:.3e} after {} iters / {} evals ({:?}) in {:.2}s",
            report.value,
            report.gradient_inf_norm(),
            report.iterations,
            report.evaluations,
            report.termination,
            elapsed_secs
        );
        if !report.termination.converged() {
            eprintln!("[PSF] Warning: optimizer did not converge, returning best point found");
        }
    }

    Ok(TrainOutcome {
        weights,
        dim_x: shape.dim_x,
        initial_objective,
        final_objective: report.value,
        iterations: report.iterations,
        evaluations: report.evaluations,
        termination: report.termination,
        elapsed_secs,
    })
}

/// Learn weights of shape (n_features, x.rows + y.rows), seeding the
/// initialization from `config.seed`.
pub fn train_product_sparse_filtering(
    n_features: usize,
    x: &Tensor,
    y: &Tensor,
    config: &TrainingConfig,
) -> Result<Tensor> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Ok(train_with_rng(n_features, x, y, config, &mut rng)?.weights)
}

// ---------------------------------------------------------------------------
// Weight Checkpointing (safetensors)
// ---------------------------------------------------------------------------

/// Save weights split into `w_x` and `w_y` so the column split survives.
pub fn save_weights(weights: &Tensor, dim_x: usize, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let (n_features, cols) = matrix_dims("weights", weights)?;
    if dim_x > cols {
        return Err(FilterError::ShapeMismatch(format!(
            "dim_x={dim_x} exceeds weight columns {cols}"
        ))
        .into());
    }
    let mut named: HashMap<String, Tensor> = HashMap::new();
    named.insert("w_x".to_string(), weights.narrow(1, 0, dim_x)?.contiguous()?);
    named.insert("w_y".to_string(), weights.narrow(1, dim_x, cols - dim_x)?.contiguous()?);
    candle_core::safetensors::save(&named, path)?;
    eprintln!(
        "[CHECKPOINT] Saved {n_features}x{cols} weights (dim_x={dim_x}) to {}",
        path.display()
    );
    Ok(())
}

/// Load weights written by [`save_weights`]. Returns (weights, dim_x).
pub fn load_weights(path: impl AsRef<Path>, device: &Device) -> Result<(Tensor, usize)> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)?;
    let get = |name: &str| {
        tensors
            .get(name)
            .with_context(|| format!("{} has no tensor '{name}'", path.display()))
    };
    let w_x = get("w_x")?;
    let w_y = get("w_y")?;
    let (rows_x, dim_x) = matrix_dims("w_x", w_x)?;
    let (rows_y, _) = matrix_dims("w_y", w_y)?;
    if rows_x != rows_y {
        return Err(FilterError::ShapeMismatch(format!(
            "w_x has {rows_x} rows, w_y has {rows_y}"
        ))
        .into());
    }
    let weights = Tensor::cat(&[w_x, w_y], 1)?;
    eprintln!(
        "[CHECKPOINT] Loaded {:?} weights (dim_x={dim_x}) from {}",
        weights.dims(),
        path.display()
    );
    Ok((weights, dim_x))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
