// psfilter command-line driver
//
// Commands:
//   psfilter train [--config TIER] [--features N] [--max-iter K] [--seed S]
//                  [--input data.safetensors] [--output weights.safetensors]
//                  [--settings config.json]
//   psfilter encode --weights weights.safetensors --input data.safetensors
//                  [--output features.safetensors]
//   psfilter gradcheck [--seed S]
//
// Data files are safetensors holding two matrices `x` (dim_x x examples) and
// `y` (dim_y x examples). Without --input, train uses a synthetic paired set.
// Config tiers: test (small, seeded), default (200 iterations)

use psfilter::objective::{feed_forward, gradient_check, ProductSparseObjective};
use psfilter::training::{init_weights, load_weights, save_weights, train_with_rng, TrainingConfig};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn training_config(&self) -> TrainingConfig {
        match self {
            Self::Test => TrainingConfig::test(),
            Self::Default => TrainingConfig::default(),
        }
    }

    /// (n_features, dim_x, dim_y, examples) of the synthetic set.
    fn synthetic_dims(&self) -> (usize, usize, usize, usize) {
        match self {
            Self::Test => (4, 6, 5, 40),
            Self::Default => (16, 32, 24, 500),
        }
    }
}

/// Select device: CUDA when built with the feature and available, else CPU.
fn select_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    eprintln!("[PSF] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    eprintln!("[PSF] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        }
    }
    Device::Cpu
}

/// Parse --config TIER from args, returns (tier, remaining_args).
fn parse_config_tier(args: &[String]) -> (ConfigTier, Vec<String>) {
    let mut tier = ConfigTier::Default;
    let mut rest = Vec::new();
    let mut skip_next = false;

    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--config" {
            if let Some(next) = args.get(i + 1) {
                match ConfigTier::from_str(next) {
                    Some(t) => tier = t,
                    None => eprintln!("[PSF] Unknown config tier '{}', using default", next),
                }
                skip_next = true;
            }
        } else {
            rest.push(arg.clone());
        }
    }

    (tier, rest)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>> {
    match flag_value(args, flag) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("invalid value '{v}' for {flag}")),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let (tier, remaining) = parse_config_tier(&args[2..]);

    let result = match command {
        "train" => cmd_train(&remaining, tier),
        "encode" => cmd_encode(&remaining),
        "gradcheck" => cmd_gradcheck(&remaining),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[PSF] Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: psfilter <command> [--config test|default]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  train      Learn filters (--features N --max-iter K --seed S --input F --output F --settings F)");
    eprintln!("  encode     Apply learned filters (--weights F --input F [--output F])");
    eprintln!("  gradcheck  Compare analytic and numerical gradients on a random problem");
    eprintln!();
    eprintln!("Config tiers:");
    eprintln!("  test     25 iterations, seeded, small synthetic set");
    eprintln!("  default  200 iterations");
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

fn load_pair(path: &str, device: &Device) -> Result<(Tensor, Tensor)> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("loading {path}"))?;
    let get = |name: &str| -> Result<Tensor> {
        let t = tensors
            .get(name)
            .with_context(|| format!("{path} has no tensor '{name}'"))?;
        Ok(t.to_dtype(DType::F64)?)
    };
    Ok((get("x")?, get("y")?))
}

/// Two views of a shared latent code: x = A z + noise, y = B z + noise.
fn synthetic_pair(
    dim_x: usize,
    dim_y: usize,
    examples: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let latent = dim_x.min(dim_y).max(1);
    let z = init_weights(latent, examples, rng, device)?;
    let a = init_weights(dim_x, latent, rng, device)?;
    let b = init_weights(dim_y, latent, rng, device)?;
    let noise_x = (init_weights(dim_x, examples, rng, device)? * 0.1)?;
    let noise_y = (init_weights(dim_y, examples, rng, device)? * 0.1)?;
    let x = (a.matmul(&z)? + noise_x)?;
    let y = (b.matmul(&z)? + noise_y)?;
    Ok((x, y))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_train(args: &[String], tier: ConfigTier) -> Result<()> {
    let device = select_device();
    let mut config = match flag_value(args, "--settings") {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => tier.training_config(),
    };
    if let Some(seed) = parse_flag::<u64>(args, "--seed")? {
        config.seed = Some(seed);
    }
    if let Some(k) = parse_flag::<usize>(args, "--max-iter")? {
        config.optimizer.max_iterations = k;
    }

    let (default_features, dim_x, dim_y, examples) = tier.synthetic_dims();
    let n_features = parse_flag::<usize>(args, "--features")?.unwrap_or(default_features);

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (x, y) = match flag_value(args, "--input") {
        Some(path) => load_pair(path, &device)?,
        None => {
            eprintln!(
                "[PSF] No --input, using synthetic data: dim_x={dim_x} dim_y={dim_y} examples={examples}"
            );
            synthetic_pair(dim_x, dim_y, examples, &mut rng, &device)?
        }
    };

    eprintln!("[PSF] Config: {:?} | features={} | max_iter={}",
        tier, n_features, config.optimizer.max_iterations);

    let outcome = train_with_rng(n_features, &x, &y, &config, &mut rng)?;
    println!(
        "Objective: {:.6} -> {:.6} | Iterations: {} | Evaluations: {} | Converged: {}",
        outcome.initial_objective,
        outcome.final_objective,
        outcome.iterations,
        outcome.evaluations,
        outcome.termination.converged()
    );

    let output = flag_value(args, "--output").unwrap_or("psf_weights.safetensors");
    save_weights(&outcome.weights, outcome.dim_x, output)?;
    Ok(())
}

fn cmd_encode(args: &[String]) -> Result<()> {
    let device = select_device();
    let weights_path = flag_value(args, "--weights")
        .context("Usage: psfilter encode --weights F --input F [--output F]")?;
    let input = flag_value(args, "--input")
        .context("Usage: psfilter encode --weights F --input F [--output F]")?;

    let (weights, dim_x) = load_weights(weights_path, &device)?;
    let (x, y) = load_pair(input, &device)?;
    anyhow::ensure!(
        x.dim(0)? == dim_x,
        "weights were trained with dim_x={dim_x}, input x has {} rows",
        x.dim(0)?
    );

    let features = feed_forward(&weights, &x, &y)?;
    let (n_features, examples) = features.dims2()?;
    let sparsity = features.lt(0.1)?.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?;
    println!("Features: {n_features} x {examples} | fraction below 0.1: {sparsity:.3}");

    if let Some(out) = flag_value(args, "--output") {
        let named = HashMap::from([("features".to_string(), features)]);
        candle_core::safetensors::save(&named, out)?;
        eprintln!("[PSF] Wrote features to {out}");
    }
    Ok(())
}

fn cmd_gradcheck(args: &[String]) -> Result<()> {
    let device = Device::Cpu;
    let seed = parse_flag::<u64>(args, "--seed")?.unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);

    let (x, y) = synthetic_pair(4, 4, 5, &mut rng, &device)?;
    let objective = ProductSparseObjective::new(3, &x, &y)?;
    let w = init_weights(3, objective.shape().weight_cols(), &mut rng, &device)?;

    let max_rel_err = gradient_check(&objective, &w, 24, 1e-6, &mut rng)?;
    println!("Gradient check: max relative error {max_rel_err:.3e}");
    anyhow::ensure!(max_rel_err < 1e-4, "gradient check failed: {max_rel_err:.3e} >= 1e-4");
    Ok(())
}
