// Limited-memory BFGS with a strong-Wolfe line search.
//
// Works on flat f64 parameter vectors. The objective is anything that maps a
// point to (value, gradient); ProductSparseObjective implements it, and so
// does any `Fn(&[f64]) -> Result<(f64, Vec<f64>)>`.
//
// Running out of iterations is not an error: the best point found is returned
// together with the reason the loop stopped.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::FilterError;

/// Sufficient-decrease constant of the Wolfe conditions.
const WOLFE_C1: f64 = 1e-4;
/// Curvature constant of the Wolfe conditions.
const WOLFE_C2: f64 = 0.9;

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// A differentiable scalar function of a flat parameter vector.
pub trait Objective {
    /// Value and gradient at `params`. Must not depend on earlier calls.
    fn evaluate(&self, params: &[f64]) -> Result<(f64, Vec<f64>)>;
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> Result<(f64, Vec<f64>)>,
{
    fn evaluate(&self, params: &[f64]) -> Result<(f64, Vec<f64>)> {
        self(params)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsConfig {
    pub max_iterations: usize,
    /// Number of (s, y) correction pairs kept.
    pub history_size: usize,
    /// Hard cap on objective evaluations, line-search probes included.
    pub max_evaluations: usize,
    /// Stop when the infinity norm of the gradient falls to this.
    pub gradient_tolerance: f64,
    /// Stop when (f_k - f_{k+1}) / max(|f_k|, |f_{k+1}|, 1) falls to this.
    pub function_tolerance: f64,
    pub max_line_search_steps: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            history_size: 10,
            max_evaluations: 15_000,
            gradient_tolerance: 1e-5,
            function_tolerance: 1e7 * f64::EPSILON,
            max_line_search_steps: 20,
        }
    }
}

impl LbfgsConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), FilterError> {
        if self.max_iterations == 0 {
            return Err(FilterError::Config("max_iterations must be > 0".into()));
        }
        if self.history_size == 0 {
            return Err(FilterError::Config("history_size must be > 0".into()));
        }
        if self.max_evaluations == 0 {
            return Err(FilterError::Config("max_evaluations must be > 0".into()));
        }
        if self.max_line_search_steps == 0 {
            return Err(FilterError::Config("max_line_search_steps must be > 0".into()));
        }
        if !(self.gradient_tolerance >= 0.0 && self.function_tolerance >= 0.0) {
            return Err(FilterError::Config("tolerances must be non-negative".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    GradientTolerance,
    FunctionTolerance,
    MaxIterations,
    MaxEvaluations,
    LineSearchFailed,
}

impl Termination {
    /// Whether the stop came from a convergence test rather than a budget.
    pub fn converged(&self) -> bool {
        matches!(self, Self::GradientTolerance | Self::FunctionTolerance)
    }
}

#[derive(Debug, Clone)]
pub struct OptimizeReport {
    pub params: Vec<f64>,
    pub value: f64,
    pub gradient: Vec<f64>,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
}

impl OptimizeReport {
    pub fn gradient_inf_norm(&self) -> f64 {
        inf_norm(&self.gradient)
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn inf_norm(a: &[f64]) -> f64 {
    a.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

/// x + alpha * d
fn step_along(x: &[f64], alpha: f64, d: &[f64]) -> Vec<f64> {
    x.iter().zip(d).map(|(xi, di)| xi + alpha * di).collect()
}

fn diff(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

// ---------------------------------------------------------------------------
// Two-loop recursion
// ---------------------------------------------------------------------------

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Search direction -H*g from the stored correction pairs.
fn search_direction(history: &VecDeque<Correction>, g: &[f64]) -> Vec<f64> {
    let mut q = g.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for c in history.iter().rev() {
        let a = c.rho * dot(&c.s, &q);
        for (qi, yi) in q.iter_mut().zip(&c.y) {
            *qi -= a * yi;
        }
        alphas.push(a);
    }

    let gamma = match history.back() {
        Some(c) => dot(&c.s, &c.y) / dot(&c.y, &c.y),
        None => 1.0,
    };
    for qi in q.iter_mut() {
        *qi *= gamma;
    }

    for (c, a) in history.iter().zip(alphas.iter().rev()) {
        let b = c.rho * dot(&c.y, &q);
        for (qi, si) in q.iter_mut().zip(&c.s) {
            *qi += (a - b) * si;
        }
    }

    for qi in q.iter_mut() {
        *qi = -*qi;
    }
    q
}

// ---------------------------------------------------------------------------
// Line search (Nocedal & Wright, algorithms 3.5 / 3.6)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Trial {
    alpha: f64,
    x: Vec<f64>,
    f: f64,
    g: Vec<f64>,
    /// Directional derivative g . d at this trial.
    dg: f64,
}

struct LineSearch<'a, O: Objective + ?Sized> {
    objective: &'a O,
    x0: &'a [f64],
    f0: f64,
    dg0: f64,
    direction: &'a [f64],
    max_steps: usize,
    /// Evaluations this search may spend before giving up.
    budget: usize,
    evaluations: usize,
}

impl<'a, O: Objective + ?Sized> LineSearch<'a, O> {
    fn probe(&mut self, alpha: f64) -> Result<Trial> {
        let x = step_along(self.x0, alpha, self.direction);
        let (f, g) = self.objective.evaluate(&x)?;
        self.evaluations += 1;
        let f = if f.is_nan() { f64::INFINITY } else { f };
        let dg = dot(&g, self.direction);
        Ok(Trial { alpha, x, f, g, dg })
    }

    /// The alpha = 0 end of the bracket. Only ever used as a bound, never
    /// returned, so its gradient is left empty.
    fn origin(&self) -> Trial {
        Trial {
            alpha: 0.0,
            x: self.x0.to_vec(),
            f: self.f0,
            g: Vec::new(),
            dg: self.dg0,
        }
    }

    fn exhausted(&self) -> bool {
        self.evaluations >= self.budget
    }

    fn armijo_ok(&self, t: &Trial) -> bool {
        t.f.is_finite() && t.f <= self.f0 + WOLFE_C1 * t.alpha * self.dg0
    }

    fn curvature_ok(&self, t: &Trial) -> bool {
        t.dg.abs() <= -WOLFE_C2 * self.dg0
    }

    /// Returns a step satisfying the strong Wolfe conditions, or failing that
    /// the best sufficient-decrease step seen. None if no step decreased f.
    fn run(&mut self, alpha_init: f64) -> Result<Option<Trial>> {
        let mut prev: Option<Trial> = None;
        let mut alpha = alpha_init;

        for i in 0..self.max_steps {
            if self.exhausted() {
                break;
            }
            let t = self.probe(alpha)?;
            let prev_f = prev.as_ref().map_or(self.f0, |p| p.f);
            if !self.armijo_ok(&t) || (i > 0 && t.f >= prev_f) {
                return self.zoom(prev, t);
            }
            if self.curvature_ok(&t) {
                return Ok(Some(t));
            }
            if t.dg >= 0.0 {
                let hi = prev.unwrap_or_else(|| self.origin());
                return self.zoom(Some(t), hi);
            }
            alpha = t.alpha * 2.0;
            prev = Some(t);
        }
        Ok(prev)
    }

    /// Shrink [lo, hi] until a strong Wolfe point is found. `lo` is None when
    /// the low end is the starting point (alpha = 0).
    fn zoom(&mut self, mut lo: Option<Trial>, mut hi: Trial) -> Result<Option<Trial>> {
        for _ in 0..self.max_steps {
            if self.exhausted() {
                break;
            }
            let (a_lo, f_lo, dg_lo) = lo.as_ref().map_or((0.0, self.f0, self.dg0), |t| (t.alpha, t.f, t.dg));
            let a_hi = hi.alpha;
            if (a_hi - a_lo).abs() <= 1e-16 * a_hi.abs().max(1.0) {
                break;
            }

            let alpha = interpolate(a_lo, f_lo, dg_lo, a_hi, hi.f);
            let t = self.probe(alpha)?;

            if !self.armijo_ok(&t) || t.f >= f_lo {
                hi = t;
            } else {
                if self.curvature_ok(&t) {
                    return Ok(Some(t));
                }
                if t.dg * (a_hi - a_lo) >= 0.0 {
                    hi = lo.take().unwrap_or_else(|| self.origin());
                }
                lo = Some(t);
            }
        }
        Ok(lo)
    }
}

/// Minimizer of the quadratic through (a_lo, f_lo, dg_lo) and (a_hi, f_hi),
/// falling back to bisection when it lands near the interval ends.
fn interpolate(a_lo: f64, f_lo: f64, dg_lo: f64, a_hi: f64, f_hi: f64) -> f64 {
    let mid = 0.5 * (a_lo + a_hi);
    if !f_hi.is_finite() {
        return mid;
    }
    let width = a_hi - a_lo;
    let denom = 2.0 * (f_hi - f_lo - dg_lo * width);
    if denom <= 0.0 {
        return mid;
    }
    let alpha = a_lo - dg_lo * width * width / denom;
    let (left, right) = if a_lo < a_hi { (a_lo, a_hi) } else { (a_hi, a_lo) };
    let margin = 0.1 * (right - left);
    if alpha.is_finite() && alpha > left + margin && alpha < right - margin {
        alpha
    } else {
        mid
    }
}

// ---------------------------------------------------------------------------
// Minimize
// ---------------------------------------------------------------------------

/// Minimize `objective` from `x0`.
///
/// `log_interval` prints progress every that many iterations (0 = silent).
/// The evaluation budget is checked before every line-search probe, so
/// `evaluations` never exceeds `config.max_evaluations`.
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    x0: Vec<f64>,
    config: &LbfgsConfig,
    log_interval: usize,
) -> Result<OptimizeReport> {
    config.validate()?;

    let mut x = x0;
    let (mut f, mut g) = objective.evaluate(&x)?;
    let mut evaluations = 1usize;
    if !f.is_finite() {
        return Err(FilterError::NonFiniteObjective(f).into());
    }
    if g.len() != x.len() {
        return Err(FilterError::ParameterLengthMismatch {
            expected: x.len(),
            actual: g.len(),
        }
        .into());
    }

    let mut history: VecDeque<Correction> = VecDeque::with_capacity(config.history_size);
    let mut iterations = 0usize;
    let mut failed_once = false;

    let termination = loop {
        if inf_norm(&g) <= config.gradient_tolerance {
            break Termination::GradientTolerance;
        }
        if iterations >= config.max_iterations {
            break Termination::MaxIterations;
        }
        if evaluations >= config.max_evaluations {
            break Termination::MaxEvaluations;
        }

        let mut d = search_direction(&history, &g);
        let mut dg = dot(&d, &g);
        if !(dg < 0.0) {
            history.clear();
            d = g.iter().map(|v| -v).collect();
            dg = -dot(&g, &g);
        }

        let alpha_init = if history.is_empty() {
            (1.0 / dot(&g, &g).sqrt()).min(1.0)
        } else {
            1.0
        };

        let mut search = LineSearch {
            objective,
            x0: &x,
            f0: f,
            dg0: dg,
            direction: &d,
            max_steps: config.max_line_search_steps,
            budget: config.max_evaluations - evaluations,
            evaluations: 0,
        };
        let step = search.run(alpha_init)?;
        evaluations += search.evaluations;
        iterations += 1;

        let step = match step {
            Some(step) => {
                failed_once = false;
                step
            }
            None if evaluations >= config.max_evaluations => break Termination::MaxEvaluations,
            None if !failed_once && !history.is_empty() => {
                if log_interval > 0 {
                    eprintln!("[LBFGS] line search failed at iter {iterations}, resetting history");
                }
                failed_once = true;
                history.clear();
                continue;
            }
            None => break Termination::LineSearchFailed,
        };

        let s = diff(&step.x, &x);
        let y = diff(&step.g, &g);
        let sy = dot(&s, &y);
        if sy > f64::EPSILON * dot(&y, &y) {
            if history.len() == config.history_size {
                history.pop_front();
            }
            history.push_back(Correction { s, y, rho: 1.0 / sy });
        }

        let f_prev = f;
        x = step.x;
        f = step.f;
        g = step.g;

        if log_interval > 0 && iterations % log_interval == 0 {
            eprintln!(
                "[LBFGS] iter {iterations:>4}/{} f = {f:.6} |g|_inf = {:.3e} evals = {evaluations}",
                config.max_iterations,
                inf_norm(&g)
            );
        }

        let reduction = (f_prev - f) / f_prev.abs().max(f.abs()).max(1.0);
        if reduction <= config.function_tolerance {
            break Termination::FunctionTolerance;
        }
    };

    Ok(OptimizeReport {
        params: x,
        value: f,
        gradient: g,
        iterations,
        evaluations,
        termination,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
