//! Gaussian-process Bayesian optimization over small integer/real boxes.

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::f64::consts::{PI, SQRT_2};
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, Result};

/// Exploration margin for expected improvement, in standardized units.
const EI_XI: f64 = 0.01;
const MIN_VARIANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dimension {
    /// Inclusive integer range.
    Integer { lo: i64, hi: i64 },
    Real { lo: f64, hi: f64 },
}

impl Dimension {
    fn validate(&self) -> Result<()> {
        let ok = match *self {
            Self::Integer { lo, hi } => lo <= hi,
            Self::Real { lo, hi } => lo.is_finite() && hi.is_finite() && lo <= hi,
        };
        if ok {
            Ok(())
        } else {
            Err(PipelineError::OptimizationDegenerate(format!(
                "empty search dimension {self:?}"
            )))
        }
    }

    fn bounds(&self) -> (f64, f64) {
        match *self {
            Self::Integer { lo, hi } => (lo as f64, hi as f64),
            Self::Real { lo, hi } => (lo, hi),
        }
    }

    fn from_unit(&self, u: f64) -> f64 {
        let (lo, hi) = self.bounds();
        let value = lo + u.clamp(0.0, 1.0) * (hi - lo);
        match self {
            Self::Integer { .. } => value.round().clamp(lo, hi),
            Self::Real { .. } => value,
        }
    }

    fn to_unit(&self, value: f64) -> f64 {
        let (lo, hi) = self.bounds();
        if hi > lo {
            (value - lo) / (hi - lo)
        } else {
            0.0
        }
    }
}

/// One objective call. `value` is `None` when the objective failed or returned a non-finite number.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub point: Vec<f64>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub best: Vec<f64>,
    pub best_value: f64,
    pub history: Vec<Evaluation>,
}

/// Minimizes a black-box objective: seeded random starts, then expected improvement
/// under a Gaussian-process surrogate.
#[derive(Debug, Clone)]
pub struct BayesianOptimizer {
    /// Total objective calls, including the initial random points.
    pub n_calls: usize,
    pub n_initial: usize,
    pub seed: u64,
    /// RBF length scale on the unit cube.
    pub length_scale: f64,
    /// Observation noise added to the kernel diagonal (standardized units).
    pub noise: f64,
    /// Random points scored by the acquisition function per iteration.
    pub n_candidates: usize,
}

impl Default for BayesianOptimizer {
    fn default() -> Self {
        Self {
            n_calls: 40,
            n_initial: 10,
            seed: 30,
            length_scale: 0.3,
            noise: 1e-4,
            n_candidates: 1000,
        }
    }
}

impl BayesianOptimizer {
    pub fn new(n_calls: usize, n_initial: usize, seed: u64) -> Self {
        Self {
            n_calls,
            n_initial,
            seed,
            ..Self::default()
        }
    }

    #[instrument(skip_all, fields(n_calls = self.n_calls, n_initial = self.n_initial, dims = dimensions.len()))]
    pub fn minimize<F>(&self, dimensions: &[Dimension], objective: F) -> Result<OptimizeOutcome>
    where
        F: Fn(&[f64]) -> Result<f64> + Sync,
    {
        if dimensions.is_empty() {
            return Err(PipelineError::OptimizationDegenerate(
                "no dimensions to optimize".to_string(),
            ));
        }
        for dim in dimensions {
            dim.validate()?;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let n_initial = self.n_initial.clamp(1, self.n_calls.max(1));

        let mut initial: Vec<Vec<f64>> = Vec::with_capacity(n_initial);
        for _ in 0..n_initial {
            let point = random_point(dimensions, &mut rng);
            if !initial.contains(&point) {
                initial.push(point);
            }
        }
        let mut history: Vec<Evaluation> = initial
            .into_par_iter()
            .map(|point| evaluate(&objective, point))
            .collect();

        while history.len() < self.n_calls {
            let Some(point) = self.suggest(dimensions, &history, &mut rng) else {
                debug!(evaluated = history.len(), "no unexplored candidate left");
                break;
            };
            let evaluation = evaluate(&objective, point);
            debug!(point = ?evaluation.point, value = ?evaluation.value, "objective evaluated");
            history.push(evaluation);
        }

        let (best, best_value) = history
            .iter()
            .filter_map(|e| e.value.map(|v| (e, v)))
            .fold(None, |acc: Option<(&Evaluation, f64)>, (e, v)| match acc {
                Some((_, best)) if best <= v => acc,
                _ => Some((e, v)),
            })
            .map(|(e, v)| (e.point.clone(), v))
            .ok_or_else(|| {
                PipelineError::OptimizationDegenerate(format!(
                    "all {} objective evaluations failed",
                    history.len()
                ))
            })?;
        info!(?best, best_value, n_evaluated = history.len(), "bayesian search finished");
        Ok(OptimizeOutcome {
            best,
            best_value,
            history,
        })
    }

    fn suggest(
        &self,
        dimensions: &[Dimension],
        history: &[Evaluation],
        rng: &mut ChaCha8Rng,
    ) -> Option<Vec<f64>> {
        let observed: Vec<(Vec<f64>, f64)> = history
            .iter()
            .filter_map(|e| {
                e.value.map(|v| {
                    let unit = e.point.iter().zip(dimensions).map(|(x, d)| d.to_unit(*x)).collect();
                    (unit, v)
                })
            })
            .collect();
        let surrogate = if observed.is_empty() {
            None
        } else {
            GaussianProcess::fit(&observed, self.length_scale, self.noise)
        };
        if surrogate.is_none() {
            warn!("surrogate unavailable, falling back to random search");
        }

        let mut best: Option<(Vec<f64>, f64)> = None;
        for _ in 0..self.n_candidates.max(1) {
            let point = random_point(dimensions, rng);
            if history.iter().any(|e| e.point == point) {
                continue;
            }
            let score = match &surrogate {
                Some(gp) => {
                    let unit: Vec<f64> = point.iter().zip(dimensions).map(|(x, d)| d.to_unit(*x)).collect();
                    gp.expected_improvement(&unit)
                }
                None => rng.gen::<f64>(),
            };
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((point, score));
            }
        }
        best.map(|(point, _)| point)
    }
}

fn random_point(dimensions: &[Dimension], rng: &mut ChaCha8Rng) -> Vec<f64> {
    dimensions.iter().map(|d| d.from_unit(rng.gen::<f64>())).collect()
}

fn evaluate<F>(objective: &F, point: Vec<f64>) -> Evaluation
where
    F: Fn(&[f64]) -> Result<f64> + Sync,
{
    let value = match objective(&point) {
        Ok(v) if v.is_finite() => Some(v),
        Ok(v) => {
            warn!(?point, value = v, "objective returned a non-finite value");
            None
        }
        Err(e) => {
            warn!(?point, error = %e, "objective evaluation failed");
            None
        }
    };
    Evaluation { point, value }
}

/// RBF-kernel GP on unit-cube inputs with standardized targets.
struct GaussianProcess {
    points: Vec<Vec<f64>>,
    /// Lower Cholesky factor of the kernel matrix.
    chol: Array2<f64>,
    alpha: Array1<f64>,
    length_scale: f64,
    best_standardized: f64,
}

impl GaussianProcess {
    fn fit(observed: &[(Vec<f64>, f64)], length_scale: f64, noise: f64) -> Option<Self> {
        let n = observed.len();
        let mean = observed.iter().map(|(_, y)| y).sum::<f64>() / n as f64;
        let var = observed.iter().map(|(_, y)| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let scale = if var > 0.0 { var.sqrt() } else { 1.0 };
        let y = Array1::from_iter(observed.iter().map(|(_, y)| (y - mean) / scale));
        let points: Vec<Vec<f64>> = observed.iter().map(|(p, _)| p.clone()).collect();

        let mut jitter = noise.max(1e-10);
        let chol = loop {
            let kernel = Array2::from_shape_fn((n, n), |(i, j)| {
                rbf(&points[i], &points[j], length_scale) + if i == j { jitter } else { 0.0 }
            });
            if let Some(l) = cholesky(&kernel) {
                break l;
            }
            jitter *= 10.0;
            if jitter > 1.0 {
                return None;
            }
        };
        let alpha = back_substitute(&chol, &forward_substitute(&chol, &y));
        let best_standardized = y.iter().copied().fold(f64::INFINITY, f64::min);
        Some(Self {
            points,
            chol,
            alpha,
            length_scale,
            best_standardized,
        })
    }

    fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star = Array1::from_iter(self.points.iter().map(|p| rbf(p, x, self.length_scale)));
        let mean = k_star.dot(&self.alpha);
        let v = forward_substitute(&self.chol, &k_star);
        let variance = (1.0 - v.dot(&v)).max(MIN_VARIANCE);
        (mean, variance.sqrt())
    }

    /// Expected improvement for minimization.
    fn expected_improvement(&self, x: &[f64]) -> f64 {
        let (mean, std) = self.predict(x);
        let improvement = self.best_standardized - mean - EI_XI;
        let z = improvement / std;
        let pdf = (-0.5 * z * z).exp() / (2.0 * PI).sqrt();
        let cdf = 0.5 * (1.0 + erf(z / SQRT_2));
        improvement * cdf + std * pdf
    }
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-sq / (2.0 * length_scale * length_scale)).exp()
}

fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let d = a[[i, i]] - sum;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[[i, j]] = d.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solves `L x = b` for lower-triangular `L`.
fn forward_substitute(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[[i, k]] * x[k]).sum();
        x[i] = (b[i] - sum) / l[[i, i]];
    }
    x
}

/// Solves `Lᵀ x = b` for lower-triangular `L`.
fn back_substitute(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[[k, i]] * x[k]).sum();
        x[i] = (b[i] - sum) / l[[i, i]];
    }
    x
}

/// Abramowitz-Stegun approximation, max error 1.5e-7.
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn finds_the_minimum_of_a_bowl() {
        let dims = [
            Dimension::Real { lo: -5.0, hi: 5.0 },
            Dimension::Integer { lo: -10, hi: 10 },
        ];
        let outcome = BayesianOptimizer::new(30, 8, 3)
            .minimize(&dims, |p| Ok((p[0] - 1.0).powi(2) + (p[1] + 2.0).powi(2)))
            .unwrap();
        assert!(outcome.best_value < 2.0, "best {:?}", outcome);
        assert!(outcome.history.len() <= 30);
        assert_eq!(outcome.best[1].fract(), 0.0);
    }

    #[test]
    fn same_seed_same_history() {
        let dims = [Dimension::Integer { lo: 0, hi: 50 }];
        let objective = |p: &[f64]| Ok((p[0] - 17.0).abs());
        let a = BayesianOptimizer::new(12, 4, 9).minimize(&dims, objective).unwrap();
        let b = BayesianOptimizer::new(12, 4, 9).minimize(&dims, objective).unwrap();
        assert_eq!(a.history, b.history);
    }

    #[test]
    fn failed_evaluations_never_win() {
        let dims = [Dimension::Integer { lo: 0, hi: 20 }];
        let outcome = BayesianOptimizer::new(15, 5, 1)
            .minimize(&dims, |p| {
                if p[0] < 10.0 {
                    Err(PipelineError::Model("boom".to_string()))
                } else {
                    Ok(p[0])
                }
            })
            .unwrap();
        assert!(outcome.best[0] >= 10.0);
        assert_eq!(outcome.best_value, outcome.best[0]);
    }

    #[test]
    fn all_failures_are_degenerate() {
        let dims = [Dimension::Real { lo: 0.0, hi: 1.0 }];
        let result = BayesianOptimizer::new(5, 2, 0)
            .minimize(&dims, |_| Err(PipelineError::Model("never".to_string())));
        assert!(matches!(result, Err(PipelineError::OptimizationDegenerate(_))));
    }

    #[test]
    fn integer_space_is_not_revisited() {
        let dims = [Dimension::Integer { lo: 0, hi: 3 }];
        let outcome = BayesianOptimizer::new(20, 2, 5)
            .minimize(&dims, |p| Ok(p[0]))
            .unwrap();
        assert!(outcome.history.len() <= 4);
        assert_eq!(outcome.best, vec![0.0]);
    }

    #[test]
    fn erf_matches_known_values() {
        assert_relative_eq!(erf(0.0), 0.0, epsilon = 1e-7);
        assert_relative_eq!(erf(1.0), 0.842_700_79, epsilon = 1e-6);
        assert_relative_eq!(erf(-1.0), -0.842_700_79, epsilon = 1e-6);
    }

    #[test]
    fn gp_interpolates_observations() {
        let observed = vec![(vec![0.0], 1.0), (vec![0.5], -1.0), (vec![1.0], 2.0)];
        let gp = GaussianProcess::fit(&observed, 0.3, 1e-8).unwrap();
        let (mean, std) = gp.predict(&[0.5]);
        assert!(mean < -0.5);
        assert!(std < 0.05);
    }
}
