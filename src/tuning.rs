//! Bayesian tuning of the fire and lag feature parameters.

use tracing::{info, instrument, warn};

use crate::bayes::{BayesianOptimizer, Dimension};
use crate::dataset::DatasetAssembler;
use crate::error::{PipelineError, Result};
use crate::fire::FireParameters;
use crate::lag::LagParameters;
use crate::models::Regressor;
use crate::pruning::validation_score;

pub const FIRE_SPLIT: [f64; 3] = [0.4, 0.3, 0.3];
pub const LAG_SPLIT: [f64; 3] = [0.45, 0.25, 0.3];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireSearchSpace {
    /// km/h
    pub wind_speed: (f64, f64),
    pub shift_hours: (i64, i64),
    pub rolling_window_hours: (i64, i64),
}

impl Default for FireSearchSpace {
    fn default() -> Self {
        Self {
            wind_speed: (2.0, 20.0),
            shift_hours: (-72, 72),
            rolling_window_hours: (24, 240),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagSearchSpace {
    pub max_lag: (i64, i64),
    pub step: (i64, i64),
}

impl Default for LagSearchSpace {
    fn default() -> Self {
        Self {
            max_lag: (2, 120),
            step: (1, 25),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuneOutcome<P> {
    pub params: P,
    /// Validation R² of `params`.
    pub score: f64,
    pub incumbent_kept: bool,
    pub n_evaluated: usize,
}

/// Keeps the incumbent unless the search found a strictly lower loss.
fn pick<P>(incumbent: Option<(P, f64)>, found: P, found_loss: f64, n_evaluated: usize) -> TuneOutcome<P> {
    match incumbent {
        Some((params, loss)) if loss <= found_loss => TuneOutcome {
            params,
            score: -loss,
            incumbent_kept: true,
            n_evaluated,
        },
        _ => TuneOutcome {
            params: found,
            score: -found_loss,
            incumbent_kept: false,
            n_evaluated,
        },
    }
}

fn fire_params(point: &[f64]) -> Result<FireParameters> {
    FireParameters::new(point[0], point[1] as i64, point[2].max(1.0) as usize)
}

fn lag_params(point: &[f64]) -> Result<LagParameters> {
    LagParameters::new(point[0].max(0.0) as usize, point[1].max(0.0) as usize, true)
}

/// Searches wind speed, shift and rolling window for the fire columns, with `columns`
/// (which should include the fire columns) as features and no lags.
#[instrument(skip_all, fields(n_columns = columns.len(), incumbent = ?incumbent))]
pub fn tune_fire(
    assembler: &DatasetAssembler,
    columns: &[String],
    estimator: &dyn Regressor,
    incumbent: &FireParameters,
    space: &FireSearchSpace,
    optimizer: &BayesianOptimizer,
) -> Result<TuneOutcome<FireParameters>> {
    let loss = |params: &FireParameters| -> Result<f64> {
        let table = assembler.build(columns, params, None)?;
        let split = table.split(&FIRE_SPLIT)?;
        let mut model = estimator.boxed_clone();
        Ok(-validation_score(&table, columns, model.as_mut(), &split[0], &split[1])?)
    };
    let incumbent_loss = loss(incumbent).unwrap_or_else(|e| {
        warn!(error = %e, "incumbent fire parameters could not be scored");
        f64::NAN
    });
    let dimensions = [
        Dimension::Real {
            lo: space.wind_speed.0,
            hi: space.wind_speed.1,
        },
        Dimension::Integer {
            lo: space.shift_hours.0,
            hi: space.shift_hours.1,
        },
        Dimension::Integer {
            lo: space.rolling_window_hours.0,
            hi: space.rolling_window_hours.1,
        },
    ];
    let outcome = optimizer.minimize(&dimensions, |point| loss(&fire_params(point)?))?;
    let found = fire_params(&outcome.best)?;
    let picked = pick(
        incumbent_loss.is_finite().then_some((*incumbent, incumbent_loss)),
        found,
        outcome.best_value,
        outcome.history.len() + 1,
    );
    info!(params = ?picked.params, score = picked.score, incumbent_kept = picked.incumbent_kept, "fire parameters tuned");
    Ok(picked)
}

/// Searches the lag range and step. Every evaluation rebuilds the lagged table and
/// re-splits it, since lagging changes the row count.
#[instrument(skip_all, fields(n_columns = base_columns.len(), incumbent = ?incumbent))]
pub fn tune_lag(
    assembler: &DatasetAssembler,
    base_columns: &[String],
    fire: &FireParameters,
    estimator: &dyn Regressor,
    incumbent: Option<&LagParameters>,
    space: &LagSearchSpace,
    optimizer: &BayesianOptimizer,
) -> Result<TuneOutcome<LagParameters>> {
    if space.max_lag.1 <= space.step.0 || space.max_lag.1 < 2 || space.step.1 < 1 {
        return Err(PipelineError::OptimizationDegenerate(format!(
            "lag search space {space:?} has no valid point"
        )));
    }
    let loss = |params: &LagParameters| -> Result<f64> {
        let table = assembler.build(base_columns, fire, Some(params))?;
        let split = table.split(&LAG_SPLIT)?;
        let mut model = estimator.boxed_clone();
        let columns = table.feature_columns();
        Ok(-validation_score(&table, &columns, model.as_mut(), &split[0], &split[1])?)
    };
    let incumbent_loss = incumbent.map(|params| {
        let value = loss(params).unwrap_or_else(|e| {
            warn!(error = %e, "incumbent lag parameters could not be scored");
            f64::NAN
        });
        (*params, value)
    });
    let dimensions = [
        Dimension::Integer {
            lo: space.max_lag.0.max(2),
            hi: space.max_lag.1,
        },
        Dimension::Integer {
            lo: space.step.0.max(1),
            hi: space.step.1,
        },
    ];
    let outcome = optimizer.minimize(&dimensions, |point| loss(&lag_params(point)?))?;
    let found = lag_params(&outcome.best)?;
    let picked = pick(
        incumbent_loss.filter(|(_, l)| l.is_finite()),
        found,
        outcome.best_value,
        outcome.history.len() + usize::from(incumbent.is_some()),
    );
    info!(params = ?picked.params, score = picked.score, incumbent_kept = picked.incumbent_kept, "lag parameters tuned");
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing::assembler;
    use crate::models::{ForestParams, RandomForestRegressor};

    fn forest() -> RandomForestRegressor {
        RandomForestRegressor::new(
            ForestParams {
                n_estimators: 5,
                max_depth: Some(5),
                ..ForestParams::default()
            },
            4,
        )
    }

    fn small_optimizer() -> BayesianOptimizer {
        BayesianOptimizer {
            n_candidates: 200,
            ..BayesianOptimizer::new(6, 3, 30)
        }
    }

    #[test]
    fn incumbent_wins_ties() {
        let kept = pick(Some(("old", -0.5)), "new", -0.5, 3);
        assert!(kept.incumbent_kept);
        assert_eq!(kept.params, "old");
        let replaced = pick(Some(("old", -0.5)), "new", -0.6, 3);
        assert_eq!(replaced.params, "new");
        assert_eq!(replaced.score, 0.6);
    }

    #[test]
    fn fire_tuning_never_does_worse_than_incumbent() {
        let assembler = assembler(600);
        let mut columns = vec!["Temperature(C)".to_string()];
        columns.extend(assembler.fire_columns());
        let incumbent = FireParameters::default();
        let outcome = tune_fire(
            &assembler,
            &columns,
            &forest(),
            &incumbent,
            &FireSearchSpace::default(),
            &small_optimizer(),
        )
        .unwrap();
        let table = assembler.build(&columns, &incumbent, None).unwrap();
        let split = table.split(&FIRE_SPLIT).unwrap();
        let incumbent_score =
            validation_score(&table, &columns, &mut forest(), &split[0], &split[1]).unwrap();
        assert!(outcome.score >= incumbent_score);
        assert!(outcome.params.validate().is_ok());
    }

    #[test]
    fn lag_tuning_returns_valid_parameters() {
        let assembler = assembler(500);
        let base = vec!["Temperature(C)".to_string()];
        let outcome = tune_lag(
            &assembler,
            &base,
            &FireParameters::default(),
            &forest(),
            None,
            &LagSearchSpace {
                max_lag: (2, 30),
                step: (1, 10),
            },
            &small_optimizer(),
        )
        .unwrap();
        assert!(!outcome.incumbent_kept);
        assert!(outcome.params.max_lag >= 2 && outcome.params.max_lag <= 30);
        assert!(outcome.params.step >= 1 && outcome.params.step <= 10);
        assert!(outcome.params.use_rolling);
    }

    #[test]
    fn empty_lag_space_is_degenerate() {
        let assembler = assembler(100);
        let result = tune_lag(
            &assembler,
            &[],
            &FireParameters::default(),
            &forest(),
            None,
            &LagSearchSpace {
                max_lag: (2, 3),
                step: (5, 10),
            },
            &small_optimizer(),
        );
        assert!(matches!(result, Err(PipelineError::OptimizationDegenerate(_))));
    }
}
