//! Greedy backward elimination of feature columns.
//!
//! The result depends on candidate order: each candidate is judged against the set left by
//! the decisions before it, and a dropped column is never reconsidered.

use std::collections::HashSet;
use tracing::{debug, info, instrument};

use crate::dataset::{FeatureTable, IndexSlice};
use crate::error::Result;
use crate::metrics::r2_score;
use crate::models::Regressor;

pub struct PruneOutcome {
    pub columns: Vec<String>,
    /// Estimator fit on the training block with `columns`.
    pub estimator: Box<dyn Regressor>,
    pub baseline_score: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GreedyColumnPruner {
    exempt: HashSet<String>,
}

impl GreedyColumnPruner {
    pub fn new<I, S>(exempt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exempt: exempt.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_exempt(&self, column: &str) -> bool {
        self.exempt.contains(column)
    }

    /// Tries dropping each candidate in turn and keeps a drop only when validation R²
    /// strictly improves.
    #[instrument(skip_all, fields(n_columns = columns.len(), n_candidates = candidates.len()))]
    pub fn prune(
        &self,
        table: &FeatureTable,
        columns: &[String],
        candidates: &[String],
        mut estimator: Box<dyn Regressor>,
        train: &IndexSlice,
        val: &IndexSlice,
    ) -> Result<PruneOutcome> {
        let mut kept = columns.to_vec();
        let baseline_score = validation_score(table, &kept, estimator.as_mut(), train, val)?;
        let mut current = baseline_score;

        for candidate in candidates {
            if self.is_exempt(candidate) || kept.len() <= 1 {
                continue;
            }
            let Some(position) = kept.iter().position(|c| c == candidate) else {
                continue;
            };
            let mut trial = kept.clone();
            trial.remove(position);
            let score = validation_score(table, &trial, estimator.as_mut(), train, val)?;
            debug!(column = %candidate, current, without = score, "pruning candidate scored");
            if score > current {
                kept = trial;
                current = score;
            }
        }

        let score = validation_score(table, &kept, estimator.as_mut(), train, val)?;
        info!(
            baseline_score,
            score,
            removed = columns.len() - kept.len(),
            kept = kept.len(),
            "column pruning finished"
        );
        Ok(PruneOutcome {
            columns: kept,
            estimator,
            baseline_score,
            score,
        })
    }
}

/// Fits on `train` and returns R² on `val`; a degenerate metric comes back as NaN.
pub(crate) fn validation_score(
    table: &FeatureTable,
    columns: &[String],
    estimator: &mut dyn Regressor,
    train: &IndexSlice,
    val: &IndexSlice,
) -> Result<f64> {
    let (x_train, y_train) = table.matrix(train, columns)?;
    let (x_val, y_val) = table.matrix(val, columns)?;
    estimator.fit(x_train.view(), y_train.view())?;
    let predicted = estimator.predict(x_val.view())?;
    Ok(r2_score(&y_val.to_vec(), &predicted).unwrap_or(f64::NAN))
}
