use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};
use crate::lag::collapse_lag_name;
use crate::metrics::r2_score;
use crate::models::Regressor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub column: String,
    pub importance: f64,
    pub std: f64,
}

/// Importances the estimator computed while fitting, if it has any.
pub fn builtin_importance(estimator: &dyn Regressor, columns: &[String]) -> Option<Vec<FeatureImportance>> {
    let values = estimator.feature_importances()?;
    if values.len() != columns.len() {
        return None;
    }
    Some(
        columns
            .iter()
            .zip(values)
            .map(|(column, importance)| FeatureImportance {
                column: column.clone(),
                importance,
                std: 0.0,
            })
            .collect(),
    )
}

/// Mean relative drop in R² when one column is shuffled, over `n_repeats` seeded shuffles.
///
/// Each drop is `(baseline - shuffled) / baseline`. A zero or undefined baseline leaves
/// the drop unscaled.
#[instrument(skip_all, fields(n_columns = columns.len(), n_repeats = n_repeats))]
pub fn permutation_importance(
    estimator: &dyn Regressor,
    features: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    columns: &[String],
    n_repeats: usize,
    seed: u64,
) -> Result<Vec<FeatureImportance>> {
    if columns.len() != features.ncols() {
        return Err(PipelineError::Model(format!(
            "{} column names for {} features",
            columns.len(),
            features.ncols()
        )));
    }
    let truth = targets.to_vec();
    let score = |x: ArrayView2<f64>| -> Result<f64> {
        let predicted = estimator.predict(x)?;
        Ok(r2_score(&truth, &predicted).unwrap_or(f64::NAN))
    };
    let baseline = score(features)?;
    let relative_drop = |shuffled: f64| {
        if baseline.is_finite() && baseline != 0.0 {
            (baseline - shuffled) / baseline
        } else {
            baseline - shuffled
        }
    };
    let n_repeats = n_repeats.max(1);

    columns
        .par_iter()
        .enumerate()
        .map(|(j, column)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(j as u64));
            let mut shuffled = features.to_owned();
            let mut drops = Vec::with_capacity(n_repeats);
            for _ in 0..n_repeats {
                let mut values = features.column(j).to_vec();
                values.shuffle(&mut rng);
                shuffled
                    .index_axis_mut(Axis(1), j)
                    .iter_mut()
                    .zip(values)
                    .for_each(|(cell, v)| *cell = v);
                drops.push(relative_drop(score(shuffled.view())?));
            }
            let mean = drops.iter().sum::<f64>() / n_repeats as f64;
            let var = drops.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n_repeats as f64;
            debug!(column = %column, importance = mean, "permutation importance");
            Ok(FeatureImportance {
                column: column.clone(),
                importance: mean,
                std: var.sqrt(),
            })
        })
        .collect()
}

/// Built-in importances when the estimator has them, otherwise permutation importance.
/// Sorted from most to least important.
pub fn feature_importance(
    estimator: &dyn Regressor,
    features: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    columns: &[String],
    n_repeats: usize,
    seed: u64,
) -> Result<Vec<FeatureImportance>> {
    let mut importances = match builtin_importance(estimator, columns) {
        Some(importances) => importances,
        None => permutation_importance(estimator, features, targets, columns, n_repeats, seed)?,
    };
    sort_descending(&mut importances);
    Ok(importances)
}

/// Sums the importance of every `<col>_lag_<k>` into `<col>`.
pub fn collapse_lag_importance(importances: &[FeatureImportance]) -> Vec<FeatureImportance> {
    let mut grouped: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for item in importances {
        let entry = grouped.entry(collapse_lag_name(&item.column)).or_default();
        entry.0 += item.importance;
        entry.1 += item.std * item.std;
    }
    let mut collapsed: Vec<FeatureImportance> = grouped
        .into_iter()
        .map(|(column, (importance, var))| FeatureImportance {
            column: column.to_string(),
            importance,
            std: var.sqrt(),
        })
        .collect();
    sort_descending(&mut collapsed);
    collapsed
}

/// Column names ordered from least to most important.
pub fn least_important_first(importances: &[FeatureImportance]) -> Vec<String> {
    let mut sorted = importances.to_vec();
    sorted.sort_by(|a, b| a.importance.total_cmp(&b.importance));
    sorted.into_iter().map(|item| item.column).collect()
}

pub fn save_importance(path: &Path, importances: &[FeatureImportance]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(importances)?)?;
    Ok(())
}

fn sort_descending(importances: &mut [FeatureImportance]) {
    importances.sort_by(|a, b| b.importance.total_cmp(&a.importance));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoostingParams, ForestParams, GradientBoostingRegressor, RandomForestRegressor};
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2};

    fn data() -> (Array2<f64>, Array1<f64>, Vec<String>) {
        let x = Array2::from_shape_fn((150, 2), |(i, j)| if j == 0 { (i % 30) as f64 } else { (i % 4) as f64 });
        let y = Array1::from_iter((0..150).map(|i| 3.0 * (i % 30) as f64));
        (x, y, vec!["signal".to_string(), "filler".to_string()])
    }

    fn item(column: &str, importance: f64) -> FeatureImportance {
        FeatureImportance {
            column: column.to_string(),
            importance,
            std: 0.0,
        }
    }

    #[test]
    fn forest_uses_builtin_importance() {
        let (x, y, columns) = data();
        let mut forest = RandomForestRegressor::new(
            ForestParams {
                n_estimators: 5,
                ..ForestParams::default()
            },
            1,
        );
        forest.fit(x.view(), y.view()).unwrap();
        let importances = feature_importance(&forest, x.view(), y.view(), &columns, 3, 0).unwrap();
        assert_eq!(importances[0].column, "signal");
        assert_eq!(importances[0].std, 0.0);
    }

    #[test]
    fn boosting_falls_back_to_permutation() {
        let (x, y, columns) = data();
        let mut model = GradientBoostingRegressor::new(BoostingParams {
            n_estimators: 30,
            max_depth: 3,
            learning_rate: 0.3,
            min_samples_leaf: 1,
        });
        model.fit(x.view(), y.view()).unwrap();
        let importances = feature_importance(&model, x.view(), y.view(), &columns, 5, 7).unwrap();
        assert_eq!(importances[0].column, "signal");
        assert!(importances[0].importance > 0.5);
        assert!(importances[1].importance.abs() < 0.1);
    }

    #[test]
    fn permutation_drop_is_scaled_by_the_baseline() {
        let (x, y, columns) = data();
        let mut model = GradientBoostingRegressor::new(BoostingParams {
            n_estimators: 5,
            max_depth: 2,
            learning_rate: 0.3,
            min_samples_leaf: 1,
        });
        model.fit(x.view(), y.view()).unwrap();
        let truth = y.to_vec();
        let baseline = r2_score(&truth, &model.predict(x.view()).unwrap()).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut values = x.column(0).to_vec();
        values.shuffle(&mut rng);
        let mut shuffled = x.clone();
        shuffled.column_mut(0).assign(&Array1::from(values));
        let permuted = r2_score(&truth, &model.predict(shuffled.view()).unwrap()).unwrap();

        let importances = permutation_importance(&model, x.view(), y.view(), &columns, 1, 11).unwrap();
        assert_eq!(importances[0].column, "signal");
        assert_relative_eq!(importances[0].importance, (baseline - permuted) / baseline, epsilon = 1e-12);
    }

    #[test]
    fn lag_importances_collapse_onto_origin() {
        let collapsed = collapse_lag_importance(&[
            item("PM2.5", 0.1),
            item("PM2.5_lag_1", 0.3),
            item("PM2.5_lag_5", 0.2),
            item("fire_0_100_lag_2", 0.15),
            item("fire_0_100", 0.05),
            item("Humidity(%)", 0.2),
        ]);
        assert_eq!(collapsed.len(), 3);
        assert_eq!(collapsed[0].column, "PM2.5");
        assert_relative_eq!(collapsed[0].importance, 0.6);
        let fire = collapsed.iter().find(|c| c.column == "fire_0_100").unwrap();
        assert_relative_eq!(fire.importance, 0.2);
    }

    #[test]
    fn least_important_comes_first() {
        let order = least_important_first(&[item("a", 0.5), item("b", 0.1), item("c", 0.4)]);
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
