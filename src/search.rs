//! Randomized hyperparameter search with cross-validation.

use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::r2_score;
use crate::models::{EstimatorKind, HyperParams, ParamValue, Regressor};

/// How the training matrix is folded during search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvStrategy {
    /// Contiguous, unshuffled folds; each fold is the test block once.
    KFold(usize),
    /// Expanding window: training always precedes the test block.
    TimeSeries(usize),
}

impl Default for CvStrategy {
    fn default() -> Self {
        Self::KFold(5)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Range<usize>,
}

impl CvStrategy {
    pub fn folds(&self, n_samples: usize) -> Result<Vec<Fold>> {
        match *self {
            Self::KFold(k) => {
                if k < 2 || n_samples < k {
                    return Err(PipelineError::OptimizationDegenerate(format!(
                        "cannot make {k} folds from {n_samples} rows"
                    )));
                }
                let base = n_samples / k;
                let extra = n_samples % k;
                let mut start = 0;
                Ok((0..k)
                    .map(|i| {
                        let size = base + usize::from(i < extra);
                        let test = start..start + size;
                        start += size;
                        let train = (0..test.start).chain(test.end..n_samples).collect();
                        Fold { train, test }
                    })
                    .collect())
            }
            Self::TimeSeries(k) => {
                let test_size = n_samples / (k + 1);
                if k < 2 || test_size == 0 {
                    return Err(PipelineError::OptimizationDegenerate(format!(
                        "cannot make {k} time-series folds from {n_samples} rows"
                    )));
                }
                Ok((0..k)
                    .map(|i| {
                        let train_end = n_samples - (k - i) * test_size;
                        Fold {
                            train: (0..train_end).collect(),
                            test: train_end..train_end + test_size,
                        }
                    })
                    .collect())
            }
        }
    }
}

/// Candidate values for one hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValues {
    Ints(Vec<i64>),
    /// Integers where `None` means "unbounded" (e.g. `max_depth`).
    OptionalInts(Vec<Option<i64>>),
    Floats(Vec<f64>),
    Bools(Vec<bool>),
    Choices(Vec<String>),
}

impl ParamValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Ints(v) => v.len(),
            Self::OptionalInts(v) => v.len(),
            Self::Floats(v) => v.len(),
            Self::Bools(v) => v.len(),
            Self::Choices(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, i: usize) -> ParamValue {
        match self {
            Self::Ints(v) => ParamValue::Int(v[i]),
            Self::OptionalInts(v) => v[i].map_or(ParamValue::Null, ParamValue::Int),
            Self::Floats(v) => ParamValue::Float(v[i]),
            Self::Bools(v) => ParamValue::Bool(v[i]),
            Self::Choices(v) => ParamValue::Text(v[i].clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSpace(pub BTreeMap<String, ParamValues>);

impl SearchSpace {
    pub fn with(mut self, name: &str, values: ParamValues) -> Self {
        self.0.insert(name.to_string(), values);
        self
    }

    pub fn for_estimator(kind: EstimatorKind, n_features: usize) -> Self {
        match kind {
            EstimatorKind::RandomForest => Self::default_forest(n_features),
            EstimatorKind::GradientBoosting => Self::default_boosting(),
        }
    }

    pub fn default_forest(n_features: usize) -> Self {
        let leaf_sizes: Vec<i64> = (1..n_features.max(2) as i64).collect();
        Self::default()
            .with("n_estimators", ParamValues::Ints((20..200).step_by(20).collect()))
            .with("max_depth", ParamValues::OptionalInts(vec![Some(3), None]))
            .with("min_samples_split", ParamValues::Ints(vec![2, 5, 10, 20, 50]))
            .with(
                "max_features",
                ParamValues::Choices(vec!["auto".into(), "sqrt".into(), "log2".into()]),
            )
            .with("bootstrap", ParamValues::Bools(vec![true, false]))
            .with("min_samples_leaf", ParamValues::Ints(leaf_sizes))
    }

    pub fn default_boosting() -> Self {
        Self::default()
            .with("n_estimators", ParamValues::Ints((20..200).step_by(20).collect()))
            .with("max_depth", ParamValues::Ints(vec![3, 6]))
            .with("learning_rate", ParamValues::Floats(vec![0.05, 0.1, 0.2]))
            .with("min_samples_leaf", ParamValues::Ints(vec![1, 5, 10, 20, 50]))
    }

    /// Number of distinct combinations, or `None` if it does not fit in `usize`.
    pub fn grid_size(&self) -> Option<usize> {
        self.0
            .values()
            .try_fold(1usize, |acc, values| acc.checked_mul(values.len()))
    }

    fn combination(&self, mut index: usize) -> HyperParams {
        self.0
            .iter()
            .map(|(name, values)| {
                let pick = index % values.len();
                index /= values.len();
                (name.clone(), values.value(pick))
            })
            .collect()
    }

    /// Draws up to `n_iter` distinct combinations; the draw depends only on `seed`.
    pub fn sample(&self, n_iter: usize, seed: u64) -> Result<Vec<HyperParams>> {
        if let Some((name, _)) = self.0.iter().find(|(_, values)| values.is_empty()) {
            return Err(PipelineError::OptimizationDegenerate(format!(
                "search space for `{name}` is empty"
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        match self.grid_size() {
            Some(grid) => {
                if n_iter > grid {
                    warn!(n_iter, grid, "search space is smaller than n_iter, trying every combination");
                }
                Ok(sample(&mut rng, grid, n_iter.min(grid))
                    .into_iter()
                    .map(|i| self.combination(i))
                    .collect())
            }
            None => {
                let mut seen = HashSet::new();
                let mut picks = Vec::with_capacity(n_iter);
                while picks.len() < n_iter {
                    let choice: Vec<usize> = self
                        .0
                        .values()
                        .map(|values| rng.gen_range(0..values.len()))
                        .collect();
                    if seen.insert(choice.clone()) {
                        picks.push(
                            self.0
                                .iter()
                                .zip(&choice)
                                .map(|((name, values), &i)| (name.clone(), values.value(i)))
                                .collect(),
                        );
                    }
                }
                Ok(picks)
            }
        }
    }
}

pub struct SearchOutcome {
    /// The winning estimator, refit on the full training matrix.
    pub estimator: Box<dyn Regressor>,
    pub params: HyperParams,
    /// Mean cross-validated R² of the winner.
    pub score: f64,
    pub n_evaluated: usize,
}

#[derive(Debug, Clone)]
pub struct RandomizedSearch {
    pub kind: EstimatorKind,
    pub space: SearchSpace,
    pub n_iter: usize,
    pub cv: CvStrategy,
    pub seed: u64,
    /// Seed handed to every candidate estimator.
    pub model_seed: u64,
}

impl RandomizedSearch {
    pub fn new(kind: EstimatorKind, space: SearchSpace) -> Self {
        Self {
            kind,
            space,
            n_iter: 100,
            cv: CvStrategy::default(),
            seed: 40,
            model_seed: 0,
        }
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_cv(mut self, cv: CvStrategy) -> Self {
        self.cv = cv;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_model_seed(mut self, seed: u64) -> Self {
        self.model_seed = seed;
        self
    }

    #[instrument(skip_all, fields(kind = ?self.kind, n_iter = self.n_iter, cv = ?self.cv))]
    pub fn fit(&self, features: ArrayView2<f64>, targets: ArrayView1<f64>) -> Result<SearchOutcome> {
        let candidates = self.space.sample(self.n_iter, self.seed)?;
        // Reject malformed combinations up front instead of scoring them as NaN.
        for params in &candidates {
            self.kind.build(params, self.model_seed)?;
        }
        let folds = self.cv.folds(features.nrows())?;

        let jobs: Vec<(usize, usize)> = (0..candidates.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let fold_scores: Vec<f64> = jobs
            .par_iter()
            .map(|&(c, f)| self.score_fold(&candidates[c], &folds[f], features, targets))
            .collect();

        let mut best: Option<(usize, f64)> = None;
        for (c, scores) in fold_scores.chunks(folds.len()).enumerate() {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            debug!(candidate = c, mean_r2 = mean, params = ?candidates[c], "candidate scored");
            if mean.is_finite() && best.map_or(true, |(_, score)| mean > score) {
                best = Some((c, mean));
            }
        }
        let (winner, score) = best.ok_or_else(|| {
            PipelineError::OptimizationDegenerate(
                "no parameter combination produced a finite cross-validated score".to_string(),
            )
        })?;

        let params = candidates[winner].clone();
        let mut estimator = self.kind.build(&params, self.model_seed)?;
        estimator.fit(features, targets)?;
        info!(score, n_evaluated = candidates.len(), params = ?params, "randomized search finished");
        Ok(SearchOutcome {
            estimator,
            params,
            score,
            n_evaluated: candidates.len(),
        })
    }

    fn score_fold(
        &self,
        params: &HyperParams,
        fold: &Fold,
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
    ) -> f64 {
        let run = || -> Result<f64> {
            let mut estimator = self.kind.build(params, self.model_seed)?;
            let x_train = features.select(Axis(0), &fold.train);
            let y_train = targets.select(Axis(0), &fold.train);
            estimator.fit(x_train.view(), y_train.view())?;
            let x_test = features.slice(ndarray::s![fold.test.clone(), ..]);
            let predicted = estimator.predict(x_test)?;
            let truth: Vec<f64> = targets.slice(ndarray::s![fold.test.clone()]).to_vec();
            r2_score(&truth, &predicted).map_err(|e| PipelineError::Model(e.to_string()))
        };
        run().unwrap_or_else(|e| {
            debug!(error = %e, "fold could not be scored");
            f64::NAN
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    #[test]
    fn kfold_blocks_cover_every_row_once() {
        let folds = CvStrategy::KFold(3).folds(10).unwrap();
        let tests: Vec<_> = folds.iter().map(|f| f.test.clone()).collect();
        assert_eq!(tests, vec![0..4, 4..7, 7..10]);
        assert_eq!(folds[1].train, vec![0, 1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn time_series_folds_train_before_test() {
        let folds = CvStrategy::TimeSeries(3).folds(12).unwrap();
        let tests: Vec<_> = folds.iter().map(|f| f.test.clone()).collect();
        assert_eq!(tests, vec![3..6, 6..9, 9..12]);
        for fold in &folds {
            assert_eq!(*fold.train.last().unwrap() + 1, fold.test.start);
        }
    }

    #[test]
    fn too_few_rows_for_folds() {
        assert!(CvStrategy::KFold(5).folds(3).is_err());
        assert!(CvStrategy::TimeSeries(4).folds(4).is_err());
    }

    #[test]
    fn sampling_is_unique_and_seeded() {
        let space = SearchSpace::default_forest(6);
        let a = space.sample(25, 40).unwrap();
        let b = space.sample(25, 40).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 25);
        for (i, x) in a.iter().enumerate() {
            assert!(a[i + 1..].iter().all(|y| y != x));
        }
    }

    #[test]
    fn small_space_is_exhausted() {
        let space = SearchSpace::default()
            .with("n_estimators", ParamValues::Ints(vec![5, 10]))
            .with("bootstrap", ParamValues::Bools(vec![true, false]));
        assert_eq!(space.grid_size(), Some(4));
        assert_eq!(space.sample(100, 1).unwrap().len(), 4);
    }

    #[test]
    fn search_finds_a_good_forest() {
        let x = Array2::from_shape_fn((120, 2), |(i, j)| if j == 0 { (i % 40) as f64 } else { (i % 7) as f64 });
        let y = Array1::from_iter((0..120).map(|i| 2.0 * (i % 40) as f64));
        let space = SearchSpace::default()
            .with("n_estimators", ParamValues::Ints(vec![5, 10]))
            .with("max_depth", ParamValues::OptionalInts(vec![Some(1), None]));
        let outcome = RandomizedSearch::new(EstimatorKind::RandomForest, space)
            .with_n_iter(4)
            .with_cv(CvStrategy::KFold(3))
            .fit(x.view(), y.view())
            .unwrap();
        assert_eq!(outcome.n_evaluated, 4);
        assert_eq!(outcome.params["max_depth"], ParamValue::Null);
        assert!(outcome.score > 0.9);
        assert!(outcome.estimator.feature_importances().is_some());
    }

    #[test]
    fn invalid_combination_fails_fast() {
        let space = SearchSpace::default().with(
            "max_features",
            ParamValues::Choices(vec!["everything".into()]),
        );
        let x = Array2::<f64>::zeros((10, 1));
        let y = Array1::<f64>::zeros(10);
        assert!(RandomizedSearch::new(EstimatorKind::RandomForest, space)
            .fit(x.view(), y.view())
            .is_err());
    }
}
