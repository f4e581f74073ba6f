//! Regression forest built from CART trees, grown in parallel.

use ndarray::{ArrayView1, ArrayView2};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, instrument};

use super::traits::{ModelFactory, Regressor};
use super::{
    unknown_params, usize_param, EstimatorKind, HyperParams, ParamValue, SavedModelRef,
};
use crate::error::{PipelineError, Result};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    /// Every feature is a split candidate at every node.
    #[default]
    Auto,
    Sqrt,
    Log2,
}

impl MaxFeatures {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" | "all" => Ok(Self::Auto),
            "sqrt" => Ok(Self::Sqrt),
            "log2" => Ok(Self::Log2),
            other => Err(PipelineError::Model(format!(
                "unknown max_features `{other}`"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Sqrt => "sqrt",
            Self::Log2 => "log2",
        }
    }

    fn resolve(self, n_features: usize) -> usize {
        let n = n_features as f64;
        let resolved = match self {
            Self::Auto => n_features,
            Self::Sqrt => n.sqrt().floor() as usize,
            Self::Log2 => n.log2().floor() as usize,
        };
        resolved.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Auto,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

#[derive(Debug, Clone, Copy)]
enum Branch {
    Left,
    Right,
}

struct PendingNode {
    rows: Range<usize>,
    depth: usize,
    parent: Option<(usize, Branch)>,
}

struct TreeBuilder<'a> {
    features: ArrayView2<'a, f64>,
    targets: ArrayView1<'a, f64>,
    params: &'a ForestParams,
    n_try: usize,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl<'a> TreeBuilder<'a> {
    /// Grows the tree depth first from an explicit work list, so unbounded depth never
    /// deepens the call stack. Left subtrees are finished before their right siblings.
    fn grow(&mut self, indices: &mut [usize], rng: &mut ChaCha8Rng) {
        let mut pending = vec![PendingNode {
            rows: 0..indices.len(),
            depth: 0,
            parent: None,
        }];
        while let Some(PendingNode { rows, depth, parent }) = pending.pop() {
            let node_rows = &mut indices[rows.clone()];
            let n = node_rows.len();
            let (sum, sum_sq) = node_rows.iter().fold((0.0, 0.0), |(s, sq), &i| {
                let y = self.targets[i];
                (s + y, sq + y * y)
            });
            let node_impurity = sum_sq - sum * sum / n as f64;
            let id = self.nodes.len();
            self.nodes.push(Node::Leaf {
                value: sum / n as f64,
            });
            if let Some((parent, branch)) = parent {
                self.attach(parent, branch, id);
            }

            let depth_reached = self.params.max_depth.is_some_and(|max| depth >= max);
            if depth_reached
                || n < self.params.min_samples_split.max(2)
                || n < 2 * self.params.min_samples_leaf
                || node_impurity <= MIN_GAIN
            {
                continue;
            }
            let Some(split) = self.best_split(node_rows, node_impurity, rng) else {
                continue;
            };

            let mut mid = 0;
            for k in 0..n {
                if self.features[[node_rows[k], split.feature]] <= split.threshold {
                    node_rows.swap(mid, k);
                    mid += 1;
                }
            }
            self.importances[split.feature] += split.gain;
            // Children are linked in by `attach` once they exist.
            self.nodes[id] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left: id,
                right: id,
            };
            pending.push(PendingNode {
                rows: rows.start + mid..rows.end,
                depth: depth + 1,
                parent: Some((id, Branch::Right)),
            });
            pending.push(PendingNode {
                rows: rows.start..rows.start + mid,
                depth: depth + 1,
                parent: Some((id, Branch::Left)),
            });
        }
    }

    fn attach(&mut self, parent: usize, branch: Branch, child: usize) {
        if let Node::Split { left, right, .. } = &mut self.nodes[parent] {
            match branch {
                Branch::Left => *left = child,
                Branch::Right => *right = child,
            }
        }
    }

    fn best_split(
        &self,
        indices: &[usize],
        node_impurity: f64,
        rng: &mut ChaCha8Rng,
    ) -> Option<SplitCandidate> {
        let n = indices.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let n_features = self.features.ncols();
        let mut best: Option<SplitCandidate> = None;
        let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(n);

        for feature in sample(rng, n_features, self.n_try).into_iter() {
            pairs.clear();
            pairs.extend(
                indices
                    .iter()
                    .map(|&i| (self.features[[i, feature]], self.targets[i])),
            );
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (total, total_sq) = pairs
                .iter()
                .fold((0.0, 0.0), |(s, sq), &(_, y)| (s + y, sq + y * y));
            let (mut left, mut left_sq) = (0.0, 0.0);
            for k in 0..n - 1 {
                let y = pairs[k].1;
                left += y;
                left_sq += y * y;
                if pairs[k].0 == pairs[k + 1].0 {
                    continue;
                }
                let n_left = (k + 1) as f64;
                let n_right = (n - k - 1) as f64;
                if k + 1 < min_leaf || n - k - 1 < min_leaf {
                    continue;
                }
                let right = total - left;
                let right_sq = total_sq - left_sq;
                let impurity =
                    (left_sq - left * left / n_left) + (right_sq - right * right / n_right);
                let gain = node_impurity - impurity;
                if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (pairs[k].0 + pairs[k + 1].0) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Bagged CART regression trees with impurity-based importances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    params: ForestParams,
    seed: u64,
    trees: Vec<RegressionTree>,
    importances: Vec<f64>,
    n_features: usize,
}

impl RandomForestRegressor {
    pub fn new(params: ForestParams, seed: u64) -> Self {
        Self {
            params,
            seed,
            trees: Vec::new(),
            importances: Vec::new(),
            n_features: 0,
        }
    }

    pub fn forest_params(&self) -> &ForestParams {
        &self.params
    }

    fn fit_tree(
        &self,
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        n_try: usize,
        seed: u64,
    ) -> (RegressionTree, Vec<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n_samples = features.nrows();
        let mut indices: Vec<usize> = if self.params.bootstrap {
            (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect()
        } else {
            (0..n_samples).collect()
        };
        let mut builder = TreeBuilder {
            features: features.view(),
            targets: targets.view(),
            params: &self.params,
            n_try,
            nodes: Vec::new(),
            importances: vec![0.0; features.ncols()],
        };
        builder.grow(&mut indices, &mut rng);
        let TreeBuilder {
            nodes,
            mut importances,
            ..
        } = builder;
        normalize(&mut importances);
        (RegressionTree { nodes }, importances)
    }
}

fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|v| *v /= total);
    }
}

impl Regressor for RandomForestRegressor {
    #[instrument(skip_all, fields(n_samples = features.nrows(), n_features = features.ncols()))]
    fn fit(&mut self, features: ArrayView2<f64>, targets: ArrayView1<f64>) -> Result<()> {
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(PipelineError::Model(format!(
                "cannot fit a forest on a {}x{} matrix",
                features.nrows(),
                features.ncols()
            )));
        }
        if features.nrows() != targets.len() {
            return Err(PipelineError::Model(format!(
                "{} feature rows but {} targets",
                features.nrows(),
                targets.len()
            )));
        }
        if features.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
            return Err(PipelineError::Model(
                "non-finite value in training data".to_string(),
            ));
        }
        if self.params.n_estimators == 0 {
            return Err(PipelineError::Model("n_estimators must be at least 1".to_string()));
        }

        let n_features = features.ncols();
        let n_try = self.params.max_features.resolve(n_features);
        let mut master_rng = ChaCha8Rng::seed_from_u64(self.seed);
        let tree_seeds: Vec<u64> = (0..self.params.n_estimators)
            .map(|_| master_rng.gen::<u64>())
            .collect();

        let fitted: Vec<(RegressionTree, Vec<f64>)> = tree_seeds
            .into_par_iter()
            .map(|seed| self.fit_tree(features, targets, n_try, seed))
            .collect();

        let mut importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(fitted.len());
        for (tree, tree_importances) in fitted {
            for (total, value) in importances.iter_mut().zip(&tree_importances) {
                *total += value;
            }
            trees.push(tree);
        }
        normalize(&mut importances);

        debug!(
            n_trees = trees.len(),
            n_try,
            total_nodes = trees.iter().map(|t| t.nodes.len()).sum::<usize>(),
            "forest fitted"
        );
        self.trees = trees;
        self.importances = importances;
        self.n_features = n_features;
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f64>) -> Result<Vec<f64>> {
        if self.trees.is_empty() {
            return Err(PipelineError::Model("forest is not fitted".to_string()));
        }
        if features.ncols() != self.n_features {
            return Err(PipelineError::Model(format!(
                "forest was fitted on {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }
        let n_trees = self.trees.len() as f64;
        Ok(features
            .outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        (!self.trees.is_empty()).then(|| self.importances.clone())
    }

    fn params(&self) -> HyperParams {
        let p = &self.params;
        HyperParams::from([
            ("n_estimators".to_string(), ParamValue::Int(p.n_estimators as i64)),
            (
                "max_depth".to_string(),
                p.max_depth
                    .map_or(ParamValue::Null, |d| ParamValue::Int(d as i64)),
            ),
            ("min_samples_split".to_string(), ParamValue::Int(p.min_samples_split as i64)),
            ("min_samples_leaf".to_string(), ParamValue::Int(p.min_samples_leaf as i64)),
            (
                "max_features".to_string(),
                ParamValue::Text(p.max_features.as_str().to_string()),
            ),
            ("bootstrap".to_string(), ParamValue::Bool(p.bootstrap)),
        ])
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::RandomForest
    }

    fn boxed_clone(&self) -> Box<dyn Regressor> {
        Box::new(Self::new(self.params.clone(), self.seed))
    }

    fn saved(&self) -> SavedModelRef<'_> {
        SavedModelRef::RandomForest(self)
    }
}

const KNOWN_PARAMS: [&str; 6] = [
    "n_estimators",
    "max_depth",
    "min_samples_split",
    "min_samples_leaf",
    "max_features",
    "bootstrap",
];

impl ModelFactory for RandomForestRegressor {
    fn create(params: &HyperParams, seed: u64) -> Result<Self> {
        unknown_params(params, &KNOWN_PARAMS)?;
        let defaults = ForestParams::default();
        let max_depth = match params.get("max_depth") {
            None | Some(ParamValue::Null) => None,
            Some(value) => Some(value.as_usize().ok_or_else(|| {
                PipelineError::Model(format!("`max_depth` must be an integer or null, got {value:?}"))
            })?),
        };
        let max_features = match params.get("max_features") {
            None => defaults.max_features,
            Some(ParamValue::Text(name)) => MaxFeatures::parse(name)?,
            Some(value) => {
                return Err(PipelineError::Model(format!(
                    "`max_features` must be a name, got {value:?}"
                )))
            }
        };
        let bootstrap = match params.get("bootstrap") {
            None => defaults.bootstrap,
            Some(ParamValue::Bool(flag)) => *flag,
            Some(value) => {
                return Err(PipelineError::Model(format!(
                    "`bootstrap` must be a bool, got {value:?}"
                )))
            }
        };
        let forest = ForestParams {
            n_estimators: usize_param(params, "n_estimators", defaults.n_estimators)?,
            max_depth,
            min_samples_split: usize_param(params, "min_samples_split", defaults.min_samples_split)?,
            min_samples_leaf: usize_param(params, "min_samples_leaf", defaults.min_samples_leaf)?,
            max_features,
            bootstrap,
        };
        Ok(Self::new(forest, seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::r2_score;
    use ndarray::{Array1, Array2};

    fn step_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        // y depends on the first column only; the second is noise-free filler.
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = Array1::from_iter((0..n).map(|i| if i < n / 2 { 1.0 } else { 10.0 }));
        (x, y)
    }

    fn small_forest(seed: u64) -> RandomForestRegressor {
        RandomForestRegressor::new(
            ForestParams {
                n_estimators: 10,
                ..ForestParams::default()
            },
            seed,
        )
    }

    #[test]
    fn learns_a_step_function() {
        let (x, y) = step_data(100);
        let mut forest = small_forest(1);
        forest.fit(x.view(), y.view()).unwrap();
        let pred = forest.predict(x.view()).unwrap();
        assert!(r2_score(y.as_slice().unwrap(), &pred).unwrap() > 0.95);
    }

    #[test]
    fn importance_goes_to_the_informative_column() {
        let (x, y) = step_data(100);
        let mut forest = small_forest(2);
        forest.fit(x.view(), y.view()).unwrap();
        let importances = forest.feature_importances().unwrap();
        assert_eq!(importances.len(), 2);
        assert!(importances[0] > importances[1]);
        approx::assert_relative_eq!(importances.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn same_seed_gives_identical_predictions() {
        let (x, y) = step_data(80);
        let mut a = small_forest(9);
        let mut b = small_forest(9);
        a.fit(x.view(), y.view()).unwrap();
        b.fit(x.view(), y.view()).unwrap();
        assert_eq!(a.predict(x.view()).unwrap(), b.predict(x.view()).unwrap());
    }

    #[test]
    fn max_depth_zero_predicts_the_mean() {
        let (x, y) = step_data(20);
        let mut forest = RandomForestRegressor::new(
            ForestParams {
                n_estimators: 3,
                max_depth: Some(0),
                bootstrap: false,
                ..ForestParams::default()
            },
            0,
        );
        forest.fit(x.view(), y.view()).unwrap();
        for p in forest.predict(x.view()).unwrap() {
            approx::assert_relative_eq!(p, 5.5);
        }
    }

    #[test]
    fn unbounded_depth_grows_every_sample_into_a_leaf() {
        // Doubling targets give a fully grown, heavily unbalanced tree.
        let n = 400;
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
        let y = Array1::from_iter((0..n).map(|i| 2f64.powi(i as i32)));
        let mut forest = RandomForestRegressor::new(
            ForestParams {
                n_estimators: 2,
                bootstrap: false,
                ..ForestParams::default()
            },
            5,
        );
        forest.fit(x.view(), y.view()).unwrap();
        assert_eq!(forest.trees[0].nodes.len(), 2 * n - 1);
        let pred = forest.predict(x.view()).unwrap();
        for (p, expected) in pred.iter().zip(y.iter()) {
            approx::assert_relative_eq!(*p, *expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn params_round_trip_through_factory() {
        let mut params = HyperParams::new();
        params.insert("n_estimators".into(), ParamValue::Int(40));
        params.insert("max_depth".into(), ParamValue::Int(3));
        params.insert("max_features".into(), ParamValue::Text("sqrt".into()));
        let forest = RandomForestRegressor::create(&params, 0).unwrap();
        let rebuilt = RandomForestRegressor::create(&forest.params(), 0).unwrap();
        assert_eq!(forest.forest_params(), rebuilt.forest_params());
        assert_eq!(rebuilt.forest_params().max_features, MaxFeatures::Sqrt);
    }

    #[test]
    fn unfitted_forest_refuses_to_predict() {
        let (x, _) = step_data(10);
        assert!(small_forest(0).predict(x.view()).is_err());
        assert!(small_forest(0).feature_importances().is_none());
    }
}
