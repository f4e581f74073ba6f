use gbdt::config::Config as GBDTConfig;
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use super::traits::{ModelFactory, Regressor};
use super::{
    f64_param, unknown_params, usize_param, EstimatorKind, HyperParams, ParamValue, SavedModelRef,
};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub max_depth: u32,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.1,
            min_samples_leaf: 1,
        }
    }
}

/// Gradient-boosted trees from the `gbdt` crate, squared-error loss.
///
/// Row and feature subsampling stay at 1.0: `gbdt` draws them from the thread RNG, which
/// would make repeated fits differ.
#[derive(Serialize, Deserialize)]
pub struct GradientBoostingRegressor {
    params: BoostingParams,
    n_features: usize,
    model: Option<GBDT>,
}

impl GradientBoostingRegressor {
    pub fn new(params: BoostingParams) -> Self {
        Self {
            params,
            n_features: 0,
            model: None,
        }
    }

    pub fn boosting_params(&self) -> &BoostingParams {
        &self.params
    }

    fn config(&self, n_features: usize) -> GBDTConfig {
        let mut config = GBDTConfig::new();
        config.set_feature_size(n_features);
        config.set_iterations(self.params.n_estimators);
        config.set_max_depth(self.params.max_depth);
        config.set_shrinkage(self.params.learning_rate as f32);
        config.set_min_leaf_size(self.params.min_samples_leaf.max(1));
        config.set_loss("SquaredError");
        config.set_debug(false);
        config.set_data_sample_ratio(1.0);
        config.set_feature_sample_ratio(1.0);
        config.set_training_optimization_level(2);
        config
    }
}

fn rows_to_datavec(features: ArrayView2<f64>, targets: Option<ArrayView1<f64>>) -> DataVec {
    features
        .outer_iter()
        .enumerate()
        .map(|(i, row)| {
            let feature: Vec<f32> = row.iter().map(|&v| v as f32).collect();
            match targets {
                Some(y) => Data::new_training_data(feature, 1.0, y[i] as f32, None),
                None => Data::new_test_data(feature, None),
            }
        })
        .collect()
}

impl Regressor for GradientBoostingRegressor {
    fn fit(&mut self, features: ArrayView2<f64>, targets: ArrayView1<f64>) -> Result<()> {
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(PipelineError::Model(format!(
                "cannot fit boosting on a {}x{} matrix",
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
        let mut train = rows_to_datavec(features, Some(targets));
        let mut model = GBDT::new(&self.config(features.ncols()));
        model.fit(&mut train);
        self.model = Some(model);
        self.n_features = features.ncols();
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f64>) -> Result<Vec<f64>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PipelineError::Model("boosting model is not fitted".to_string()))?;
        if features.ncols() != self.n_features {
            return Err(PipelineError::Model(format!(
                "boosting model was fitted on {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }
        let test = rows_to_datavec(features, None);
        Ok(model.predict(&test).into_iter().map(f64::from).collect())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        None
    }

    fn params(&self) -> HyperParams {
        let p = &self.params;
        HyperParams::from([
            ("n_estimators".to_string(), ParamValue::Int(p.n_estimators as i64)),
            ("max_depth".to_string(), ParamValue::Int(i64::from(p.max_depth))),
            ("learning_rate".to_string(), ParamValue::Float(p.learning_rate)),
            ("min_samples_leaf".to_string(), ParamValue::Int(p.min_samples_leaf as i64)),
        ])
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::GradientBoosting
    }

    fn boxed_clone(&self) -> Box<dyn Regressor> {
        Box::new(Self::new(self.params.clone()))
    }

    fn saved(&self) -> SavedModelRef<'_> {
        SavedModelRef::GradientBoosting(self)
    }
}

impl ModelFactory for GradientBoostingRegressor {
    fn create(params: &HyperParams, _seed: u64) -> Result<Self> {
        unknown_params(
            params,
            &["n_estimators", "max_depth", "learning_rate", "min_samples_leaf"],
        )?;
        let defaults = BoostingParams::default();
        let max_depth = usize_param(params, "max_depth", defaults.max_depth as usize)?;
        let learning_rate = f64_param(params, "learning_rate", defaults.learning_rate)?;
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(PipelineError::Model(format!(
                "learning_rate must be positive, got {learning_rate}"
            )));
        }
        Ok(Self::new(BoostingParams {
            n_estimators: usize_param(params, "n_estimators", defaults.n_estimators)?,
            max_depth: u32::try_from(max_depth)
                .map_err(|_| PipelineError::Model(format!("max_depth {max_depth} is too deep")))?,
            learning_rate,
            min_samples_leaf: usize_param(params, "min_samples_leaf", defaults.min_samples_leaf)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::r2_score;
    use ndarray::{Array1, Array2};

    #[test]
    fn fits_a_linear_trend() {
        let x = Array2::from_shape_fn((120, 1), |(i, _)| i as f64);
        let y = Array1::from_iter((0..120).map(|i| 3.0 * i as f64 + 5.0));
        let mut model = GradientBoostingRegressor::new(BoostingParams {
            n_estimators: 50,
            max_depth: 4,
            learning_rate: 0.3,
            min_samples_leaf: 1,
        });
        model.fit(x.view(), y.view()).unwrap();
        let pred = model.predict(x.view()).unwrap();
        assert!(r2_score(y.as_slice().unwrap(), &pred).unwrap() > 0.9);
        assert!(model.feature_importances().is_none());
    }

    #[test]
    fn factory_reads_learning_rate() {
        let mut params = HyperParams::new();
        params.insert("learning_rate".into(), ParamValue::Float(0.05));
        params.insert("n_estimators".into(), ParamValue::Int(20));
        let model = GradientBoostingRegressor::create(&params, 0).unwrap();
        assert_eq!(model.boosting_params().learning_rate, 0.05);
        assert_eq!(model.boosting_params().n_estimators, 20);

        params.insert("learning_rate".into(), ParamValue::Float(0.0));
        assert!(GradientBoostingRegressor::create(&params, 0).is_err());
    }

    #[test]
    fn predicting_before_fit_is_an_error() {
        let x = Array2::<f64>::zeros((2, 1));
        assert!(GradientBoostingRegressor::new(BoostingParams::default())
            .predict(x.view())
            .is_err());
    }
}
