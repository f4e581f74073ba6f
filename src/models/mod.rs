pub mod forest;
pub mod gbdt;
pub mod traits;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};

pub use self::forest::{ForestParams, MaxFeatures, RandomForestRegressor};
pub use self::gbdt::{BoostingParams, GradientBoostingRegressor};
pub use self::traits::{ModelFactory, Regressor};

/// A single hyperparameter value as it appears in metadata (`rf_params`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Self::Int(v) if *v >= 0 => Some(*v as usize),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

pub type HyperParams = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    RandomForest,
    GradientBoosting,
}

impl EstimatorKind {
    /// Builds an unfitted estimator of this kind. Unknown keys in `params` are rejected.
    pub fn build(self, params: &HyperParams, seed: u64) -> Result<Box<dyn Regressor>> {
        Ok(match self {
            Self::RandomForest => Box::new(RandomForestRegressor::create(params, seed)?),
            Self::GradientBoosting => Box::new(GradientBoostingRegressor::create(params, seed)?),
        })
    }
}

/// On-disk form of a fitted estimator.
#[derive(Deserialize)]
#[serde(tag = "kind", content = "model", rename_all = "snake_case")]
pub enum SavedModel {
    RandomForest(RandomForestRegressor),
    GradientBoosting(GradientBoostingRegressor),
}

impl SavedModel {
    pub fn into_regressor(self) -> Box<dyn Regressor> {
        match self {
            Self::RandomForest(model) => Box::new(model),
            Self::GradientBoosting(model) => Box::new(model),
        }
    }
}

/// Borrowed twin of [`SavedModel`] so saving never clones a fitted ensemble.
#[derive(Serialize)]
#[serde(tag = "kind", content = "model", rename_all = "snake_case")]
pub enum SavedModelRef<'a> {
    RandomForest(&'a RandomForestRegressor),
    GradientBoosting(&'a GradientBoostingRegressor),
}

pub fn save_model(model: &dyn Regressor, path: &Path) -> Result<()> {
    let saved = model.saved();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(&saved)?)?;
    Ok(())
}

pub fn load_model(path: &Path) -> Result<Box<dyn Regressor>> {
    let bytes = fs::read(path).map_err(|e| {
        PipelineError::Model(format!("cannot read model at {}: {e}", path.display()))
    })?;
    let saved: SavedModel = serde_json::from_slice(&bytes)?;
    Ok(saved.into_regressor())
}

pub(crate) fn usize_param(params: &HyperParams, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value.as_usize().ok_or_else(|| {
            PipelineError::Model(format!("`{key}` must be a non-negative integer, got {value:?}"))
        }),
    }
}

pub(crate) fn f64_param(params: &HyperParams, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| PipelineError::Model(format!("`{key}` must be numeric, got {value:?}"))),
    }
}

pub(crate) fn unknown_params(params: &HyperParams, known: &[&str]) -> Result<()> {
    if let Some(key) = params.keys().find(|k| !known.contains(&k.as_str())) {
        return Err(PipelineError::Model(format!("unknown hyperparameter `{key}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    #[test]
    fn param_values_serialize_untagged() {
        let mut params = HyperParams::new();
        params.insert("max_depth".into(), ParamValue::Null);
        params.insert("n_estimators".into(), ParamValue::Int(40));
        params.insert("max_features".into(), ParamValue::Text("sqrt".into()));
        params.insert("bootstrap".into(), ParamValue::Bool(true));
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(
            json,
            r#"{"bootstrap":true,"max_depth":null,"max_features":"sqrt","n_estimators":40}"#
        );
        let back: HyperParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn saved_model_round_trips_through_disk() {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| (i * (j + 1)) as f64);
        let y = Array1::from_iter((0..40).map(|i| i as f64 * 2.0));
        let mut model = EstimatorKind::RandomForest
            .build(&HyperParams::new(), 7)
            .unwrap();
        model.fit(x.view(), y.view()).unwrap();
        let expected = model.predict(x.view()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PM25_model.json");
        save_model(model.as_ref(), &path).unwrap();
        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded.kind(), EstimatorKind::RandomForest);
        assert_eq!(loaded.predict(x.view()).unwrap(), expected);
    }

    #[test]
    fn unknown_hyperparameter_is_rejected() {
        let mut params = HyperParams::new();
        params.insert("criterion".into(), ParamValue::Text("gini".into()));
        assert!(matches!(
            EstimatorKind::RandomForest.build(&params, 0),
            Err(PipelineError::Model(_))
        ));
    }
}
