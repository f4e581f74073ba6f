//! `model_meta.json`: one entry per pollutant, merged on every save.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::fire::FireParameters;
use crate::lag::LagParameters;
use crate::metrics::ScoreSet;
use crate::models::{EstimatorKind, HyperParams};

/// Everything needed to rebuild the features of a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Base columns kept after pruning, before lagging.
    pub x_cols_org: Vec<String>,
    /// Final feature columns in matrix order.
    pub x_cols: Vec<String>,
    pub fire_cols: Vec<String>,
    pub fire_dict: FireParameters,
    pub lag_dict: LagParameters,
    pub rf_score: ScoreSet,
    pub rf_params: HyperParams,
    pub rolling_win: usize,
    #[serde(default)]
    pub estimator: EstimatorKind,
}

fn read_document(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = fs::read_to_string(path)?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::MalformedSource(format!(
            "{} should hold an object, found {}",
            path.display(),
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn load_meta(path: &Path, pollutant: &str) -> Result<ModelMetadata> {
    let mut document = read_document(path)?;
    let entry = document.remove(pollutant).ok_or_else(|| {
        PipelineError::Model(format!(
            "no metadata for `{pollutant}` in {}",
            path.display()
        ))
    })?;
    Ok(serde_json::from_value(entry)?)
}

/// Replaces the `pollutant` entry and leaves every other key untouched.
pub fn save_meta(path: &Path, pollutant: &str, meta: &ModelMetadata) -> Result<()> {
    let mut document = read_document(path)?;
    document.insert(pollutant.to_string(), serde_json::to_value(meta)?);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&Value::Object(document))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParamValue;

    fn sample() -> ModelMetadata {
        ModelMetadata {
            x_cols_org: vec!["Temperature(C)".into(), "fire_0_100".into()],
            x_cols: vec!["Temperature(C)".into(), "PM2.5_lag_1".into()],
            fire_cols: vec!["fire_0_100".into()],
            fire_dict: FireParameters::new(12.0, -6, 72).unwrap(),
            lag_dict: LagParameters::new(25, 3, true).unwrap(),
            rf_score: ScoreSet::compute(&[1.0, 1.0], &[1.0, 1.0], "test_"),
            rf_params: HyperParams::from([("n_estimators".to_string(), ParamValue::Int(60))]),
            rolling_win: 24,
            estimator: EstimatorKind::RandomForest,
        }
    }

    #[test]
    fn keys_follow_the_stored_layout() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["fire_dict"]["w_speed"], 12.0);
        assert_eq!(value["fire_dict"]["shift"], -6);
        assert_eq!(value["lag_dict"]["n_max"], 25);
        assert_eq!(value["lag_dict"]["roll"], true);
        assert!(value["rf_score"]["test_r2_score"].is_null());
    }

    #[test]
    fn save_merges_under_pollutant_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("model_meta.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"PM10": {"kept": true}}"#).unwrap();

        save_meta(&path, "PM2.5", &sample()).unwrap();
        let loaded = load_meta(&path, "PM2.5").unwrap();
        assert_eq!(loaded.x_cols, sample().x_cols);
        assert_eq!(loaded.lag_dict, sample().lag_dict);
        assert!(loaded.rf_score.get("test_r2_score").unwrap().is_nan());

        let document: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["PM10"]["kept"], true);
    }

    #[test]
    fn missing_pollutant_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_meta.json");
        assert!(matches!(load_meta(&path, "PM2.5"), Err(PipelineError::Model(_))));
    }
}
