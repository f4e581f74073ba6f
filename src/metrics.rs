use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Why a metric could not be computed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("length mismatch: {truth} targets vs {predicted} predictions")]
    LengthMismatch { truth: usize, predicted: usize },
    #[error("no samples")]
    Empty,
    #[error("non-finite values")]
    NonFinite,
    #[error("target is constant")]
    ConstantTarget,
}

type MetricFn = fn(&[f64], &[f64]) -> Result<f64, MetricError>;

fn check(y_true: &[f64], y_pred: &[f64]) -> Result<(), MetricError> {
    if y_true.len() != y_pred.len() {
        return Err(MetricError::LengthMismatch {
            truth: y_true.len(),
            predicted: y_pred.len(),
        });
    }
    if y_true.is_empty() {
        return Err(MetricError::Empty);
    }
    if y_true.iter().chain(y_pred).any(|v| !v.is_finite()) {
        return Err(MetricError::NonFinite);
    }
    Ok(())
}

pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MetricError> {
    check(y_true, y_pred)?;
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_tot: f64 = y_true.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return Err(MetricError::ConstantTarget);
    }
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(y, p)| (y - p).powi(2)).sum();
    Ok(1.0 - ss_res / ss_tot)
}

pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MetricError> {
    check(y_true, y_pred)?;
    Ok(y_true.iter().zip(y_pred).map(|(y, p)| (y - p).powi(2)).sum::<f64>() / y_true.len() as f64)
}

pub fn mean_absolute_error(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MetricError> {
    check(y_true, y_pred)?;
    Ok(y_true.iter().zip(y_pred).map(|(y, p)| (y - p).abs()).sum::<f64>() / y_true.len() as f64)
}

const DEFAULT_METRICS: [(&str, MetricFn); 3] = [
    ("r2_score", r2_score),
    ("mean_squared_error", mean_squared_error),
    ("mean_absolute_error", mean_absolute_error),
];

/// Named scores; a metric that failed is stored as NaN (written as `null` in JSON).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSet(pub BTreeMap<String, f64>);

impl ScoreSet {
    /// r2, mse and mae with every key prefixed by `header` (e.g. `"test_"`).
    pub fn compute(y_true: &[f64], y_pred: &[f64], header: &str) -> Self {
        let scores = DEFAULT_METRICS
            .iter()
            .map(|(name, metric)| {
                let value = metric(y_true, y_pred).unwrap_or_else(|e| {
                    warn!(metric = *name, error = %e, "metric failed, recording NaN");
                    f64::NAN
                });
                (format!("{header}{name}"), value)
            })
            .collect();
        Self(scores)
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }
}

impl Serialize for ScoreSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let as_options: BTreeMap<&String, Option<f64>> = self
            .0
            .iter()
            .map(|(k, v)| (k, v.is_finite().then_some(*v)))
            .collect();
        as_options.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScoreSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let as_options = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
        Ok(Self(
            as_options
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn perfect_prediction_scores() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let scores = ScoreSet::compute(&y, &y, "val_");
        assert_relative_eq!(scores.get("val_r2_score").unwrap(), 1.0);
        assert_relative_eq!(scores.get("val_mean_squared_error").unwrap(), 0.0);
        assert_relative_eq!(scores.get("val_mean_absolute_error").unwrap(), 0.0);
    }

    #[test]
    fn known_values() {
        let y = [1.0, 2.0, 3.0];
        let p = [2.0, 2.0, 2.0];
        assert_relative_eq!(r2_score(&y, &p).unwrap(), 0.0);
        assert_relative_eq!(mean_squared_error(&y, &p).unwrap(), 2.0 / 3.0);
        assert_relative_eq!(mean_absolute_error(&y, &p).unwrap(), 2.0 / 3.0);
    }

    #[test]
    fn constant_target_records_nan_instead_of_failing() {
        let y = [5.0, 5.0, 5.0];
        let p = [4.0, 5.0, 6.0];
        assert_eq!(r2_score(&y, &p), Err(MetricError::ConstantTarget));
        let scores = ScoreSet::compute(&y, &p, "test_");
        assert!(scores.get("test_r2_score").unwrap().is_nan());
        assert_relative_eq!(scores.get("test_mean_squared_error").unwrap(), 2.0 / 3.0);
    }

    #[test]
    fn length_mismatch_is_reported() {
        assert!(matches!(
            mean_squared_error(&[1.0], &[1.0, 2.0]),
            Err(MetricError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn errors_render_their_cause() {
        let error = mean_absolute_error(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert_eq!(error.to_string(), "length mismatch: 2 targets vs 1 predictions");
        assert_eq!(MetricError::ConstantTarget.to_string(), "target is constant");
    }

    #[test]
    fn nan_scores_serialize_as_null() {
        let scores = ScoreSet::compute(&[5.0, 5.0], &[5.0, 5.0], "test_");
        let json = serde_json::to_string(&scores).unwrap();
        assert!(json.contains("\"test_r2_score\":null"));
        let back: ScoreSet = serde_json::from_str(&json).unwrap();
        assert!(back.get("test_r2_score").unwrap().is_nan());
        assert_eq!(back.get("test_mean_squared_error"), Some(0.0));
    }
}
