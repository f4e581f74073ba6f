use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::fire::{FireAggregation, FireParameters};
use crate::models::EstimatorKind;
use crate::search::CvStrategy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataParams,
    pub site: SiteParams,
    pub feature_params: FeatureParams,
    pub fire: FireConfig,
    pub model_params: ModelParams,
    pub search: SearchParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataParams {
    pub model_dir: String,
    pub sources: Vec<SourceParams>,
    pub hotspot_pattern: Option<String>,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
            sources: Vec::new(),
            hotspot_pattern: None,
        }
    }
}

/// One raw station/weather source: a parquet glob plus the clock its timestamps are in.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceParams {
    pub pattern: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    pub timezone: Option<String>,
}

fn default_timestamp_column() -> String {
    "datetime".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteParams {
    pub city: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for SiteParams {
    fn default() -> Self {
        Self {
            city: "Chiang Mai".to_string(),
            timezone: "Asia/Bangkok".to_string(),
            latitude: 18.7883,
            longitude: 98.9853,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub pollutant: String,
    /// Meteorological columns; never offered for pruning.
    pub met_columns: Vec<String>,
    pub wind_direction_column: String,
    /// Trailing window (hours) used to smooth the target before training.
    pub rolling_window: usize,
    pub calendar_features: bool,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            pollutant: "PM2.5".to_string(),
            met_columns: vec![
                "Humidity(%)".to_string(),
                "Temperature(C)".to_string(),
                "Wind Speed(kmph)".to_string(),
            ],
            wind_direction_column: "Wind Dir".to_string(),
            rolling_window: 24,
            calendar_features: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FireConfig {
    pub zone_edges_km: Vec<f64>,
    pub direction_tolerance_deg: f64,
    pub aggregation: FireAggregation,
    pub defaults: FireParameters,
}

impl Default for FireConfig {
    fn default() -> Self {
        Self {
            zone_edges_km: vec![0.0, 100.0, 200.0, 400.0, 800.0, 1000.0],
            direction_tolerance_deg: 45.0,
            aggregation: FireAggregation::Count,
            defaults: FireParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub estimator: EstimatorKind,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::RandomForest,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub n_iter: usize,
    pub cv: CvStrategy,
    pub search_seed: u64,
    pub bayes_calls: usize,
    pub bayes_initial: usize,
    pub bayes_seed: u64,
    pub importance_shuffles: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            n_iter: 100,
            cv: CvStrategy::KFold(5),
            search_seed: 40,
            bayes_calls: 40,
            bayes_initial: 10,
            bayes_seed: 30,
            importance_shuffles: 20,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let edges = &self.fire.zone_edges_km;
        if edges.len() < 2 || edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::Config(format!(
                "fire.zone_edges_km must be strictly increasing with at least two edges, got {edges:?}"
            )));
        }
        if self.feature_params.rolling_window == 0 {
            return Err(PipelineError::Config(
                "feature_params.rolling_window must be at least 1".to_string(),
            ));
        }
        self.fire.defaults.validate()?;
        Ok(())
    }

    pub fn model_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.model_dir)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.model_dir().join("model_meta.json")
    }

    /// Artifact file stem for the pollutant, with dots removed ("PM2.5" -> "PM25").
    pub fn pollutant_file_stem(&self) -> String {
        self.feature_params.pollutant.replace('.', "")
    }
}
