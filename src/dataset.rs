//! Builds the model-ready feature table and cuts it into chronological matrices.

use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::ops::{Index, Range};
use tracing::{debug, info, instrument};

use crate::alignment::{RawSource, TemporalAligner};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::fire::{FireFeatureSynthesizer, FireParameters, FireRecord, PlacedHotspot};
use crate::frame::{column_names, datetime_index, f64_values, has_column, DATETIME_COL};
use crate::lag::{LagExpander, LagParameters};

const RATIO_TOLERANCE: f64 = 1e-9;
pub const HOUR_COL: &str = "hour";
pub const DAY_OF_WEEK_COL: &str = "day_of_week";

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub target: String,
    pub met_columns: Vec<String>,
    /// Trailing mean width (hours) applied to the target; 1 leaves it raw.
    pub rolling_window: usize,
    pub calendar_features: bool,
    pub fire: FireFeatureSynthesizer,
}

impl AssemblerConfig {
    pub fn from_config(config: &Config) -> Self {
        let fire = FireFeatureSynthesizer::new(
            config.site.latitude,
            config.site.longitude,
            config.fire.zone_edges_km.clone(),
        )
        .with_direction_tolerance(config.fire.direction_tolerance_deg)
        .with_aggregation(config.fire.aggregation)
        .with_wind_direction_column(&config.feature_params.wind_direction_column);
        Self {
            target: config.feature_params.pollutant.clone(),
            met_columns: config.feature_params.met_columns.clone(),
            rolling_window: config.feature_params.rolling_window,
            calendar_features: config.feature_params.calendar_features,
            fire,
        }
    }
}

/// One chronological block of the feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSlice {
    pub rows: Range<usize>,
    /// First and last timestamp of the block, inclusive; `None` for an empty block.
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl IndexSlice {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitIndices(pub Vec<IndexSlice>);

impl SplitIndices {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Index<usize> for SplitIndices {
    type Output = IndexSlice;

    fn index(&self, i: usize) -> &IndexSlice {
        &self.0[i]
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub frame: DataFrame,
    pub target: String,
    /// Requested base columns that are not fire columns.
    pub original_columns: Vec<String>,
    /// Every fire zone column present in the frame.
    pub fire_columns: Vec<String>,
    pub lag_columns: Vec<String>,
    base_columns: Vec<String>,
}

impl FeatureTable {
    /// Base columns followed by lag columns, in the order the matrices use.
    pub fn feature_columns(&self) -> Vec<String> {
        self.base_columns
            .iter()
            .chain(&self.lag_columns)
            .cloned()
            .collect()
    }

    pub fn base_columns(&self) -> &[String] {
        &self.base_columns
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    /// Contiguous blocks of `floor(ratio * n)` rows, in order from the first row.
    pub fn split(&self, ratios: &[f64]) -> Result<SplitIndices> {
        if ratios.is_empty() {
            return Err(PipelineError::InvalidRatio("no ratios given".to_string()));
        }
        if let Some(bad) = ratios.iter().find(|r| !r.is_finite() || **r <= 0.0) {
            return Err(PipelineError::InvalidRatio(format!(
                "ratio {bad} is not a positive number"
            )));
        }
        let total: f64 = ratios.iter().sum();
        if total > 1.0 + RATIO_TOLERANCE {
            return Err(PipelineError::InvalidRatio(format!(
                "ratios {ratios:?} sum to {total}"
            )));
        }

        let n = self.height();
        let index = datetime_index(&self.frame)?;
        let mut start = 0;
        let slices = ratios
            .iter()
            .map(|ratio| {
                let size = ((ratio * n as f64) + RATIO_TOLERANCE).floor() as usize;
                let end = (start + size).min(n);
                let slice = IndexSlice {
                    rows: start..end,
                    start: (end > start).then(|| index[start]),
                    end: (end > start).then(|| index[end - 1]),
                };
                start = end;
                slice
            })
            .collect();
        Ok(SplitIndices(slices))
    }

    /// Feature matrix and target vector for one block. Rows with a missing value in any
    /// selected column or in the target are dropped; order is preserved.
    pub fn matrix(&self, slice: &IndexSlice, columns: &[String]) -> Result<(Array2<f64>, Array1<f64>)> {
        let rows_before = slice.len();
        let block = self
            .frame
            .slice(slice.rows.start as i64, slice.rows.len());
        let target = f64_values(&block, &self.target)?;
        let features = columns
            .iter()
            .map(|name| f64_values(&block, name))
            .collect::<Result<Vec<_>>>()?;

        let mut values = Vec::with_capacity(rows_before * columns.len());
        let mut targets = Vec::with_capacity(rows_before);
        for (row, y) in target.iter().enumerate() {
            let Some(y) = y else { continue };
            let start = values.len();
            let complete = features.iter().all(|column| match column[row] {
                Some(v) => {
                    values.push(v);
                    true
                }
                None => false,
            });
            if complete {
                targets.push(*y);
            } else {
                values.truncate(start);
            }
        }
        if targets.is_empty() {
            return Err(PipelineError::EmptyMatrix { rows_before });
        }
        let n_rows = targets.len();
        let x = Array2::from_shape_vec((n_rows, columns.len()), values)
            .map_err(|e| PipelineError::Assembly(e.to_string()))?;
        debug!(rows_before, rows_after = n_rows, n_columns = columns.len(), "matrix built");
        Ok((x, Array1::from_vec(targets)))
    }
}

/// Owns the aligned hourly data and the placed hotspots; rebuilds feature tables on demand.
#[derive(Debug, Clone)]
pub struct DatasetAssembler {
    config: AssemblerConfig,
    base: DataFrame,
    hotspots: Vec<PlacedHotspot>,
    table: Option<FeatureTable>,
}

impl DatasetAssembler {
    pub fn new(
        aligner: &TemporalAligner,
        sources: &[RawSource],
        hotspots: &[FireRecord],
        config: AssemblerConfig,
    ) -> Result<Self> {
        let aligned = aligner.align(sources)?;
        Self::from_aligned(aligned, hotspots, config)
    }

    /// Starts from a frame that is already on the city clock.
    pub fn from_aligned(aligned: DataFrame, hotspots: &[FireRecord], config: AssemblerConfig) -> Result<Self> {
        if !has_column(&aligned, &config.target) {
            return Err(PipelineError::MalformedSource(format!(
                "target column `{}` is missing",
                config.target
            )));
        }
        let resampled = TemporalAligner::resample_hourly(&aligned)?;
        let mut prepared = resampled.lazy();
        if config.rolling_window > 1 {
            prepared = prepared.with_column(
                col(config.target.as_str())
                    .rolling_mean(RollingOptionsFixedWindow {
                        window_size: config.rolling_window,
                        min_periods: 1,
                        ..Default::default()
                    })
                    .alias(config.target.as_str()),
            );
        }
        if config.calendar_features {
            prepared = prepared.with_columns([
                col(DATETIME_COL)
                    .dt()
                    .hour()
                    .cast(DataType::Float64)
                    .alias(HOUR_COL),
                (col(DATETIME_COL).dt().weekday().cast(DataType::Float64) - lit(1.0))
                    .alias(DAY_OF_WEEK_COL),
            ]);
        }
        let base = prepared.collect()?;
        let hotspots = config.fire.place(hotspots);
        info!(
            rows = base.height(),
            columns = base.width(),
            n_hotspots = hotspots.len(),
            "assembler ready"
        );
        Ok(Self {
            config,
            base,
            hotspots,
            table: None,
        })
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Non-fire candidate features: every aligned column except the index and the target.
    pub fn original_columns(&self) -> Vec<String> {
        column_names(&self.base)
            .into_iter()
            .filter(|name| name != DATETIME_COL && *name != self.config.target)
            .collect()
    }

    pub fn fire_columns(&self) -> Vec<String> {
        self.config.fire.zone_columns()
    }

    /// Pure form of [`assemble`](Self::assemble): aligned data, smoothed target, calendar,
    /// fire columns, then lags of the target and `base_columns`.
    #[instrument(skip_all, fields(n_base = base_columns.len(), fire = ?fire, lag = ?lag))]
    pub fn build(
        &self,
        base_columns: &[String],
        fire: &FireParameters,
        lag: Option<&LagParameters>,
    ) -> Result<FeatureTable> {
        let fire_columns = self.fire_columns();
        if let Some(missing) = base_columns
            .iter()
            .find(|c| !has_column(&self.base, c) && !fire_columns.contains(c))
        {
            return Err(PipelineError::MalformedSource(format!(
                "column `{missing}` is not in the data"
            )));
        }
        let with_fire = self.config.fire.synthesize(&self.base, &self.hotspots, fire)?;

        let (frame, lag_columns) = match lag {
            Some(params) => {
                let mut to_lag = vec![self.config.target.clone()];
                to_lag.extend(
                    base_columns
                        .iter()
                        .filter(|c| **c != self.config.target)
                        .cloned(),
                );
                let expander = LagExpander::new(*params)?;
                let (expanded, names) = expander.expand(&with_fire, &to_lag)?;
                if expanded.height() == 0 {
                    return Err(PipelineError::Assembly(format!(
                        "no rows left after lagging with {params:?}"
                    )));
                }
                (expanded, names)
            }
            None => (with_fire, Vec::new()),
        };

        let mut keep: Vec<String> = vec![DATETIME_COL.to_string(), self.config.target.clone()];
        for name in base_columns.iter().chain(&fire_columns).chain(&lag_columns) {
            if !keep.contains(name) {
                keep.push(name.clone());
            }
        }
        let frame = frame.select(keep)?;

        Ok(FeatureTable {
            frame,
            target: self.config.target.clone(),
            original_columns: base_columns
                .iter()
                .filter(|c| !fire_columns.contains(c))
                .cloned()
                .collect(),
            fire_columns,
            lag_columns,
            base_columns: base_columns.to_vec(),
        })
    }

    /// Builds a table and keeps it as the current one.
    pub fn assemble(
        &mut self,
        base_columns: &[String],
        fire: &FireParameters,
        lag: Option<&LagParameters>,
    ) -> Result<&FeatureTable> {
        let table = self.build(base_columns, fire, lag)?;
        Ok(self.table.insert(table))
    }

    pub fn table(&self) -> Result<&FeatureTable> {
        self.table
            .as_ref()
            .ok_or_else(|| PipelineError::Assembly("no feature table assembled yet".to_string()))
    }

    pub fn split(&self, ratios: &[f64]) -> Result<SplitIndices> {
        self.table()?.split(ratios)
    }

    pub fn matrix(&self, slice: &IndexSlice, columns: &[String]) -> Result<(Array2<f64>, Array1<f64>)> {
        self.table()?.matrix(slice, columns)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::frame::datetime_series;
    use chrono::{Duration, NaiveDate};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    pub const SITE: (f64, f64) = (18.79, 98.98);

    pub fn hour(h: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + Duration::hours(h)
    }

    /// Hourly city data where PM2.5 follows yesterday's temperature plus a fire bump.
    pub fn synthetic_frame(n: usize) -> DataFrame {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let index: Vec<_> = (0..n as i64).map(hour).collect();
        let temperature: Vec<f64> = (0..n)
            .map(|i| 25.0 + 6.0 * ((i % 24) as f64 / 24.0 * std::f64::consts::TAU).sin())
            .collect();
        let humidity: Vec<f64> = temperature.iter().map(|t| 100.0 - 2.0 * t).collect();
        let wind: Vec<f64> = (0..n).map(|i| 5.0 + (i % 5) as f64).collect();
        let noise: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
        let pm: Vec<f64> = (0..n)
            .map(|i| {
                let fire_bump = if (i / 48) % 3 == 0 { 20.0 } else { 0.0 };
                30.0 + 2.0 * temperature[i.saturating_sub(3)] + fire_bump + noise[i]
            })
            .collect();
        DataFrame::new(vec![
            datetime_series(DATETIME_COL, &index).unwrap().into(),
            Series::new("PM2.5".into(), pm).into(),
            Series::new("Temperature(C)".into(), temperature).into(),
            Series::new("Humidity(%)".into(), humidity).into(),
            Series::new("Wind Speed(kmph)".into(), wind).into(),
            Series::new("Wind Dir".into(), vec![0.0; n]).into(),
            Series::new("Noise".into(), noise).into(),
        ])
        .unwrap()
    }

    /// Hotspots due north of the site, bursting every six days.
    pub fn synthetic_hotspots(n: usize) -> Vec<FireRecord> {
        (0..n as i64)
            .step_by(144)
            .flat_map(|h| {
                (0..5).map(move |k| FireRecord {
                    latitude: SITE.0 + (30.0 + 40.0 * k as f64) / 111.195,
                    longitude: SITE.1,
                    detected_at: hour(h),
                    power: Some(1.0 + k as f64),
                })
            })
            .collect()
    }

    pub fn assembler_config() -> AssemblerConfig {
        AssemblerConfig {
            target: "PM2.5".to_string(),
            met_columns: vec![
                "Humidity(%)".to_string(),
                "Temperature(C)".to_string(),
                "Wind Speed(kmph)".to_string(),
            ],
            rolling_window: 1,
            calendar_features: false,
            fire: FireFeatureSynthesizer::new(SITE.0, SITE.1, vec![0.0, 100.0, 200.0]),
        }
    }

    pub fn assembler(n: usize) -> DatasetAssembler {
        DatasetAssembler::from_aligned(synthetic_frame(n), &synthetic_hotspots(n), assembler_config()).unwrap()
    }
}
