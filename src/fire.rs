//! Fire-influence features: hotspot detections folded into per-zone hourly series.

use chrono::{Duration, NaiveDateTime, Timelike};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::frame::{column_names, datetime_index, datetime_series, f64_values, has_column, DATETIME_COL};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// One detected hotspot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub detected_at: NaiveDateTime,
    /// Confidence or radiative power; treated as 1 when absent.
    pub power: Option<f64>,
}

/// Knobs controlling when and how strongly a hotspot reaches the site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FireParameters {
    /// Assumed smoke transport speed in km/h.
    #[serde(rename = "w_speed")]
    pub wind_speed_threshold: f64,
    #[serde(rename = "shift")]
    pub shift_hours: i64,
    #[serde(rename = "roll")]
    pub rolling_window_hours: usize,
}

impl Default for FireParameters {
    fn default() -> Self {
        Self {
            wind_speed_threshold: 8.0,
            shift_hours: 0,
            rolling_window_hours: 48,
        }
    }
}

impl FireParameters {
    pub fn new(wind_speed_threshold: f64, shift_hours: i64, rolling_window_hours: usize) -> Result<Self> {
        let params = Self {
            wind_speed_threshold,
            shift_hours,
            rolling_window_hours,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.wind_speed_threshold.is_finite() || self.wind_speed_threshold <= 0.0 {
            return Err(PipelineError::Config(format!(
                "fire wind speed must be positive, got {}",
                self.wind_speed_threshold
            )));
        }
        if self.rolling_window_hours == 0 {
            return Err(PipelineError::Config(
                "fire rolling window must be at least one hour".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireAggregation {
    /// Each contributing hotspot counts once.
    #[default]
    Count,
    /// Each contributing hotspot adds its power.
    Power,
}

/// A hotspot with its position relative to the monitoring site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedHotspot {
    pub detected_at: NaiveDateTime,
    pub distance_km: f64,
    pub bearing_deg: f64,
    pub zone: usize,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct FireFeatureSynthesizer {
    site_lat: f64,
    site_lon: f64,
    zone_edges_km: Vec<f64>,
    direction_tolerance_deg: f64,
    aggregation: FireAggregation,
    wind_direction_column: String,
}

impl FireFeatureSynthesizer {
    pub fn new(site_lat: f64, site_lon: f64, zone_edges_km: Vec<f64>) -> Self {
        Self {
            site_lat,
            site_lon,
            zone_edges_km,
            direction_tolerance_deg: 45.0,
            aggregation: FireAggregation::Count,
            wind_direction_column: "Wind Dir".to_string(),
        }
    }

    pub fn with_direction_tolerance(mut self, degrees: f64) -> Self {
        self.direction_tolerance_deg = degrees;
        self
    }

    pub fn with_aggregation(mut self, aggregation: FireAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_wind_direction_column(mut self, column: &str) -> Self {
        self.wind_direction_column = column.to_string();
        self
    }

    pub fn wind_direction_column(&self) -> &str {
        &self.wind_direction_column
    }

    /// Output column names, one per distance band.
    pub fn zone_columns(&self) -> Vec<String> {
        self.zone_edges_km
            .windows(2)
            .map(|edge| format!("fire_{}_{}", edge[0], edge[1]))
            .collect()
    }

    /// Assigns each hotspot a distance, bearing and zone. Hotspots outside every zone are dropped.
    pub fn place(&self, hotspots: &[FireRecord]) -> Vec<PlacedHotspot> {
        let placed: Vec<PlacedHotspot> = hotspots
            .iter()
            .filter_map(|record| {
                let distance_km = haversine_km(self.site_lat, self.site_lon, record.latitude, record.longitude);
                let zone = self
                    .zone_edges_km
                    .windows(2)
                    .position(|edge| distance_km >= edge[0] && distance_km < edge[1])?;
                let weight = match self.aggregation {
                    FireAggregation::Count => 1.0,
                    FireAggregation::Power => record.power.filter(|p| p.is_finite()).unwrap_or(1.0),
                };
                Some(PlacedHotspot {
                    detected_at: record.detected_at,
                    distance_km,
                    bearing_deg: bearing_deg(self.site_lat, self.site_lon, record.latitude, record.longitude),
                    zone,
                    weight,
                })
            })
            .collect();
        debug!(n_hotspots = hotspots.len(), n_placed = placed.len(), "hotspots placed into zones");
        placed
    }

    /// Returns `table` with its fire columns replaced by ones computed from `params`.
    pub fn synthesize(
        &self,
        table: &DataFrame,
        hotspots: &[PlacedHotspot],
        params: &FireParameters,
    ) -> Result<DataFrame> {
        params.validate()?;
        let zone_columns = self.zone_columns();
        let keep: Vec<String> = column_names(table)
            .into_iter()
            .filter(|name| !zone_columns.contains(name))
            .collect();
        let table = table.select(keep)?;

        let index = datetime_index(&table)?;
        let (Some(&first), Some(&last)) = (index.first(), index.last()) else {
            let mut empty = table;
            for name in &zone_columns {
                empty.with_column(Series::new(name.as_str().into(), Vec::<f64>::new()))?;
            }
            return Ok(empty);
        };

        // Start the grid early enough that the first row sees a full rolling window.
        let grid_start = first - Duration::hours(params.rolling_window_hours as i64 - 1);
        let n_hours = (last - grid_start).num_hours() as usize + 1;
        let mut counts = vec![vec![0.0_f64; n_hours]; zone_columns.len()];

        let wind_direction = self.wind_direction_by_hour(&table, &index)?;
        let mut contributing = 0_usize;
        for hotspot in hotspots {
            let travel_seconds = (hotspot.distance_km / params.wind_speed_threshold * 3600.0).round() as i64;
            let arrival = hotspot.detected_at
                + Duration::seconds(travel_seconds)
                + Duration::hours(params.shift_hours);
            let Some(arrival) = floor_to_hour(arrival) else {
                continue;
            };
            if arrival < grid_start || arrival > last {
                continue;
            }
            if let Some(directions) = &wind_direction {
                let upwind = directions
                    .get(&arrival)
                    .copied()
                    .flatten()
                    .is_some_and(|from| angular_difference(from, hotspot.bearing_deg) <= self.direction_tolerance_deg);
                if !upwind {
                    continue;
                }
            }
            let slot = (arrival - grid_start).num_hours() as usize;
            counts[hotspot.zone][slot] += hotspot.weight;
            contributing += 1;
        }
        debug!(contributing, n_hotspots = hotspots.len(), ?params, "fire contributions counted");

        let grid: Vec<NaiveDateTime> = (0..n_hours)
            .map(|h| grid_start + Duration::hours(h as i64))
            .collect();
        let mut grid_columns: Vec<Column> = vec![datetime_series(DATETIME_COL, &grid)?.into()];
        for (name, values) in zone_columns.iter().zip(counts) {
            grid_columns.push(Series::new(name.as_str().into(), values).into());
        }
        let smoothing: Vec<Expr> = zone_columns
            .iter()
            .map(|name| {
                col(name.as_str())
                    .rolling_mean(RollingOptionsFixedWindow {
                        window_size: params.rolling_window_hours,
                        min_periods: 1,
                        ..Default::default()
                    })
                    .alias(name.as_str())
            })
            .collect();
        let fire = DataFrame::new(grid_columns)?.lazy().with_columns(smoothing);

        let fill: Vec<Expr> = zone_columns
            .iter()
            .map(|name| col(name.as_str()).fill_null(lit(0.0)))
            .collect();
        Ok(table
            .lazy()
            .left_join(fire, col(DATETIME_COL), col(DATETIME_COL))
            .with_columns(fill)
            .collect()?)
    }

    fn wind_direction_by_hour(
        &self,
        table: &DataFrame,
        index: &[NaiveDateTime],
    ) -> Result<Option<HashMap<NaiveDateTime, Option<f64>>>> {
        if !has_column(table, &self.wind_direction_column) {
            warn!(
                column = %self.wind_direction_column,
                "no wind direction column, fire features ignore direction"
            );
            return Ok(None);
        }
        let directions = f64_values(table, &self.wind_direction_column)?;
        Ok(Some(index.iter().copied().zip(directions).collect()))
    }
}

fn floor_to_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.with_minute(0)?.with_second(0)?.with_nanosecond(0)
}

/// Great-circle distance between two points in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial bearing from the first point to the second, clockwise from north in [0, 360).
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_lambda = (lon2 - lon1).to_radians();
    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

fn angular_difference(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}
