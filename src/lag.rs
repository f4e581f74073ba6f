use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::has_column;

const LAG_SEPARATOR: &str = "_lag_";

/// Which past hours to copy forward: offsets `1, 1 + step, ...` strictly below `max_lag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagParameters {
    #[serde(rename = "n_max")]
    pub max_lag: usize,
    pub step: usize,
    #[serde(rename = "roll")]
    pub use_rolling: bool,
}

impl LagParameters {
    pub fn new(max_lag: usize, step: usize, use_rolling: bool) -> Result<Self> {
        let params = Self {
            max_lag,
            step,
            use_rolling,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step == 0 || self.max_lag <= 1 {
            return Err(PipelineError::OptimizationDegenerate(format!(
                "lag range is empty for max_lag={} step={}",
                self.max_lag, self.step
            )));
        }
        Ok(())
    }

    pub fn offsets(&self) -> Vec<usize> {
        (1..self.max_lag).step_by(self.step.max(1)).collect()
    }
}

pub fn lag_column_name(origin: &str, offset: usize) -> String {
    format!("{origin}{LAG_SEPARATOR}{offset}")
}

/// Maps a lag column back to the column it was derived from; other names pass through.
pub fn collapse_lag_name(name: &str) -> &str {
    match name.rsplit_once(LAG_SEPARATOR) {
        Some((origin, offset)) if !origin.is_empty() && offset.parse::<usize>().is_ok() => origin,
        _ => name,
    }
}

pub fn is_lag_column(name: &str) -> bool {
    collapse_lag_name(name) != name
}

#[derive(Debug, Clone)]
pub struct LagExpander {
    params: LagParameters,
    roll_width: usize,
}

impl LagExpander {
    pub fn new(params: LagParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            roll_width: params.step,
        })
    }

    /// Width of the trailing mean applied before shifting when rolling is enabled.
    pub fn with_roll_width(mut self, width: usize) -> Self {
        self.roll_width = width.max(1);
        self
    }

    pub fn params(&self) -> &LagParameters {
        &self.params
    }

    /// Adds one shifted copy of every column per offset and drops the rows the shift left empty.
    ///
    /// The frame must be on a gap-free hourly grid, so a shift of `k` rows is a shift of `k` hours.
    pub fn expand(&self, frame: &DataFrame, columns: &[String]) -> Result<(DataFrame, Vec<String>)> {
        let offsets = self.params.offsets();
        let mut exprs = Vec::with_capacity(columns.len() * offsets.len());
        let mut names = Vec::with_capacity(columns.len() * offsets.len());

        for column in columns {
            if !has_column(frame, column) {
                return Err(PipelineError::MalformedSource(format!(
                    "cannot lag missing column `{column}`"
                )));
            }
            let base = if self.params.use_rolling && self.roll_width > 1 {
                col(column.as_str()).rolling_mean(RollingOptionsFixedWindow {
                    window_size: self.roll_width,
                    min_periods: 1,
                    ..Default::default()
                })
            } else {
                col(column.as_str())
            };
            for &offset in &offsets {
                let name = lag_column_name(column, offset);
                exprs.push(base.clone().shift(lit(offset as i64)).alias(name.as_str()));
                names.push(name);
            }
        }

        let subset: Vec<Expr> = names.iter().map(|name| col(name.as_str())).collect();
        let expanded = frame
            .clone()
            .lazy()
            .with_columns(exprs)
            .drop_nulls(Some(subset))
            .collect()?;
        debug!(
            rows_before = frame.height(),
            rows_after = expanded.height(),
            n_lag_columns = names.len(),
            params = ?self.params,
            "lag columns added"
        );
        Ok((expanded, names))
    }
}
