//! Small conversions between polars frames and the plain vectors the search loops use.

use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;

use crate::error::{PipelineError, Result};

/// Name of the index column every aligned frame carries.
pub const DATETIME_COL: &str = "datetime";

pub(crate) fn datetime_series(name: &str, index: &[NaiveDateTime]) -> Result<Series> {
    let millis: Vec<i64> = index
        .iter()
        .map(|t| t.and_utc().timestamp_millis())
        .collect();
    Ok(Series::new(name.into(), millis)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?)
}

/// Reads the `datetime` column back as naive timestamps.
pub(crate) fn datetime_index(frame: &DataFrame) -> Result<Vec<NaiveDateTime>> {
    let millis = frame
        .column(DATETIME_COL)?
        .as_materialized_series()
        .cast(&DataType::Int64)?;
    millis
        .i64()?
        .into_iter()
        .map(|v| {
            v.and_then(DateTime::from_timestamp_millis)
                .map(|d| d.naive_utc())
                .ok_or_else(|| PipelineError::Assembly("null timestamp in index".to_string()))
        })
        .collect()
}

/// Column values as `f64`, with nulls and non-finite values mapped to `None`.
pub(crate) fn f64_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = frame
        .column(name)
        .map_err(|_| PipelineError::MalformedSource(format!("missing column `{name}`")))?;
    let series = column.as_materialized_series().cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

pub(crate) fn column_names(frame: &DataFrame) -> Vec<String> {
    frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect()
}

pub(crate) fn has_column(frame: &DataFrame, name: &str) -> bool {
    frame.get_column_names().iter().any(|c| c.as_str() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn datetime_round_trip() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let index: Vec<_> = (0..3).map(|h| start + chrono::Duration::hours(h)).collect();
        let df = DataFrame::new(vec![datetime_series(DATETIME_COL, &index).unwrap().into()]).unwrap();
        assert_eq!(datetime_index(&df).unwrap(), index);
    }

    #[test]
    fn f64_values_maps_nan_to_none() {
        let df = DataFrame::new(vec![
            Series::new("x".into(), vec![Some(1.0), None, Some(f64::NAN)]).into(),
        ])
        .unwrap();
        assert_eq!(f64_values(&df, "x").unwrap(), vec![Some(1.0), None, None]);
        assert!(matches!(
            f64_values(&df, "y"),
            Err(PipelineError::MalformedSource(_))
        ));
    }
}
