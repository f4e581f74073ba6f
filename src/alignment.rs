use chrono::{DateTime, Duration, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use polars::prelude::*;
use tracing::{debug, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::frame::{column_names, datetime_index, datetime_series, DATETIME_COL};

/// A raw per-source table as handed over by the loaders.
#[derive(Debug, Clone)]
pub struct RawSource {
    pub name: String,
    pub frame: DataFrame,
    pub timestamp_column: String,
    /// IANA name of the clock the timestamps are written in.
    pub timezone: Option<String>,
}

impl RawSource {
    pub fn new(name: impl Into<String>, frame: DataFrame, timezone: Option<&str>) -> Self {
        Self {
            name: name.into(),
            frame,
            timestamp_column: DATETIME_COL.to_string(),
            timezone: timezone.map(str::to_string),
        }
    }

    pub fn with_timestamp_column(mut self, column: &str) -> Self {
        self.timestamp_column = column.to_string();
        self
    }
}

pub fn parse_timezone(label: Option<&str>) -> Result<Tz> {
    match label.map(str::trim) {
        None | Some("") => Err(PipelineError::MalformedSource(
            "timezone label is missing".to_string(),
        )),
        Some(label) => label
            .parse::<Tz>()
            .map_err(|_| PipelineError::MalformedSource(format!("unknown timezone `{label}`"))),
    }
}

/// Puts several sources on one naive local clock for a city.
#[derive(Debug, Clone)]
pub struct TemporalAligner {
    city_tz: Tz,
}

impl TemporalAligner {
    pub fn new(city_timezone: &str) -> Result<Self> {
        Ok(Self {
            city_tz: parse_timezone(Some(city_timezone))?,
        })
    }

    pub fn city_timezone(&self) -> Tz {
        self.city_tz
    }

    /// Merges all sources into one frame indexed by hour-floored local time.
    ///
    /// Readings that share an hour are averaged. When two sources carry the same
    /// signal, the earlier source wins and the later one only fills its gaps.
    #[instrument(skip_all, fields(n_sources = sources.len()))]
    pub fn align(&self, sources: &[RawSource]) -> Result<DataFrame> {
        let mut signals: Vec<String> = Vec::new();
        let mut merged: Option<LazyFrame> = None;

        for (position, source) in sources.iter().enumerate() {
            let (names, frame) = self.localized(source)?;
            let hourly = frame
                .lazy()
                .filter(col(DATETIME_COL).is_not_null())
                .group_by([col(DATETIME_COL).dt().truncate(lit("1h"))])
                .agg(names.iter().map(|name| col(name.as_str()).mean()).collect::<Vec<_>>());

            merged = Some(match merged {
                None => {
                    signals.extend(names.iter().cloned());
                    hourly
                }
                Some(merged) => {
                    let incoming = |name: &str| format!("{name}@{position}");
                    let shared: Vec<&String> = names.iter().filter(|n| signals.contains(n)).collect();
                    let right: Vec<Expr> = std::iter::once(col(DATETIME_COL))
                        .chain(names.iter().map(|name| {
                            if shared.contains(&name) {
                                col(name.as_str()).alias(incoming(name))
                            } else {
                                col(name.as_str())
                            }
                        }))
                        .collect();
                    let fills: Vec<Expr> = shared
                        .iter()
                        .map(|name| {
                            col(name.as_str())
                                .fill_null(col(incoming(name)))
                                .alias(name.as_str())
                        })
                        .collect();
                    signals.extend(names.iter().filter(|n| !shared.contains(n)).cloned());
                    let keep: Vec<Expr> = std::iter::once(col(DATETIME_COL))
                        .chain(signals.iter().map(|name| col(name.as_str())))
                        .collect();
                    merged
                        .join(
                            hourly.select(right),
                            [col(DATETIME_COL)],
                            [col(DATETIME_COL)],
                            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
                        )
                        .with_columns(fills)
                        .select(keep)
                }
            });
            debug!(source = %source.name, n_signals = signals.len(), "source aligned");
        }

        match merged {
            Some(merged) => Ok(merged
                .sort([DATETIME_COL], SortMultipleOptions::default())
                .collect()?),
            None => Ok(DataFrame::new(vec![datetime_series(DATETIME_COL, &[])?.into()])?),
        }
    }

    /// One source with its timestamps moved onto the city clock and every signal cast to `f64`.
    fn localized(&self, source: &RawSource) -> Result<(Vec<String>, DataFrame)> {
        let declared = parse_timezone(source.timezone.as_deref()).map_err(|e| {
            PipelineError::MalformedSource(format!("source `{}`: {e}", source.name))
        })?;
        let stamps = source.frame.column(&source.timestamp_column).map_err(|_| {
            PipelineError::MalformedSource(format!(
                "source `{}` has no timestamp column `{}`",
                source.name, source.timestamp_column
            ))
        })?;
        let stamps = stamps.as_materialized_series();
        let (unit, stored_as_utc) = match stamps.dtype() {
            DataType::Datetime(unit, tz) => (*unit, tz.is_some()),
            other => {
                return Err(PipelineError::MalformedSource(format!(
                    "source `{}` timestamp column has dtype {other}, expected datetime",
                    source.name
                )))
            }
        };
        // Timezone-aware columns already hold UTC instants.
        let clock = if stored_as_utc { Tz::UTC } else { declared };
        let raw = stamps.cast(&DataType::Int64)?;
        let local: Vec<Option<i64>> = raw
            .i64()?
            .into_iter()
            .map(|v| v.and_then(|v| from_epoch(v, unit)))
            .map(|naive| naive.and_then(|n| self.to_city_clock(n, clock)))
            .map(|local| local.map(|t| t.and_utc().timestamp_millis()))
            .collect();
        let dropped = local.iter().filter(|t| t.is_none()).count();
        if dropped > 0 {
            warn!(source = %source.name, dropped, "rows without a valid local timestamp dropped");
        }

        let names: Vec<String> = column_names(&source.frame)
            .into_iter()
            .filter(|name| *name != source.timestamp_column)
            .collect();
        let mut columns: Vec<Column> = vec![Series::new(DATETIME_COL.into(), local)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
            .into()];
        for name in &names {
            let cast = source.frame.column(name)?.as_materialized_series().cast(&DataType::Float64);
            let values = cast.map_err(|e| {
                PipelineError::MalformedSource(format!(
                    "source `{}` column `{name}` is not numeric: {e}",
                    source.name
                ))
            })?;
            let finite: Vec<Option<f64>> = values
                .f64()?
                .into_iter()
                .map(|v| v.filter(|x| x.is_finite()))
                .collect();
            columns.push(Series::new(name.as_str().into(), finite).into());
        }
        Ok((names, DataFrame::new(columns)?))
    }

    fn to_city_clock(&self, naive: NaiveDateTime, clock: Tz) -> Option<NaiveDateTime> {
        Some(
            clock
                .from_local_datetime(&naive)
                .earliest()?
                .with_timezone(&self.city_tz)
                .naive_local(),
        )
    }

    /// Reindexes an aligned frame onto a gap-free hourly grid; missing hours become null rows.
    pub fn resample_hourly(frame: &DataFrame) -> Result<DataFrame> {
        let index = datetime_index(frame)?;
        let (Some(first), Some(last)) = (index.first(), index.last()) else {
            return Ok(frame.clone());
        };
        let n_hours = (*last - *first).num_hours().max(0) as usize + 1;
        let grid: Vec<NaiveDateTime> = (0..n_hours)
            .map(|h| *first + Duration::hours(h as i64))
            .collect();
        let grid = DataFrame::new(vec![datetime_series(DATETIME_COL, &grid)?.into()])?;
        let resampled = grid
            .lazy()
            .left_join(frame.clone().lazy(), col(DATETIME_COL), col(DATETIME_COL))
            .collect()?;
        debug!(rows_before = frame.height(), rows_after = resampled.height(), "resampled to hourly grid");
        Ok(resampled)
    }
}

fn from_epoch(value: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let instant = match unit {
        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(value),
        TimeUnit::Microseconds => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(value)),
    };
    instant.map(|d| d.naive_utc())
}
