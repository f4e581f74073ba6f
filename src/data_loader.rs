//! Parquet loading for station sources and hotspot detections.

use anyhow::{bail, Context, Result};
use glob::glob;
use polars::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::alignment::RawSource;
use crate::config::Config;
use crate::fire::FireRecord;
use crate::frame::{datetime_index, f64_values, has_column, DATETIME_COL};

pub const LATITUDE_COL: &str = "latitude";
pub const LONGITUDE_COL: &str = "longitude";
pub const POWER_COL: &str = "power";

/// Lazily scans every parquet file matching `pattern`.
pub fn scan_pattern(pattern: &str) -> Result<LazyFrame> {
    let paths: Vec<PathBuf> = glob(pattern)
        .with_context(|| format!("Failed to read glob pattern {pattern}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    if paths.is_empty() {
        bail!("No files found matching pattern: {pattern}");
    }
    debug!(pattern, n_files = paths.len(), "parquet files found");
    LazyFrame::scan_parquet_files(Arc::from(paths), Default::default())
        .context("Failed to scan parquet files")
}

/// One `RawSource` per configured source. A missing timezone is passed through for the
/// aligner to reject.
pub fn load_sources(config: &Config) -> Result<Vec<RawSource>> {
    config
        .data
        .sources
        .iter()
        .map(|source| {
            let frame = scan_pattern(&source.pattern)?
                .collect()
                .with_context(|| format!("Failed to load source {}", source.pattern))?;
            info!(source = %source.pattern, shape = ?frame.shape(), "source loaded");
            Ok(RawSource::new(&source.pattern, frame, source.timezone.as_deref())
                .with_timestamp_column(&source.timestamp_column))
        })
        .collect()
}

/// Hotspots from `latitude`, `longitude`, `datetime` and an optional `power` column.
/// Detection times are expected on the city clock. Rows without a position are skipped.
pub fn hotspots_from_frame(frame: &DataFrame) -> Result<Vec<FireRecord>> {
    for required in [LATITUDE_COL, LONGITUDE_COL, DATETIME_COL] {
        if !has_column(frame, required) {
            bail!("hotspot data has no `{required}` column");
        }
    }
    let latitudes = f64_values(frame, LATITUDE_COL)?;
    let longitudes = f64_values(frame, LONGITUDE_COL)?;
    let detected = datetime_index(frame).context("Failed to read hotspot timestamps")?;
    let powers = if has_column(frame, POWER_COL) {
        f64_values(frame, POWER_COL)?
    } else {
        vec![None; frame.height()]
    };

    let records: Vec<FireRecord> = latitudes
        .into_iter()
        .zip(longitudes)
        .zip(detected)
        .zip(powers)
        .filter_map(|(((latitude, longitude), detected_at), power)| {
            Some(FireRecord {
                latitude: latitude?,
                longitude: longitude?,
                detected_at,
                power,
            })
        })
        .collect();
    let skipped = frame.height() - records.len();
    if skipped > 0 {
        warn!(skipped, "hotspots without a position were skipped");
    }
    Ok(records)
}

pub fn load_hotspots(pattern: &str) -> Result<Vec<FireRecord>> {
    let frame = scan_pattern(pattern)?
        .collect()
        .context("Failed to load hotspots")?;
    let records = hotspots_from_frame(&frame)?;
    info!(pattern, n_hotspots = records.len(), "hotspots loaded");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::TemporalAligner;
    use crate::config::SourceParams;
    use crate::error::PipelineError;
    use crate::frame::datetime_series;
    use chrono::NaiveDate;
    use std::fs::File;

    fn hotspot_frame(with_power: bool) -> DataFrame {
        let t = NaiveDate::from_ymd_opt(2022, 3, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap();
        let mut columns: Vec<Column> = vec![
            Series::new(LATITUDE_COL.into(), [Some(19.5), None, Some(20.1)]).into(),
            Series::new(LONGITUDE_COL.into(), [99.0, 99.1, 98.7]).into(),
            datetime_series(DATETIME_COL, &[t, t, t]).unwrap().into(),
        ];
        if with_power {
            columns.push(Series::new(POWER_COL.into(), [12.5, 3.0, 7.0]).into());
        }
        DataFrame::new(columns).unwrap()
    }

    fn write_parquet(path: &std::path::Path, frame: &mut DataFrame) {
        let file = File::create(path).unwrap();
        ParquetWriter::new(file).finish(frame).unwrap();
    }

    #[test]
    fn hotspots_skip_rows_without_position() {
        let records = hotspots_from_frame(&hotspot_frame(true)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].power, Some(12.5));
        assert_eq!(records[1].latitude, 20.1);

        let unpowered = hotspots_from_frame(&hotspot_frame(false)).unwrap();
        assert!(unpowered.iter().all(|r| r.power.is_none()));
    }

    #[test]
    fn hotspots_need_coordinates() {
        let frame = hotspot_frame(false).drop(LONGITUDE_COL).unwrap();
        assert!(hotspots_from_frame(&frame).is_err());
    }

    #[test]
    fn loads_parquet_files_by_pattern() {
        let dir = tempfile::tempdir().unwrap();
        write_parquet(&dir.path().join("fires-1.parquet"), &mut hotspot_frame(true));
        write_parquet(&dir.path().join("fires-2.parquet"), &mut hotspot_frame(true));
        let pattern = dir.path().join("fires-*.parquet");
        let records = load_hotspots(pattern.to_str().unwrap()).unwrap();
        assert_eq!(records.len(), 4);

        let mut config = Config::default();
        config.data.sources = vec![SourceParams {
            pattern: pattern.to_string_lossy().into_owned(),
            timestamp_column: DATETIME_COL.to_string(),
            timezone: None,
        }];
        let sources = load_sources(&config).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].frame.height(), 6);
        assert_eq!(sources[0].timezone, None);
        let aligner = TemporalAligner::new(&config.site.timezone).unwrap();
        assert!(matches!(
            aligner.align(&sources),
            Err(PipelineError::MalformedSource(_))
        ));
    }

    #[test]
    fn empty_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("missing-*.parquet");
        assert!(scan_pattern(pattern.to_str().unwrap()).is_err());
    }
}
