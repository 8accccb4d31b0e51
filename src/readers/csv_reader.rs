use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;
use validator::Validate;

use crate::error::{ProcessingError, Result};
use crate::models::{Frequency, Sample, SeriesMeta, Site, TimeSeries, VerticalType};
use crate::readers::provider::{InMemoryCatalog, SourceKind};

/// One row of the exchange format.
#[derive(Debug, Deserialize)]
struct SeriesRow {
    source_id: String,
    site_id: String,
    site_name: String,
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    country: Option<String>,
    variable: String,
    unit: String,
    frequency: String,
    time: String,
    value: Option<f64>,
    flagged: Option<String>,
    data_level: Option<u8>,
    vertical_type: Option<String>,
}

/// Series under construction for one (source, variable, site).
struct PendingSeries {
    meta: SeriesMeta,
    frequency: Frequency,
    samples: Vec<Sample>,
}

/// Reads per-sample CSV rows into site time series.
pub struct SeriesCsvReader {
    delimiter: u8,
}

impl SeriesCsvReader {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn read_file(&self, path: &Path, kind: SourceKind) -> Result<InMemoryCatalog> {
        let file = File::open(path)?;
        let catalog = self.read_from(file, kind)?;
        debug!(path = %path.display(), %kind, series = catalog.len(), "read series file");
        Ok(catalog)
    }

    pub fn read_from<R: Read>(&self, input: R, kind: SourceKind) -> Result<InMemoryCatalog> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(input);

        let mut pending: BTreeMap<(String, String, String), PendingSeries> = BTreeMap::new();
        for (line, row) in reader.deserialize::<SeriesRow>().enumerate() {
            let row = row?;
            let frequency: Frequency = row.frequency.parse()?;
            let time = parse_time(&row.time).map_err(|e| {
                ProcessingError::InvalidFormat(format!("row {}: {}", line + 2, e))
            })?;
            let mut sample = match row.value {
                Some(v) => Sample::new(time, v),
                None => Sample::missing(time),
            };
            if row.flagged.as_deref().is_some_and(parse_flag) {
                sample = sample.flagged();
            }

            let key = (row.source_id.clone(), row.variable.clone(), row.site_id.clone());
            match pending.get_mut(&key) {
                Some(series) => {
                    if series.meta.unit != row.unit || series.frequency != frequency {
                        return Err(ProcessingError::InvalidFormat(format!(
                            "row {}: {} at {} changes unit or frequency within the series",
                            line + 2,
                            row.variable,
                            row.site_id
                        )));
                    }
                    series.samples.push(sample);
                }
                None => {
                    let meta = build_meta(&row)?;
                    pending.insert(
                        key,
                        PendingSeries {
                            meta,
                            frequency,
                            samples: vec![sample],
                        },
                    );
                }
            }
        }

        let mut catalog = InMemoryCatalog::new();
        for series in pending.into_values() {
            catalog.insert(kind, TimeSeries::new(series.meta, series.frequency, series.samples)?);
        }
        Ok(catalog)
    }
}

impl Default for SeriesCsvReader {
    fn default() -> Self {
        Self::new()
    }
}

fn build_meta(row: &SeriesRow) -> Result<SeriesMeta> {
    let mut site = Site::new(
        &row.site_id,
        &row.site_name,
        row.latitude,
        row.longitude,
        row.altitude.unwrap_or(0.0),
    );
    if let Some(country) = row.country.as_deref().filter(|c| !c.is_empty()) {
        site = site.with_country(country);
    }
    site.validate()?;

    let mut meta = SeriesMeta::new(&row.variable, &row.unit, &row.source_id, site);
    if let Some(vt) = row.vertical_type.as_deref().filter(|v| !v.is_empty()) {
        meta = meta.with_vertical_type(vt.parse::<VerticalType>()?);
    }
    if let Some(level) = row.data_level {
        meta = meta.with_data_level(level);
    }
    Ok(meta)
}

fn parse_time(text: &str) -> Result<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(time);
        }
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")?;
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("invalid time '{}'", text)))
}

fn parse_flag(text: &str) -> bool {
    matches!(text.to_lowercase().as_str(), "1" | "true" | "yes" | "y")
}
