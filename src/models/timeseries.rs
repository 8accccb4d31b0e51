use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};
use crate::models::{Frequency, Period, Site, VerticalType};

/// One timestamped measurement. `value == None` marks a missing sample that
/// still occupies its slot in the index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: NaiveDateTime,
    pub value: Option<f64>,
    /// Instrument QC flag, masked by `set_flags_nan`.
    pub flagged: bool,
    /// Number of raw samples this value stands for.
    pub weight: u32,
}

impl Sample {
    pub fn new(time: NaiveDateTime, value: f64) -> Self {
        Self {
            time,
            value: if value.is_finite() { Some(value) } else { None },
            flagged: false,
            weight: 1,
        }
    }

    pub fn missing(time: NaiveDateTime) -> Self {
        Self {
            time,
            value: None,
            flagged: false,
            weight: 0,
        }
    }

    pub fn flagged(mut self) -> Self {
        self.flagged = true;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

/// Descriptive part of a series, shared unchanged by every transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub variable: String,
    pub unit: String,
    /// Observation network or model identifier.
    pub source_id: String,
    pub site: Site,
    pub vertical_type: Option<VerticalType>,
    pub data_level: Option<u8>,
}

impl SeriesMeta {
    pub fn new(variable: &str, unit: &str, source_id: &str, site: Site) -> Self {
        Self {
            variable: variable.to_string(),
            unit: unit.to_string(),
            source_id: source_id.to_string(),
            site,
            vertical_type: None,
            data_level: None,
        }
    }

    pub fn with_vertical_type(mut self, vertical_type: VerticalType) -> Self {
        self.vertical_type = Some(vertical_type);
        self
    }

    pub fn with_data_level(mut self, level: u8) -> Self {
        self.data_level = Some(level);
        self
    }
}

/// Ordered, immutable series of samples at a declared base frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    meta: SeriesMeta,
    frequency: Frequency,
    samples: Vec<Sample>,
}

impl TimeSeries {
    /// Build a series, sorting samples by time. Duplicate timestamps are
    /// rejected.
    pub fn new(meta: SeriesMeta, frequency: Frequency, mut samples: Vec<Sample>) -> Result<Self> {
        samples.sort_by_key(|s| s.time);
        if let Some(pair) = samples.windows(2).find(|w| w[0].time == w[1].time) {
            return Err(ProcessingError::InvalidFormat(format!(
                "duplicate timestamp {} in {} series of {} at {}",
                pair[0].time, meta.variable, meta.source_id, meta.site.id
            )));
        }
        Ok(Self {
            meta,
            frequency,
            samples,
        })
    }

    /// Internal constructor for transformations that preserve ordering.
    pub(crate) fn from_sorted(meta: SeriesMeta, frequency: Frequency, samples: Vec<Sample>) -> Self {
        debug_assert!(samples.windows(2).all(|w| w[0].time < w[1].time));
        Self {
            meta,
            frequency,
            samples,
        }
    }

    pub fn meta(&self) -> &SeriesMeta {
        &self.meta
    }

    pub fn variable(&self) -> &str {
        &self.meta.variable
    }

    pub fn unit(&self) -> &str {
        &self.meta.unit
    }

    pub fn source_id(&self) -> &str {
        &self.meta.source_id
    }

    pub fn site(&self) -> &Site {
        &self.meta.site
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_valid()).count()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// New series with every value passed through `f`; missing values stay
    /// missing.
    pub fn map_values<F>(&self, f: F) -> TimeSeries
    where
        F: Fn(&Sample, f64) -> Option<f64>,
    {
        let samples = self
            .samples
            .iter()
            .map(|s| Sample {
                value: s.value.and_then(|v| f(s, v)),
                ..*s
            })
            .collect();
        Self::from_sorted(self.meta.clone(), self.frequency, samples)
    }

    pub fn with_meta(&self, meta: SeriesMeta) -> TimeSeries {
        Self::from_sorted(meta, self.frequency, self.samples.clone())
    }

    pub fn with_variable(&self, variable: &str, unit: &str) -> TimeSeries {
        let mut meta = self.meta.clone();
        meta.variable = variable.to_string();
        meta.unit = unit.to_string();
        self.with_meta(meta)
    }

    pub(crate) fn with_samples(&self, frequency: Frequency, samples: Vec<Sample>) -> TimeSeries {
        Self::from_sorted(self.meta.clone(), frequency, samples)
    }

    /// Samples whose timestamp falls inside `period`.
    pub fn slice_period(&self, period: &Period) -> TimeSeries {
        let samples = self
            .samples
            .iter()
            .filter(|s| period.contains(s.time))
            .copied()
            .collect();
        Self::from_sorted(self.meta.clone(), self.frequency, samples)
    }

    pub fn value_at(&self, time: NaiveDateTime) -> Option<f64> {
        self.samples
            .binary_search_by_key(&time, |s| s.time)
            .ok()
            .and_then(|i| self.samples[i].value)
    }
}
