use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::TimeSeries;

/// Which side of a comparison a series comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Observation,
    Model,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Observation => write!(f, "observation"),
            SourceKind::Model => write!(f, "model"),
        }
    }
}

/// Source of raw per-site time series. Implementations are shared between
/// worker threads and must not mutate on read.
pub trait SeriesProvider: Send + Sync {
    /// All site series of `variable` for a source, or `None` if the source
    /// does not provide the variable.
    fn series(&self, kind: SourceKind, source_id: &str, variable: &str) -> Option<Vec<TimeSeries>>;

    /// Variable names a source provides.
    fn variables(&self, kind: SourceKind, source_id: &str) -> Vec<String>;
}

/// Provider holding every series in memory, keyed by source and variable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: BTreeMap<(SourceKind, String), BTreeMap<String, Vec<TimeSeries>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: SourceKind, series: TimeSeries) {
        self.entries
            .entry((kind, series.source_id().to_string()))
            .or_default()
            .entry(series.variable().to_string())
            .or_default()
            .push(series);
    }

    pub fn extend(&mut self, other: InMemoryCatalog) {
        for ((kind, _), variables) in other.entries {
            for series in variables.into_values().flatten() {
                self.insert(kind, series);
            }
        }
    }

    pub fn sources(&self, kind: SourceKind) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
    }

    /// Total number of site series.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|vars| vars.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SeriesProvider for InMemoryCatalog {
    fn series(&self, kind: SourceKind, source_id: &str, variable: &str) -> Option<Vec<TimeSeries>> {
        self.entries
            .get(&(kind, source_id.to_string()))
            .and_then(|vars| vars.get(variable))
            .cloned()
    }

    fn variables(&self, kind: SourceKind, source_id: &str) -> Vec<String> {
        self.entries
            .get(&(kind, source_id.to_string()))
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frequency, Sample, SeriesMeta, Site};
    use chrono::NaiveDate;

    fn series(source: &str, variable: &str, site: &str) -> TimeSeries {
        let time = NaiveDate::from_ymd_opt(2010, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let meta = SeriesMeta::new(variable, "1", source, Site::new(site, site, 10.0, 10.0, 0.0));
        TimeSeries::new(meta, Frequency::Daily, vec![Sample::new(time, 1.0)]).unwrap()
    }

    #[test]
    fn test_catalog_lookup() {
        let mut catalog = InMemoryCatalog::new();
        catalog.insert(SourceKind::Observation, series("AERONET", "od550aer", "a"));
        catalog.insert(SourceKind::Observation, series("AERONET", "od550aer", "b"));
        catalog.insert(SourceKind::Model, series("AERONET", "od550aer", "a"));

        assert_eq!(catalog.len(), 3);
        assert_eq!(
            catalog
                .series(SourceKind::Observation, "AERONET", "od550aer")
                .map(|s| s.len()),
            Some(2)
        );
        assert!(catalog.series(SourceKind::Observation, "AERONET", "abs550aer").is_none());
        assert!(catalog.series(SourceKind::Observation, "EBAS", "od550aer").is_none());
        assert_eq!(catalog.variables(SourceKind::Model, "AERONET"), vec!["od550aer"]);
        assert_eq!(catalog.sources(SourceKind::Model).count(), 1);
    }
}
