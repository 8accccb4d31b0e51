use crate::models::{Site, TimeSeries, Variable};
use crate::utils::coordinates::longitude_in_range;

/// Masks implausible values and QC-flagged samples. Masked samples become
/// missing but keep their place in the index.
#[derive(Debug, Clone, Default)]
pub struct OutlierFilter {
    range: Option<(f64, f64)>,
    mask_flagged: bool,
}

impl OutlierFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Range check using an explicit override, falling back to the
    /// variable's registered range. No range at all means no bounds.
    pub fn for_variable(variable: Option<&Variable>, override_range: Option<(f64, f64)>) -> Self {
        Self {
            range: override_range.or_else(|| variable.and_then(|v| v.outlier_range)),
            mask_flagged: false,
        }
    }

    pub fn with_range(mut self, low: f64, high: f64) -> Self {
        self.range = Some((low, high));
        self
    }

    pub fn with_flag_masking(mut self, mask_flagged: bool) -> Self {
        self.mask_flagged = mask_flagged;
        self
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    pub fn apply(&self, series: &TimeSeries) -> TimeSeries {
        if self.range.is_none() && !self.mask_flagged {
            return series.clone();
        }
        series.map_values(|sample, value| {
            if self.mask_flagged && sample.flagged {
                return None;
            }
            match self.range {
                Some((low, high)) if value < low || value > high => None,
                _ => Some(value),
            }
        })
    }
}

/// Site and data-level selection from `obs_filters`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteFilter {
    pub latitude: Option<(f64, f64)>,
    pub longitude: Option<(f64, f64)>,
    pub altitude: Option<(f64, f64)>,
    /// Accepted data levels; series declaring a level outside them are dropped.
    pub min_data_level: Option<u8>,
    pub max_data_level: Option<u8>,
}

impl SiteFilter {
    pub fn accepts_site(&self, site: &Site) -> bool {
        self.latitude
            .map_or(true, |(lo, hi)| (lo..=hi).contains(&site.latitude))
            && self
                .longitude
                .map_or(true, |range| longitude_in_range(site.normalized_longitude(), range))
            && self
                .altitude
                .map_or(true, |(lo, hi)| (lo..=hi).contains(&site.altitude))
    }

    pub fn accepts(&self, series: &TimeSeries) -> bool {
        let level_ok = series.meta().data_level.map_or(true, |level| {
            self.min_data_level.map_or(true, |min| level >= min)
                && self.max_data_level.map_or(true, |max| level <= max)
        });
        level_ok && self.accepts_site(series.site())
    }
}

/// Replace exact zeros with missing values.
pub fn zeros_to_missing(series: &TimeSeries) -> TimeSeries {
    series.map_values(|_, v| if v == 0.0 { None } else { Some(v) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frequency, Sample, SeriesMeta};
    use chrono::{NaiveDate, NaiveDateTime};

    fn t(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 3, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn series(values: &[f64]) -> TimeSeries {
        let meta = SeriesMeta::new("od550aer", "1", "AeronetSun", Site::new("s", "s", 45.0, 5.0, 100.0));
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(t(i as u32 + 1), *v))
            .collect();
        TimeSeries::new(meta, Frequency::Daily, samples).unwrap()
    }

    #[test]
    fn test_out_of_range_becomes_missing() {
        let filter = OutlierFilter::new().with_range(0.0, 1.0);
        let filtered = filter.apply(&series(&[0.5, 1.5, 1.0, -0.1]));
        assert_eq!(filtered.values(), vec![Some(0.5), None, Some(1.0), None]);
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_registered_range_and_override() {
        let var = Variable::new("od550aer", "1").with_outlier_range(-1.0, 10.0);
        let default = OutlierFilter::for_variable(Some(&var), None);
        assert_eq!(default.range(), Some((-1.0, 10.0)));
        let custom = OutlierFilter::for_variable(Some(&var), Some((0.0, 1.0)));
        assert_eq!(custom.range(), Some((0.0, 1.0)));
        let unbounded = OutlierFilter::for_variable(None, None);
        assert_eq!(unbounded.apply(&series(&[1e9])).valid_count(), 1);
    }

    #[test]
    fn test_flag_masking() {
        let meta = SeriesMeta::new("concpm10", "ug m-3", "EBAS", Site::new("s", "s", 45.0, 5.0, 100.0));
        let ts = TimeSeries::new(
            meta,
            Frequency::Daily,
            vec![Sample::new(t(1), 3.0).flagged(), Sample::new(t(2), 4.0)],
        )
        .unwrap();
        assert_eq!(OutlierFilter::new().apply(&ts).valid_count(), 2);
        let masked = OutlierFilter::new().with_flag_masking(true).apply(&ts);
        assert_eq!(masked.values(), vec![None, Some(4.0)]);
    }

    #[test]
    fn test_zeros_to_missing_never_adds_valid_samples() {
        let ts = series(&[0.0, 1.0, 0.0, 2.0]);
        let converted = zeros_to_missing(&ts);
        assert_eq!(converted.valid_count(), 2);
        assert!(converted.valid_count() <= ts.valid_count());
    }

    #[test]
    fn test_site_filter() {
        let filter = SiteFilter {
            latitude: Some((30.0, 82.0)),
            longitude: Some((-30.0, 90.0)),
            altitude: Some((-200.0, 5000.0)),
            min_data_level: None,
            max_data_level: Some(2),
        };
        assert!(filter.accepts_site(&Site::new("a", "a", 50.0, 10.0, 300.0)));
        assert!(!filter.accepts_site(&Site::new("b", "b", 10.0, 10.0, 300.0)));

        let meta = SeriesMeta::new("concpm10", "ug m-3", "EBAS", Site::new("c", "c", 50.0, 10.0, 300.0))
            .with_data_level(3);
        let ts = TimeSeries::new(meta, Frequency::Daily, vec![]).unwrap();
        assert!(!filter.accepts(&ts));

        let floor = SiteFilter {
            min_data_level: Some(2),
            ..SiteFilter::default()
        };
        let site = Site::new("d", "d", 50.0, 10.0, 300.0);
        let level = |l| {
            let meta = SeriesMeta::new("concpm10", "ug m-3", "EBAS", site.clone()).with_data_level(l);
            TimeSeries::new(meta, Frequency::Daily, vec![]).unwrap()
        };
        assert!(!floor.accepts(&level(1)));
        assert!(floor.accepts(&level(2)));
    }
}
