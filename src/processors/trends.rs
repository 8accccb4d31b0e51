use chrono::Datelike;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ProcessingError, Result};
use crate::models::{ColocatedDataset, Frequency, Period, Region};
use crate::processors::resampler::TemporalResampler;
use crate::processors::statistics::resample_pair;
use crate::utils::constants::{DEFAULT_MIN_TREND_YEARS, DEFAULT_SLOPE_ALPHA};

/// Which side of a comparison a trend was fitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataRole {
    Obs,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendSettings {
    pub obs_min_yrs: u32,
    pub stats_min_yrs: u32,
    pub sequential_yrs: bool,
    pub avg_over_trends: bool,
    /// Confidence level of the slope interval; significance is `p < 1 - slope_alpha`.
    pub slope_alpha: f64,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            obs_min_yrs: DEFAULT_MIN_TREND_YEARS,
            stats_min_yrs: DEFAULT_MIN_TREND_YEARS,
            sequential_yrs: false,
            avg_over_trends: false,
            slope_alpha: DEFAULT_SLOPE_ALPHA,
        }
    }
}

impl TrendSettings {
    fn min_years(&self, role: DataRole) -> u32 {
        match role {
            DataRole::Obs => self.obs_min_yrs,
            DataRole::Model => self.stats_min_yrs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    /// Units per year.
    pub slope: f64,
    /// Percent of the intercept per year.
    pub slope_pct: Option<f64>,
    /// Fitted value at the first year of the period.
    pub intercept: f64,
    pub slope_low: f64,
    pub slope_high: f64,
    pub p_value: f64,
    pub significant: bool,
    pub num_years: usize,
    pub num_subtrends: usize,
    pub meets_obs_min_yrs: bool,
    pub meets_stats_min_yrs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrendOutcome {
    Computed(TrendResult),
    InsufficientData {
        available_years: usize,
        required_years: u32,
        reason: String,
    },
}

impl TrendOutcome {
    pub fn is_computed(&self) -> bool {
        matches!(self, TrendOutcome::Computed(_))
    }

    pub fn result(&self) -> Option<&TrendResult> {
        match self {
            TrendOutcome::Computed(result) => Some(result),
            TrendOutcome::InsufficientData { .. } => None,
        }
    }
}

/// Trend of one side of one (model, obs, variable, period, region) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub model: String,
    pub obs: String,
    pub variable: String,
    pub period: Period,
    pub region: String,
    pub role: DataRole,
    pub outcome: TrendOutcome,
}

struct Fit {
    slope: f64,
    intercept: f64,
    slope_low: f64,
    slope_high: f64,
    p_value: f64,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Mann-Kendall S statistic and its tie-corrected variance.
fn mann_kendall(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    let mut s = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = values[j] - values[i];
            if diff > 0.0 {
                s += 1.0;
            } else if diff < 0.0 {
                s -= 1.0;
            }
        }
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && sorted[j + 1] == sorted[i] {
            j += 1;
        }
        let t = (j - i + 1) as f64;
        tie_term += t * (t - 1.0) * (2.0 * t + 5.0);
        i = j + 1;
    }
    let n = n as f64;
    let var = (n * (n - 1.0) * (2.0 * n + 5.0) - tie_term) / 18.0;
    (s, var)
}

/// Fits trends with the Theil-Sen slope and a Mann-Kendall significance test.
pub struct TrendsEstimator<'a> {
    settings: &'a TrendSettings,
    normal: Normal,
}

impl<'a> TrendsEstimator<'a> {
    pub fn new(settings: &'a TrendSettings) -> Result<Self> {
        if !(0.0..1.0).contains(&settings.slope_alpha) {
            return Err(ProcessingError::config(format!(
                "slope_alpha must be in [0, 1), got {}",
                settings.slope_alpha
            )));
        }
        let normal = Normal::new(0.0, 1.0).map_err(|e| ProcessingError::config(e.to_string()))?;
        Ok(Self { settings, normal })
    }

    fn fit_points(&self, points: &[(i32, f64)], start_year: i32) -> Option<Fit> {
        if points.len() < 2 {
            return None;
        }
        let mut slopes = Vec::with_capacity(points.len() * (points.len() - 1) / 2);
        for (i, (x1, y1)) in points.iter().enumerate() {
            for (x2, y2) in &points[i + 1..] {
                if x2 != x1 {
                    slopes.push((y2 - y1) / (*x2 - *x1) as f64);
                }
            }
        }
        let slope = median(&mut slopes)?;
        let mut residuals: Vec<f64> = points
            .iter()
            .map(|(x, y)| y - slope * (x - start_year) as f64)
            .collect();
        let intercept = median(&mut residuals)?;

        let values: Vec<f64> = points.iter().map(|(_, y)| *y).collect();
        let (s, var) = mann_kendall(&values);
        let p_value = if var > 0.0 {
            let z = if s > 0.0 {
                (s - 1.0) / var.sqrt()
            } else if s < 0.0 {
                (s + 1.0) / var.sqrt()
            } else {
                0.0
            };
            (2.0 * (1.0 - self.normal.cdf(z.abs()))).clamp(0.0, 1.0)
        } else {
            1.0
        };

        // Sen's confidence interval; `slopes` is sorted by `median`
        let z_crit = self.normal.inverse_cdf(1.0 - (1.0 - self.settings.slope_alpha) / 2.0);
        let c = z_crit * var.max(0.0).sqrt();
        let n = slopes.len() as f64;
        let last = slopes.len() - 1;
        let lower = (((n - c) / 2.0).round() as isize - 1).clamp(0, last as isize) as usize;
        let upper = (((n + c) / 2.0).round() as isize).clamp(0, last as isize) as usize;

        Some(Fit {
            slope,
            intercept,
            slope_low: slopes[lower],
            slope_high: slopes[upper],
            p_value,
        })
    }

    fn has_gap(points: &[(i32, f64)]) -> bool {
        points.windows(2).any(|w| w[1].0 - w[0].0 > 1)
    }

    /// Fit `(year, value)` points inside `period` for one side. Too few
    /// qualifying years, or a gap with `sequential_yrs`, is reported as
    /// insufficient data.
    pub fn fit(&self, points: &[(i32, f64)], period: Period, role: DataRole) -> TrendOutcome {
        let mut points: Vec<(i32, f64)> = points
            .iter()
            .filter(|(year, value)| period.contains_year(*year) && value.is_finite())
            .copied()
            .collect();
        points.sort_by_key(|(year, _)| *year);
        points.dedup_by_key(|(year, _)| *year);

        let required = self.settings.min_years(role);
        let available = points.len();
        let insufficient = |reason: &str| TrendOutcome::InsufficientData {
            available_years: available,
            required_years: required,
            reason: reason.to_string(),
        };

        if available < (required as usize).max(2) {
            return insufficient("too few years with data");
        }
        if self.settings.sequential_yrs && Self::has_gap(&points) {
            return insufficient("years with data are not sequential");
        }

        let fits: Vec<Fit> = if self.settings.avg_over_trends {
            period
                .split(required.max(2))
                .iter()
                .filter_map(|sub| {
                    let chunk: Vec<(i32, f64)> = points
                        .iter()
                        .filter(|(year, _)| sub.contains_year(*year))
                        .copied()
                        .collect();
                    self.fit_points(&chunk, sub.start_year)
                })
                .collect()
        } else {
            self.fit_points(&points, period.start_year).into_iter().collect()
        };
        if fits.is_empty() {
            return insufficient("no sub-period could be fitted");
        }

        let count = fits.len() as f64;
        let mean = |f: fn(&Fit) -> f64| fits.iter().map(f).sum::<f64>() / count;
        let slope = mean(|f| f.slope);
        let p_value = mean(|f| f.p_value);
        let intercept = if fits.len() == 1 {
            fits[0].intercept
        } else {
            let mut residuals: Vec<f64> = points
                .iter()
                .map(|(x, y)| y - slope * (x - period.start_year) as f64)
                .collect();
            median(&mut residuals).unwrap_or(fits[0].intercept)
        };

        TrendOutcome::Computed(TrendResult {
            slope,
            slope_pct: (intercept != 0.0).then(|| slope / intercept * 100.0),
            intercept,
            slope_low: mean(|f| f.slope_low),
            slope_high: mean(|f| f.slope_high),
            p_value,
            significant: p_value < 1.0 - self.settings.slope_alpha,
            num_years: available,
            num_subtrends: fits.len(),
            meets_obs_min_yrs: available >= self.settings.obs_min_yrs as usize,
            meets_stats_min_yrs: available >= self.settings.stats_min_yrs as usize,
        })
    }

    /// Regional mean yearly series of both sides: for each year, the mean of
    /// the stations holding a valid yearly value.
    pub fn regional_series(
        &self,
        resampler: &TemporalResampler<'_>,
        dataset: &ColocatedDataset,
        region: &Region,
    ) -> Result<(Vec<(i32, f64)>, Vec<(i32, f64)>)> {
        let mut obs: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
        let mut model: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
        for pair in dataset.pairs.iter().filter(|p| region.contains(&p.site)) {
            let yearly = resample_pair(resampler, dataset, pair, Frequency::Yearly)?;
            for row in yearly.rows() {
                let year = row.time.year();
                if let Some(v) = row.obs {
                    obs.entry(year).or_default().push(v);
                }
                if let Some(v) = row.model {
                    model.entry(year).or_default().push(v);
                }
            }
        }
        let collapse = |map: BTreeMap<i32, Vec<f64>>| -> Vec<(i32, f64)> {
            map.into_iter()
                .map(|(year, values)| (year, values.iter().sum::<f64>() / values.len() as f64))
                .collect()
        };
        Ok((collapse(obs), collapse(model)))
    }

    /// Obs and model trend records for every region.
    pub fn compute(
        &self,
        resampler: &TemporalResampler<'_>,
        dataset: &ColocatedDataset,
        regions: &[Region],
    ) -> Result<Vec<TrendRecord>> {
        let period = dataset.key.period;
        let mut records = Vec::with_capacity(regions.len() * 2);
        for region in regions {
            let (obs, model) = self.regional_series(resampler, dataset, region)?;
            for (role, points) in [(DataRole::Obs, &obs), (DataRole::Model, &model)] {
                let outcome = self.fit(points, period, role);
                debug!(
                    combination = %dataset.key,
                    region = %region.name,
                    ?role,
                    computed = outcome.is_computed(),
                    "trend fitted"
                );
                records.push(TrendRecord {
                    model: dataset.key.model.clone(),
                    obs: dataset.key.obs.clone(),
                    variable: dataset.key.variable.clone(),
                    period,
                    region: region.name.clone(),
                    role,
                    outcome,
                });
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactKey, ColocatedPair, PairedValue, Site};
    use crate::processors::constraints::ResampleConstraints;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn settings(min: u32) -> TrendSettings {
        TrendSettings {
            obs_min_yrs: min,
            stats_min_yrs: min,
            ..TrendSettings::default()
        }
    }

    fn linear(years: impl Iterator<Item = i32>) -> Vec<(i32, f64)> {
        years.map(|y| (y, 10.0 + 0.5 * (y - 2000) as f64)).collect()
    }

    #[test]
    fn test_linear_trend() {
        let s = settings(7);
        let estimator = TrendsEstimator::new(&s).unwrap();
        let period = Period::new(2000, 2009).unwrap();
        let outcome = estimator.fit(&linear(2000..=2009), period, DataRole::Obs);
        let result = outcome.result().unwrap();
        assert!((result.slope - 0.5).abs() < 1e-12);
        assert!((result.intercept - 10.0).abs() < 1e-12);
        assert!((result.slope_pct.unwrap() - 5.0).abs() < 1e-9);
        assert!(result.significant);
        assert!(result.p_value < 0.01);
        assert!(result.slope_low <= result.slope && result.slope <= result.slope_high);
        assert_eq!(result.num_years, 10);
        assert_eq!(result.num_subtrends, 1);
    }

    #[test]
    fn test_trendless_series_is_not_significant() {
        let s = settings(4);
        let estimator = TrendsEstimator::new(&s).unwrap();
        let points: Vec<(i32, f64)> = (2000..2008)
            .map(|y| (y, if y % 2 == 0 { 1.0 } else { 2.0 }))
            .collect();
        let outcome = estimator.fit(&points, Period::new(2000, 2007).unwrap(), DataRole::Obs);
        let result = outcome.result().unwrap();
        assert!(!result.significant);
    }

    #[test]
    fn test_too_few_years() {
        let s = settings(7);
        let estimator = TrendsEstimator::new(&s).unwrap();
        let outcome = estimator.fit(&linear(2000..=2004), Period::new(2000, 2010).unwrap(), DataRole::Obs);
        assert_eq!(
            outcome,
            TrendOutcome::InsufficientData {
                available_years: 5,
                required_years: 7,
                reason: "too few years with data".to_string(),
            }
        );
    }

    #[test]
    fn test_sequential_years_reject_gaps() {
        let points: Vec<(i32, f64)> = linear((2000..=2010).filter(|y| *y != 2005));
        let period = Period::new(2000, 2010).unwrap();

        let strict = TrendSettings {
            sequential_yrs: true,
            ..settings(7)
        };
        let estimator = TrendsEstimator::new(&strict).unwrap();
        assert!(!estimator.fit(&points, period, DataRole::Obs).is_computed());

        let loose = settings(7);
        let estimator = TrendsEstimator::new(&loose).unwrap();
        assert!(estimator.fit(&points, period, DataRole::Obs).is_computed());
    }

    #[test]
    fn test_obs_and_model_thresholds() {
        let s = TrendSettings {
            obs_min_yrs: 4,
            stats_min_yrs: 7,
            ..TrendSettings::default()
        };
        let estimator = TrendsEstimator::new(&s).unwrap();
        let period = Period::new(2000, 2010).unwrap();
        let points = linear(2000..=2004);

        let obs = estimator.fit(&points, period, DataRole::Obs);
        let result = obs.result().unwrap();
        assert!(result.meets_obs_min_yrs);
        assert!(!result.meets_stats_min_yrs);
        assert!(!estimator.fit(&points, period, DataRole::Model).is_computed());
    }

    #[test]
    fn test_average_over_subperiods() {
        let s = TrendSettings {
            avg_over_trends: true,
            ..settings(4)
        };
        let estimator = TrendsEstimator::new(&s).unwrap();
        let outcome = estimator.fit(&linear(2000..=2013), Period::new(2000, 2013).unwrap(), DataRole::Obs);
        let result = outcome.result().unwrap();
        assert_eq!(result.num_subtrends, 3);
        assert!((result.slope - 0.5).abs() < 1e-12);
        assert!((result.intercept - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_regional_series_averages_stations() {
        let t = |y| NaiveDate::from_ymd_opt(y, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let pair = |id: &str, offset: f64| {
            let rows = (2000..2003)
                .map(|y| PairedValue {
                    time: t(y),
                    obs: Some(y as f64 - 2000.0 + offset),
                    model: Some(1.0),
                    weight: 1,
                })
                .collect();
            ColocatedPair::new(Site::new(id, id, 50.0, 10.0, 0.0), "cell", Frequency::Monthly, rows).unwrap()
        };
        let dataset = ColocatedDataset {
            key: ArtifactKey {
                model: "EMEP".to_string(),
                obs: "EBAS".to_string(),
                variable: "concpm10".to_string(),
                frequency: Frequency::Monthly,
                period: Period::new(2000, 2002).unwrap(),
                region: "ALL-wMOUNTAINS".to_string(),
            },
            unit: "ug m-3".to_string(),
            vertical_type: None,
            colocate_time: true,
            pairs: vec![pair("a", 0.0), pair("b", 2.0)],
        };
        let s = settings(3);
        let estimator = TrendsEstimator::new(&s).unwrap();
        let constraints = ResampleConstraints::none();
        let resampler = TemporalResampler::new(&constraints);
        let region = Region::bounding_box("WORLD", (-90.0, 90.0), (-180.0, 180.0));

        let (obs, model) = estimator.regional_series(&resampler, &dataset, &region).unwrap();
        assert_eq!(obs, vec![(2000, 1.0), (2001, 2.0), (2002, 3.0)]);
        assert_eq!(model.len(), 3);

        let records = estimator.compute(&resampler, &dataset, &[region]).unwrap();
        assert_eq!(records.len(), 2);
        assert!((records[0].outcome.result().unwrap().slope - 1.0).abs() < 1e-12);
        assert_eq!(records[1].role, DataRole::Model);
    }
}
