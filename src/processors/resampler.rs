use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ProcessingError, Result};
use crate::models::{Frequency, Sample, TimeSeries};
use crate::processors::constraints::{BucketSupport, ResampleConstraints};

/// How the finer values of one bucket are reduced to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    #[default]
    Mean,
    Median,
    Max,
    Min,
    Sum,
    Std,
}

impl AggregationMethod {
    /// Reduce `(value, weight)` pairs. Weights only affect the mean.
    pub fn aggregate(&self, values: &[(f64, u32)], weighted: bool) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        match self {
            AggregationMethod::Mean => {
                if weighted {
                    let total: f64 = values.iter().map(|(_, w)| *w as f64).sum();
                    if total <= 0.0 {
                        return None;
                    }
                    Some(values.iter().map(|(v, w)| v * *w as f64).sum::<f64>() / total)
                } else {
                    Some(values.iter().map(|(v, _)| v).sum::<f64>() / n)
                }
            }
            AggregationMethod::Median => {
                let mut sorted: Vec<f64> = values.iter().map(|(v, _)| *v).collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
            AggregationMethod::Max => values.iter().map(|(v, _)| *v).reduce(f64::max),
            AggregationMethod::Min => values.iter().map(|(v, _)| *v).reduce(f64::min),
            AggregationMethod::Sum => Some(values.iter().map(|(v, _)| v).sum()),
            AggregationMethod::Std => {
                if values.len() < 2 {
                    return None;
                }
                let mean = values.iter().map(|(v, _)| v).sum::<f64>() / n;
                let var = values.iter().map(|(v, _)| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Some(var.sqrt())
            }
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationMethod::Mean => "mean",
            AggregationMethod::Median => "median",
            AggregationMethod::Max => "max",
            AggregationMethod::Min => "min",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Std => "std",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for AggregationMethod {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(AggregationMethod::Mean),
            "median" => Ok(AggregationMethod::Median),
            "max" => Ok(AggregationMethod::Max),
            "min" => Ok(AggregationMethod::Min),
            "sum" => Ok(AggregationMethod::Sum),
            "std" => Ok(AggregationMethod::Std),
            other => Err(ProcessingError::config(format!(
                "unknown aggregation method '{}'",
                other
            ))),
        }
    }
}

/// `resample_how`: variable -> target -> source -> method.
pub type ResampleHowTable =
    BTreeMap<String, BTreeMap<Frequency, BTreeMap<Frequency, AggregationMethod>>>;

/// Aggregates series to coarser frequencies under resample constraints.
#[derive(Debug, Clone)]
pub struct TemporalResampler<'a> {
    constraints: &'a ResampleConstraints,
    how: Option<&'a ResampleHowTable>,
    default_how: AggregationMethod,
    weighted: bool,
}

impl<'a> TemporalResampler<'a> {
    pub fn new(constraints: &'a ResampleConstraints) -> Self {
        Self {
            constraints,
            how: None,
            default_how: AggregationMethod::Mean,
            weighted: false,
        }
    }

    pub fn with_how_table(mut self, how: &'a ResampleHowTable) -> Self {
        self.how = Some(how);
        self
    }

    pub fn with_default_how(mut self, method: AggregationMethod) -> Self {
        self.default_how = method;
        self
    }

    pub fn with_weighting(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    pub fn constraints(&self) -> &ResampleConstraints {
        self.constraints
    }

    pub fn method_for(&self, variable: &str, target: Frequency, source: Frequency) -> AggregationMethod {
        self.how
            .and_then(|table| table.get(variable))
            .and_then(|targets| targets.get(&target))
            .and_then(|sources| sources.get(&source))
            .copied()
            .unwrap_or(self.default_how)
    }

    /// Aggregate `series` to `target`, step by step along the canonical chain.
    /// Each step only sees the buckets the previous step accepted, so a coarse
    /// bucket built from unsupported finer buckets is missing. An entry that
    /// skips levels, such as monthly from hourly, is checked against the count
    /// of valid base samples in each bucket of that step.
    pub fn resample(&self, series: &TimeSeries, target: Frequency) -> Result<TimeSeries> {
        let base_frequency = series.frequency();
        let steps = base_frequency.resample_steps(target)?;
        let base = self.regularize(series);
        let mut current = base.clone();
        for (from, to) in steps {
            current = self.aggregate_step(&current, from, to);
            if from != base_frequency {
                if let Some(required) = self.constraints.min_required(to, base_frequency) {
                    current = self.apply_base_floor(&current, &base, required);
                }
            }
        }
        Ok(current)
    }

    /// Mask buckets of `series` holding fewer than `required` valid samples of
    /// `base`.
    fn apply_base_floor(&self, series: &TimeSeries, base: &TimeSeries, required: u32) -> TimeSeries {
        let to = series.frequency();
        let mut counts: BTreeMap<NaiveDateTime, u32> = BTreeMap::new();
        for sample in base.samples().iter().filter(|s| s.is_valid()) {
            *counts.entry(to.bucket_start(sample.time)).or_default() += 1;
        }
        let floored = series.map_values(|sample, value| {
            let found = counts.get(&sample.time).copied().unwrap_or(0);
            (found >= required).then_some(value)
        });
        let masked = series.valid_count() - floored.valid_count();
        if masked > 0 {
            debug!(
                variable = series.variable(),
                site = %series.site().id,
                from = %base.frequency(),
                %to,
                masked,
                "buckets below direct resample constraint set to missing"
            );
        }
        floored
    }

    /// Snap samples onto bucket starts of the series' own frequency. Several
    /// samples in one bucket are averaged; no constraint applies.
    fn regularize(&self, series: &TimeSeries) -> TimeSeries {
        let frequency = series.frequency();
        let mut buckets: BTreeMap<NaiveDateTime, Vec<&Sample>> = BTreeMap::new();
        for sample in series.samples() {
            buckets
                .entry(frequency.bucket_start(sample.time))
                .or_default()
                .push(sample);
        }

        let samples = buckets
            .into_iter()
            .map(|(time, members)| {
                if let [single] = members.as_slice() {
                    return Sample { time, ..**single };
                }
                let values: Vec<(f64, u32)> = members
                    .iter()
                    .filter_map(|s| s.value.map(|v| (v, s.weight.max(1))))
                    .collect();
                match AggregationMethod::Mean.aggregate(&values, self.weighted) {
                    Some(value) => Sample {
                        time,
                        value: Some(value),
                        flagged: members.iter().all(|s| s.flagged),
                        weight: values.iter().map(|(_, w)| w).sum(),
                    },
                    None => Sample::missing(time),
                }
            })
            .collect();

        series.with_samples(frequency, samples)
    }

    fn aggregate_step(&self, series: &TimeSeries, from: Frequency, to: Frequency) -> TimeSeries {
        let method = self.method_for(series.variable(), to, from);

        let mut buckets: BTreeMap<NaiveDateTime, Vec<(f64, u32)>> = BTreeMap::new();
        for sample in series.samples() {
            let entry = buckets.entry(to.bucket_start(sample.time)).or_default();
            if let Some(value) = sample.value {
                entry.push((value, sample.weight.max(1)));
            }
        }

        let mut insufficient = 0usize;
        let samples: Vec<Sample> = buckets
            .into_iter()
            .map(|(time, values)| match self.constraints.check(to, from, values.len() as u32) {
                BucketSupport::Sufficient { .. } => match method.aggregate(&values, self.weighted) {
                    Some(value) => Sample {
                        time,
                        value: Some(value),
                        flagged: false,
                        weight: values.iter().map(|(_, w)| w).sum(),
                    },
                    None => Sample::missing(time),
                },
                BucketSupport::InsufficientData { .. } => {
                    insufficient += 1;
                    Sample::missing(time)
                }
            })
            .collect();

        if insufficient > 0 {
            debug!(
                variable = series.variable(),
                site = %series.site().id,
                %from,
                %to,
                insufficient,
                "buckets below resample constraint set to missing"
            );
        }

        series.with_samples(to, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SeriesMeta, Site};
    use chrono::{Duration, NaiveDate};
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn build(variable: &str, frequency: Frequency, samples: Vec<Sample>) -> TimeSeries {
        let meta = SeriesMeta::new(variable, "ug m-3", "EBAS", Site::new("s1", "s1", 60.0, 10.0, 10.0));
        TimeSeries::new(meta, frequency, samples).unwrap()
    }

    fn monthly(months: &[u32], value: f64) -> TimeSeries {
        build(
            "concpm10",
            Frequency::Monthly,
            months.iter().map(|m| Sample::new(date(2017, *m, 1), value)).collect(),
        )
    }

    #[test]
    fn test_yearly_from_eleven_months() {
        let series = monthly(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11], 2.0);

        let nine = ResampleConstraints::none()
            .with_entry(Frequency::Yearly, Frequency::Monthly, 9)
            .unwrap();
        let yearly = TemporalResampler::new(&nine).resample(&series, Frequency::Yearly).unwrap();
        assert_eq!(yearly.values(), vec![Some(2.0)]);

        let twelve = ResampleConstraints::none()
            .with_entry(Frequency::Yearly, Frequency::Monthly, 12)
            .unwrap();
        let yearly = TemporalResampler::new(&twelve).resample(&series, Frequency::Yearly).unwrap();
        assert_eq!(yearly.values(), vec![None]);
        assert_eq!(yearly.len(), 1);
    }

    #[test]
    fn test_insufficiency_propagates_upwards() {
        // two days in every month, each month needs five
        let mut samples = Vec::new();
        for m in 1..=12 {
            samples.push(Sample::new(date(2017, m, 1), 1.0));
            samples.push(Sample::new(date(2017, m, 2), 3.0));
        }
        let series = build("concpm10", Frequency::Daily, samples);
        let constraints = ResampleConstraints::none()
            .with_entry(Frequency::Monthly, Frequency::Daily, 5)
            .unwrap();
        let resampler = TemporalResampler::new(&constraints);

        let monthly = resampler.resample(&series, Frequency::Monthly).unwrap();
        assert_eq!(monthly.valid_count(), 0);
        let yearly = resampler.resample(&series, Frequency::Yearly).unwrap();
        assert_eq!(yearly.values(), vec![None]);
    }

    #[test]
    fn test_constraint_skipping_a_level() {
        // 30 days with 6 valid hours each, in January 2017
        let mut samples = Vec::new();
        for d in 1..=30 {
            for h in 0..6 {
                samples.push(Sample::new(date(2017, 1, d) + Duration::hours(h), 2.0));
            }
        }
        let series = build("concpm10", Frequency::Hourly, samples);

        let loose = ResampleConstraints::none()
            .with_entry(Frequency::Monthly, Frequency::Hourly, 180)
            .unwrap();
        let monthly = TemporalResampler::new(&loose)
            .resample(&series, Frequency::Monthly)
            .unwrap();
        assert_eq!(monthly.values(), vec![Some(2.0)]);

        let strict = ResampleConstraints::none()
            .with_entry(Frequency::Monthly, Frequency::Hourly, 181)
            .unwrap();
        let resampler = TemporalResampler::new(&strict);
        let monthly = resampler.resample(&series, Frequency::Monthly).unwrap();
        assert_eq!(monthly.values(), vec![None]);
        assert_eq!(resampler.resample(&series, Frequency::Yearly).unwrap().values(), vec![None]);

        // the direct floor only applies to series starting at the named base
        let daily = resampler.resample(&series, Frequency::Daily).unwrap();
        assert_eq!(daily.valid_count(), 30);
        assert_eq!(
            resampler.resample(&daily, Frequency::Monthly).unwrap().values(),
            vec![Some(2.0)]
        );
    }

    #[test]
    fn test_daily_max_then_monthly_mean() {
        let mut samples = Vec::new();
        for d in 1..=3 {
            for h in 0..24 {
                let t = date(2018, 6, d) + Duration::hours(h);
                samples.push(Sample::new(t, (d * 10) as f64 + h as f64));
            }
        }
        let series = build("vmro3max", Frequency::Hourly, samples);

        let mut how = ResampleHowTable::new();
        how.entry("vmro3max".to_string())
            .or_default()
            .entry(Frequency::Daily)
            .or_default()
            .insert(Frequency::Hourly, AggregationMethod::Max);

        let constraints = ResampleConstraints::none();
        let resampler = TemporalResampler::new(&constraints).with_how_table(&how);

        let daily = resampler.resample(&series, Frequency::Daily).unwrap();
        assert_eq!(daily.values(), vec![Some(33.0), Some(43.0), Some(53.0)]);

        let monthly = resampler.resample(&series, Frequency::Monthly).unwrap();
        assert_eq!(monthly.values(), vec![Some(43.0)]);
    }

    #[test]
    fn test_weighted_mean_uses_sample_counts() {
        // 1 hour at 10.0 on day 1, 3 hours at 2.0 on day 2
        let samples = vec![
            Sample::new(date(2018, 1, 1), 10.0),
            Sample::new(date(2018, 1, 2), 2.0),
            Sample::new(date(2018, 1, 2) + Duration::hours(1), 2.0),
            Sample::new(date(2018, 1, 2) + Duration::hours(2), 2.0),
        ];
        let series = build("concpm10", Frequency::Hourly, samples);
        let constraints = ResampleConstraints::none();

        let plain = TemporalResampler::new(&constraints)
            .resample(&series, Frequency::Monthly)
            .unwrap();
        assert_eq!(plain.values(), vec![Some(6.0)]);

        let weighted = TemporalResampler::new(&constraints)
            .with_weighting(true)
            .resample(&series, Frequency::Monthly)
            .unwrap();
        assert_eq!(weighted.values(), vec![Some(4.0)]);
        assert_eq!(weighted.samples()[0].weight, 4);
    }

    #[test]
    fn test_resampling_is_idempotent() {
        let mut samples = Vec::new();
        for d in 1..=40 {
            let t = date(2019, 1, 1) + Duration::days(d) + Duration::hours(d % 5);
            samples.push(Sample::new(t, d as f64 * 0.5));
        }
        let series = build("concpm10", Frequency::Daily, samples);
        let constraints = ResampleConstraints::none()
            .with_entry(Frequency::Monthly, Frequency::Daily, 10)
            .unwrap();
        let resampler = TemporalResampler::new(&constraints).with_weighting(true);

        let once = resampler.resample(&series, Frequency::Monthly).unwrap();
        let twice = resampler.resample(&once, Frequency::Monthly).unwrap();
        assert_eq!(once, twice);

        let daily = resampler.resample(&series, Frequency::Daily).unwrap();
        assert_eq!(daily, resampler.resample(&daily, Frequency::Daily).unwrap());
    }

    #[test]
    fn test_rejects_finer_target() {
        let series = monthly(&[1, 2], 1.0);
        let constraints = ResampleConstraints::none();
        assert!(TemporalResampler::new(&constraints)
            .resample(&series, Frequency::Daily)
            .is_err());
    }

    #[test]
    fn test_aggregation_methods() {
        let values = [(1.0, 1), (4.0, 1), (2.0, 1), (3.0, 1)];
        assert_eq!(AggregationMethod::Median.aggregate(&values, false), Some(2.5));
        assert_eq!(AggregationMethod::Max.aggregate(&values, false), Some(4.0));
        assert_eq!(AggregationMethod::Min.aggregate(&values, false), Some(1.0));
        assert_eq!(AggregationMethod::Sum.aggregate(&values, false), Some(10.0));
        let std = AggregationMethod::Std.aggregate(&values, false).unwrap();
        assert!((std - 1.2909944).abs() < 1e-6);
        assert_eq!(AggregationMethod::Std.aggregate(&[(1.0, 1)], false), None);
        assert_eq!("MEDIAN".parse::<AggregationMethod>().unwrap(), AggregationMethod::Median);
    }
}
