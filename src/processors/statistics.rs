use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProcessingError, Result};
use crate::models::{
    ColocatedDataset, ColocatedPair, Frequency, PairedValue, Period, Region, Sample, SeriesMeta,
    TimeSeries,
};
use crate::processors::constraints::ResampleConstraints;
use crate::processors::resampler::{AggregationMethod, ResampleHowTable, TemporalResampler};

/// Model-versus-observation comparison metrics over a set of paired values.
///
/// Every metric is `None` when it is undefined for the input, e.g. a
/// correlation over fewer than two points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonStats {
    pub num_valid: usize,
    pub num_coords: usize,
    pub refdata_mean: Option<f64>,
    pub data_mean: Option<f64>,
    /// Mean bias, model minus observation.
    pub mb: Option<f64>,
    /// Mean absolute bias.
    pub mab: Option<f64>,
    /// Normalised mean bias.
    pub nmb: Option<f64>,
    /// Modified normalised mean bias.
    pub mnmb: Option<f64>,
    /// Fractional gross error.
    pub fge: Option<f64>,
    pub rms: Option<f64>,
    pub r: Option<f64>,
    pub r_spearman: Option<f64>,
    pub weighted: bool,
}

fn weighted_mean(values: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let (sum, total) = values.fold((0.0, 0.0), |(s, t), (v, w)| (s + v * w, t + w));
    (total > 0.0).then(|| sum / total)
}

fn pearson(points: &[(f64, f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let mean_o = weighted_mean(points.iter().map(|(o, _, w)| (*o, *w)))?;
    let mean_m = weighted_mean(points.iter().map(|(_, m, w)| (*m, *w)))?;
    let (mut cov, mut var_o, mut var_m) = (0.0, 0.0, 0.0);
    for (o, m, w) in points {
        cov += w * (o - mean_o) * (m - mean_m);
        var_o += w * (o - mean_o).powi(2);
        var_m += w * (m - mean_m).powi(2);
    }
    if var_o <= 0.0 || var_m <= 0.0 {
        return None;
    }
    Some((cov / (var_o * var_m).sqrt()).clamp(-1.0, 1.0))
}

/// Ranks starting at 1, ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = rank;
        }
        i = j + 1;
    }
    ranks
}

impl ComparisonStats {
    pub fn empty(num_coords: usize, weighted: bool) -> Self {
        Self {
            num_valid: 0,
            num_coords,
            refdata_mean: None,
            data_mean: None,
            mb: None,
            mab: None,
            nmb: None,
            mnmb: None,
            fge: None,
            rms: None,
            r: None,
            r_spearman: None,
            weighted,
        }
    }

    /// Metrics over `(obs, model, weight)` points. Weights are only applied
    /// when `weighted` is set.
    pub fn compute(points: &[(f64, f64, f64)], num_coords: usize, weighted: bool) -> Self {
        if points.is_empty() {
            return Self::empty(num_coords, weighted);
        }
        let points: Vec<(f64, f64, f64)> = points
            .iter()
            .map(|(o, m, w)| (*o, *m, if weighted { *w } else { 1.0 }))
            .collect();

        let refdata_mean = weighted_mean(points.iter().map(|(o, _, w)| (*o, *w)));
        let data_mean = weighted_mean(points.iter().map(|(_, m, w)| (*m, *w)));
        let mb = weighted_mean(points.iter().map(|(o, m, w)| (m - o, *w)));
        let mab = weighted_mean(points.iter().map(|(o, m, w)| ((m - o).abs(), *w)));
        let rms = weighted_mean(points.iter().map(|(o, m, w)| ((m - o).powi(2), *w))).map(f64::sqrt);

        let sum_diff: f64 = points.iter().map(|(o, m, w)| (m - o) * w).sum();
        let sum_obs: f64 = points.iter().map(|(o, _, w)| o * w).sum();
        let nmb = (sum_obs != 0.0).then(|| sum_diff / sum_obs);

        let normalised = || {
            points
                .iter()
                .filter(|(o, m, _)| o + m != 0.0)
                .map(|(o, m, w)| ((m - o) / (m + o), *w))
        };
        let mnmb = weighted_mean(normalised()).map(|v| 2.0 * v);
        let fge = weighted_mean(normalised().map(|(v, w)| (v.abs(), w))).map(|v| 2.0 * v);

        let r = pearson(&points);
        let obs: Vec<f64> = points.iter().map(|(o, _, _)| *o).collect();
        let model: Vec<f64> = points.iter().map(|(_, m, _)| *m).collect();
        let ranked: Vec<(f64, f64, f64)> = ranks(&obs)
            .into_iter()
            .zip(ranks(&model))
            .map(|(o, m)| (o, m, 1.0))
            .collect();
        let r_spearman = pearson(&ranked);

        Self {
            num_valid: points.len(),
            num_coords,
            refdata_mean,
            data_mean,
            mb,
            mab,
            nmb,
            mnmb,
            fge,
            rms,
            r,
            r_spearman,
            weighted,
        }
    }
}

/// Statistics of one (model, obs, variable, period, frequency, region) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub model: String,
    pub obs: String,
    pub variable: String,
    pub period: Period,
    pub frequency: Frequency,
    pub region: String,
    pub is_main_freq: bool,
    /// All valid points of all stations.
    pub pooled: ComparisonStats,
    /// One point per station: the time means of each side.
    pub spatial: ComparisonStats,
}

/// Bring a colocated pair to a coarser frequency. Time-colocated pairs only
/// hold jointly valid rows, so both sides see the same buckets.
pub fn resample_pair(
    resampler: &TemporalResampler<'_>,
    dataset: &ColocatedDataset,
    pair: &ColocatedPair,
    frequency: Frequency,
) -> Result<ColocatedPair> {
    if frequency == pair.frequency {
        return Ok(pair.clone());
    }
    let side = |source: &str, pick: fn(&PairedValue) -> Option<f64>| {
        let meta = SeriesMeta::new(&dataset.key.variable, &dataset.unit, source, pair.site.clone());
        let samples = pair
            .rows()
            .iter()
            .map(|row| match pick(row) {
                Some(value) => Sample {
                    time: row.time,
                    value: Some(value),
                    flagged: false,
                    weight: row.weight.max(1),
                },
                None => Sample::missing(row.time),
            })
            .collect();
        TimeSeries::from_sorted(meta, pair.frequency, samples)
    };
    let obs = resampler.resample(&side(&dataset.key.obs, |r| r.obs), frequency)?;
    let model = resampler.resample(&side(&dataset.key.model, |r| r.model), frequency)?;

    let rows = obs
        .samples()
        .iter()
        .zip(model.samples())
        .filter_map(|(o, m)| {
            let row = PairedValue {
                time: o.time,
                obs: o.value,
                model: m.value,
                weight: o.weight,
            };
            (!dataset.colocate_time || row.is_valid()).then_some(row)
        })
        .collect();
    Ok(pair.with_rows(frequency, rows))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSettings {
    pub freqs: Vec<Frequency>,
    pub main_freq: Frequency,
    pub weighted_stats: bool,
    pub annual_stats_constrained: bool,
    pub zeros_to_nan: bool,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            freqs: vec![Frequency::Monthly, Frequency::Yearly],
            main_freq: Frequency::Monthly,
            weighted_stats: false,
            annual_stats_constrained: false,
            zeros_to_nan: false,
        }
    }
}

pub struct StatisticsAggregator<'a> {
    settings: &'a StatisticsSettings,
    constraints: ResampleConstraints,
    how: &'a ResampleHowTable,
    default_how: AggregationMethod,
}

impl<'a> StatisticsAggregator<'a> {
    pub fn new(
        settings: &'a StatisticsSettings,
        constraints: &ResampleConstraints,
        how: &'a ResampleHowTable,
        default_how: AggregationMethod,
    ) -> Self {
        let constraints = if settings.annual_stats_constrained {
            constraints.clone()
        } else {
            constraints.without_target(Frequency::Yearly)
        };
        Self {
            settings,
            constraints,
            how,
            default_how,
        }
    }

    fn resampler(&self) -> TemporalResampler<'_> {
        TemporalResampler::new(&self.constraints)
            .with_how_table(self.how)
            .with_default_how(self.default_how)
            .with_weighting(self.settings.weighted_stats)
    }

    pub fn resample_pair(
        &self,
        dataset: &ColocatedDataset,
        pair: &ColocatedPair,
        frequency: Frequency,
    ) -> Result<ColocatedPair> {
        resample_pair(&self.resampler(), dataset, pair, frequency)
    }

    fn valid_points(&self, pair: &ColocatedPair) -> Vec<(f64, f64, f64)> {
        pair.rows()
            .iter()
            .filter_map(|row| {
                let (o, m) = (row.obs?, row.model?);
                if self.settings.zeros_to_nan && (o == 0.0 || m == 0.0) {
                    return None;
                }
                Some((o, m, row.weight.max(1) as f64))
            })
            .collect()
    }

    /// Statistics of `dataset` at one frequency for the sites inside `region`.
    pub fn compute_for(
        &self,
        dataset: &ColocatedDataset,
        frequency: Frequency,
        region: &Region,
    ) -> Result<StatisticsRecord> {
        if frequency < dataset.frequency() {
            return Err(ProcessingError::config(format!(
                "statistics frequency {} is finer than colocation frequency {}",
                frequency,
                dataset.frequency()
            )));
        }

        let weighted = self.settings.weighted_stats;
        let mut pooled = Vec::new();
        let mut station_means = Vec::new();
        for pair in dataset.pairs.iter().filter(|p| region.contains(&p.site)) {
            let resampled = self.resample_pair(dataset, &pair.restrict_to(&dataset.key.period), frequency)?;
            let points = self.valid_points(&resampled);
            if points.is_empty() {
                continue;
            }
            let weight_of = |w: f64| if weighted { w } else { 1.0 };
            let obs_mean = weighted_mean(points.iter().map(|(o, _, w)| (*o, weight_of(*w))));
            let model_mean = weighted_mean(points.iter().map(|(_, m, w)| (*m, weight_of(*w))));
            if let (Some(o), Some(m)) = (obs_mean, model_mean) {
                station_means.push((o, m, points.len() as f64));
            }
            pooled.extend(points);
        }

        let num_coords = station_means.len();
        Ok(StatisticsRecord {
            model: dataset.key.model.clone(),
            obs: dataset.key.obs.clone(),
            variable: dataset.key.variable.clone(),
            period: dataset.key.period,
            frequency,
            region: region.name.clone(),
            is_main_freq: frequency == self.settings.main_freq,
            pooled: ComparisonStats::compute(&pooled, num_coords, weighted),
            spatial: ComparisonStats::compute(&station_means, num_coords, false),
        })
    }

    /// Records for every configured frequency and every region. Frequencies
    /// finer than the dataset are skipped.
    pub fn compute(&self, dataset: &ColocatedDataset, regions: &[Region]) -> Result<Vec<StatisticsRecord>> {
        let mut records = Vec::new();
        for &frequency in &self.settings.freqs {
            if frequency < dataset.frequency() {
                debug!(
                    combination = %dataset.key,
                    %frequency,
                    "skipping statistics finer than the colocated data"
                );
                continue;
            }
            for region in regions {
                records.push(self.compute_for(dataset, frequency, region)?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactKey, Site};
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;

    fn month(y: i32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    fn dataset(pairs: Vec<ColocatedPair>, colocate_time: bool) -> ColocatedDataset {
        ColocatedDataset {
            key: ArtifactKey {
                model: "EMEP".to_string(),
                obs: "EBAS".to_string(),
                variable: "concpm10".to_string(),
                frequency: Frequency::Monthly,
                period: "2010".parse().unwrap(),
                region: "ALL-wMOUNTAINS".to_string(),
            },
            unit: "ug m-3".to_string(),
            vertical_type: None,
            colocate_time,
            pairs,
        }
    }

    fn pair(site: Site, values: &[(u32, f64, f64)]) -> ColocatedPair {
        let rows = values
            .iter()
            .map(|(m, o, v)| PairedValue {
                time: month(2010, *m),
                obs: Some(*o),
                model: Some(*v),
                weight: 1,
            })
            .collect();
        ColocatedPair::new(site, "cell", Frequency::Monthly, rows).unwrap()
    }

    #[test]
    fn test_basic_metrics() {
        let points = [(1.0, 2.0, 1.0), (2.0, 4.0, 1.0), (3.0, 6.0, 1.0)];
        let stats = ComparisonStats::compute(&points, 1, false);
        assert_eq!(stats.num_valid, 3);
        assert!(close(stats.mb, 2.0));
        assert!(close(stats.nmb, 1.0));
        assert!(close(stats.r, 1.0));
        assert!(close(stats.r_spearman, 1.0));
        assert!(close(stats.rms, (14.0f64 / 3.0).sqrt()));
        assert!(close(stats.mnmb, 2.0 / 3.0));
        assert!(close(stats.fge, 2.0 / 3.0));
    }

    #[test]
    fn test_outlier_changes_rmse() {
        let with_outlier = ComparisonStats::compute(&[(0.5, 0.5, 1.0), (0.5, 1.5, 1.0)], 1, false);
        let without = ComparisonStats::compute(&[(0.5, 0.5, 1.0)], 1, false);
        assert!(close(with_outlier.rms, (0.5f64).sqrt()));
        assert!(close(without.rms, 0.0));
        assert_eq!(without.r, None);
    }

    #[test]
    fn test_weighted_variant() {
        let points = [(1.0, 1.0, 3.0), (1.0, 5.0, 1.0)];
        let plain = ComparisonStats::compute(&points, 1, false);
        let weighted = ComparisonStats::compute(&points, 1, true);
        assert!(close(plain.mb, 2.0));
        assert!(close(weighted.mb, 1.0));
        assert!(weighted.weighted);
    }

    #[test]
    fn test_aggregator_regions_and_spatial_stats() {
        let north = Site::new("n", "north", 60.0, 10.0, 0.0);
        let south = Site::new("s", "south", -30.0, 20.0, 0.0);
        let data = dataset(
            vec![
                pair(north, &[(1, 1.0, 2.0), (2, 3.0, 4.0)]),
                pair(south, &[(1, 10.0, 10.0)]),
            ],
            true,
        );
        let settings = StatisticsSettings {
            freqs: vec![Frequency::Monthly],
            ..StatisticsSettings::default()
        };
        let how = ResampleHowTable::new();
        let aggregator =
            StatisticsAggregator::new(&settings, &ResampleConstraints::none(), &how, AggregationMethod::Mean);

        let world = Region::bounding_box("WORLD", (-90.0, 90.0), (-180.0, 180.0));
        let europe = Region::bounding_box("EUROPE", (40.0, 72.0), (-10.0, 40.0));
        let records = aggregator.compute(&data, &[world, europe]).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].pooled.num_valid, 3);
        assert_eq!(records[0].spatial.num_coords, 2);
        assert!(close(records[0].spatial.refdata_mean, 6.0));
        assert!(close(records[0].spatial.data_mean, 6.5));
        assert!(records[0].is_main_freq);

        assert_eq!(records[1].region, "EUROPE");
        assert_eq!(records[1].pooled.num_valid, 2);
        assert!(close(records[1].pooled.mb, 1.0));
    }

    #[test]
    fn test_annual_constraint_toggle() {
        let site = Site::new("n", "north", 60.0, 10.0, 0.0);
        let data = dataset(vec![pair(site, &[(1, 1.0, 2.0), (2, 3.0, 4.0)])], true);
        let how = ResampleHowTable::new();
        let constraints = ResampleConstraints::none()
            .with_entry(Frequency::Yearly, Frequency::Monthly, 9)
            .unwrap();
        let region = Region::bounding_box("WORLD", (-90.0, 90.0), (-180.0, 180.0));

        let unconstrained = StatisticsSettings::default();
        let aggregator = StatisticsAggregator::new(&unconstrained, &constraints, &how, AggregationMethod::Mean);
        let record = aggregator.compute_for(&data, Frequency::Yearly, &region).unwrap();
        assert_eq!(record.pooled.num_valid, 1);
        assert!(close(record.pooled.refdata_mean, 2.0));
        assert!(!record.is_main_freq);

        let constrained = StatisticsSettings {
            annual_stats_constrained: true,
            ..StatisticsSettings::default()
        };
        let aggregator = StatisticsAggregator::new(&constrained, &constraints, &how, AggregationMethod::Mean);
        let record = aggregator.compute_for(&data, Frequency::Yearly, &region).unwrap();
        assert_eq!(record.pooled.num_valid, 0);
        assert_eq!(record.pooled.mb, None);
    }

    #[test]
    fn test_zeros_to_nan_and_finer_frequency() {
        let site = Site::new("n", "north", 60.0, 10.0, 0.0);
        let data = dataset(vec![pair(site, &[(1, 0.0, 2.0), (2, 3.0, 4.0)])], true);
        let how = ResampleHowTable::new();
        let region = Region::bounding_box("WORLD", (-90.0, 90.0), (-180.0, 180.0));

        let keep = StatisticsSettings::default();
        let aggregator = StatisticsAggregator::new(&keep, &ResampleConstraints::none(), &how, AggregationMethod::Mean);
        assert_eq!(aggregator.compute_for(&data, Frequency::Monthly, &region).unwrap().pooled.num_valid, 2);
        assert!(aggregator.compute_for(&data, Frequency::Daily, &region).is_err());

        let drop = StatisticsSettings {
            zeros_to_nan: true,
            ..StatisticsSettings::default()
        };
        let aggregator = StatisticsAggregator::new(&drop, &ResampleConstraints::none(), &how, AggregationMethod::Mean);
        assert_eq!(aggregator.compute_for(&data, Frequency::Monthly, &region).unwrap().pooled.num_valid, 1);
    }
}
