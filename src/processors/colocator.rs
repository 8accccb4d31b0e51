use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ProcessingError, Result};
use crate::models::{
    ArtifactKey, ColocatedDataset, ColocatedPair, Frequency, PairedValue, Sample, Site, TimeSeries,
};
use crate::processors::resampler::TemporalResampler;
use crate::processors::units::UnitHarmonizer;

/// Per-combination colocation options.
#[derive(Debug, Clone, PartialEq)]
pub struct ColocationSettings {
    pub ts_type: Frequency,
    pub colocate_time: bool,
    pub harmonise_units: bool,
    pub max_distance_km: Option<f64>,
}

impl ColocationSettings {
    pub fn new(ts_type: Frequency) -> Self {
        Self {
            ts_type,
            colocate_time: false,
            harmonise_units: true,
            max_distance_km: None,
        }
    }

    pub fn with_colocate_time(mut self, colocate_time: bool) -> Self {
        self.colocate_time = colocate_time;
        self
    }

    pub fn with_harmonise_units(mut self, harmonise_units: bool) -> Self {
        self.harmonise_units = harmonise_units;
        self
    }

    pub fn with_max_distance_km(mut self, max_distance_km: Option<f64>) -> Self {
        self.max_distance_km = max_distance_km;
        self
    }
}

/// Pairs observation sites with their nearest model cell on a common time index.
pub struct Colocator<'a> {
    settings: ColocationSettings,
    resampler: TemporalResampler<'a>,
    harmonizer: &'a UnitHarmonizer,
}

impl<'a> Colocator<'a> {
    pub fn new(
        settings: ColocationSettings,
        resampler: TemporalResampler<'a>,
        harmonizer: &'a UnitHarmonizer,
    ) -> Self {
        Self {
            settings,
            resampler,
            harmonizer,
        }
    }

    pub fn settings(&self) -> &ColocationSettings {
        &self.settings
    }

    /// Colocation frequency actually used: never finer than either input.
    pub fn effective_frequency(&self, obs: Frequency, model: Frequency) -> Frequency {
        self.settings.ts_type.max(obs).max(model)
    }

    /// Closest model series to `site`, with its distance in km.
    pub fn nearest_model_series<'m>(
        &self,
        site: &Site,
        model: &'m [TimeSeries],
    ) -> Option<(&'m TimeSeries, f64)> {
        model
            .iter()
            .map(|series| (series, site.distance_km(series.site())))
            .filter(|(_, distance)| {
                self.settings
                    .max_distance_km
                    .map_or(true, |max| *distance <= max)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.site().id.cmp(&b.0.site().id)))
    }

    /// Check vertical types and bring the model series into the observation
    /// unit.
    pub fn align_units(&self, obs: &TimeSeries, model: &TimeSeries) -> Result<TimeSeries> {
        if let (Some(o), Some(m)) = (obs.meta().vertical_type, model.meta().vertical_type) {
            if o != m {
                return Err(ProcessingError::ColocationMismatch(format!(
                    "{} is {} in {} but {} in {}",
                    obs.variable(),
                    o,
                    obs.source_id(),
                    m,
                    model.source_id()
                )));
            }
        }

        if UnitHarmonizer::are_equivalent(obs.unit(), model.unit()) {
            return Ok(model.clone());
        }
        if !self.settings.harmonise_units {
            return Err(ProcessingError::ColocationMismatch(format!(
                "{}: model unit '{}' differs from observation unit '{}' and unit harmonisation is disabled",
                obs.variable(),
                model.unit(),
                obs.unit()
            )));
        }
        self.harmonizer.convert(model, obs.unit())
    }

    /// Colocate one observation series with one model series.
    pub fn colocate_pair(
        &self,
        obs: &TimeSeries,
        model: &TimeSeries,
        frequency: Frequency,
    ) -> Result<ColocatedPair> {
        let model = self.align_units(obs, model)?;

        let rows = if self.settings.colocate_time {
            let common = obs.frequency().max(model.frequency());
            let obs_common = self.resampler.resample(obs, common)?;
            let model_common = self.resampler.resample(&model, common)?;
            let (obs_masked, model_masked) = joint_mask(&obs_common, &model_common);
            let obs_out = self.resampler.resample(&obs_masked, frequency)?;
            let model_out = self.resampler.resample(&model_masked, frequency)?;
            intersect(&obs_out, &model_out)
        } else {
            let obs_out = self.resampler.resample(obs, frequency)?;
            let model_out = self.resampler.resample(&model, frequency)?;
            union(&obs_out, &model_out)
        };

        ColocatedPair::new(obs.site().clone(), &model.site().id, frequency, rows)
    }

    /// Colocate every observation site against the model cells.
    pub fn colocate(
        &self,
        key: &ArtifactKey,
        obs: &[TimeSeries],
        model: &[TimeSeries],
    ) -> Result<ColocatedDataset> {
        let obs_freq = obs.iter().map(|s| s.frequency()).max().unwrap_or(Frequency::Hourly);
        let model_freq = model.iter().map(|s| s.frequency()).max().unwrap_or(Frequency::Hourly);
        let frequency = self.effective_frequency(obs_freq, model_freq);
        if frequency != self.settings.ts_type {
            debug!(
                combination = %key,
                requested = %self.settings.ts_type,
                effective = %frequency,
                "colocation frequency raised to the coarsest input"
            );
        }

        let mut pairs = Vec::new();
        let mut unmatched = 0usize;
        for series in obs {
            let Some((cell, distance)) = self.nearest_model_series(series.site(), model) else {
                unmatched += 1;
                continue;
            };
            let pair = self.colocate_pair(series, cell, frequency)?;
            if pair.is_empty() {
                continue;
            }
            debug!(site = %series.site().id, cell = %cell.site().id, distance_km = distance, rows = pair.rows().len(), "site colocated");
            pairs.push(pair);
        }
        if unmatched > 0 {
            debug!(combination = %key, unmatched, "sites without a model cell in range");
        }

        let unit = obs
            .first()
            .map(|s| s.unit().to_string())
            .or_else(|| model.first().map(|s| s.unit().to_string()))
            .unwrap_or_default();
        let vertical_type = obs
            .iter()
            .chain(model)
            .find_map(|s| s.meta().vertical_type);

        Ok(ColocatedDataset {
            key: key.with_frequency(frequency),
            unit,
            vertical_type,
            colocate_time: self.settings.colocate_time,
            pairs,
        })
    }
}

/// Keep observation timestamps, holding values only where both sides are valid.
fn joint_mask(obs: &TimeSeries, model: &TimeSeries) -> (TimeSeries, TimeSeries) {
    let model_by_time: BTreeMap<NaiveDateTime, &Sample> =
        model.samples().iter().map(|s| (s.time, s)).collect();

    let mut obs_samples = Vec::with_capacity(obs.len());
    let mut model_samples = Vec::with_capacity(obs.len());
    for sample in obs.samples() {
        match model_by_time.get(&sample.time) {
            Some(m) if sample.is_valid() && m.is_valid() => {
                obs_samples.push(*sample);
                model_samples.push(**m);
            }
            _ => {
                obs_samples.push(Sample::missing(sample.time));
                model_samples.push(Sample::missing(sample.time));
            }
        }
    }
    (
        obs.with_samples(obs.frequency(), obs_samples),
        model.with_samples(model.frequency(), model_samples),
    )
}

fn intersect(obs: &TimeSeries, model: &TimeSeries) -> Vec<PairedValue> {
    obs.samples()
        .iter()
        .filter_map(|o| {
            let value = o.value?;
            let model_value = model.value_at(o.time)?;
            Some(PairedValue {
                time: o.time,
                obs: Some(value),
                model: Some(model_value),
                weight: o.weight.max(1),
            })
        })
        .collect()
}

fn union(obs: &TimeSeries, model: &TimeSeries) -> Vec<PairedValue> {
    let mut rows: BTreeMap<NaiveDateTime, PairedValue> = BTreeMap::new();
    for o in obs.samples() {
        rows.insert(
            o.time,
            PairedValue {
                time: o.time,
                obs: o.value,
                model: None,
                weight: if o.is_valid() { o.weight.max(1) } else { 0 },
            },
        );
    }
    for m in model.samples() {
        rows.entry(m.time)
            .or_insert(PairedValue {
                time: m.time,
                obs: None,
                model: None,
                weight: 0,
            })
            .model = m.value;
    }
    rows.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SeriesMeta, VerticalType};
    use crate::processors::constraints::ResampleConstraints;
    use chrono::{Datelike, Duration, NaiveDate};
    use pretty_assertions::assert_eq;

    fn day(m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn obs_site() -> Site {
        Site::new("bir", "Birkenes", 58.39, 8.25, 219.0)
    }

    fn daily(source: &str, unit: &str, site: Site, values: &[(u32, u32, f64)]) -> TimeSeries {
        let meta = SeriesMeta::new("concpm10", unit, source, site).with_vertical_type(VerticalType::Surface);
        let samples = values.iter().map(|(m, d, v)| Sample::new(day(*m, *d), *v)).collect();
        TimeSeries::new(meta, Frequency::Daily, samples).unwrap()
    }

    fn key() -> ArtifactKey {
        ArtifactKey {
            model: "EMEP".to_string(),
            obs: "EBAS".to_string(),
            variable: "concpm10".to_string(),
            frequency: Frequency::Daily,
            period: "2018".parse().unwrap(),
            region: "ALL-wMOUNTAINS".to_string(),
        }
    }

    #[test]
    fn test_colocate_time_yields_identical_valid_index() {
        let obs = daily("EBAS", "ug m-3", obs_site(), &[(1, 1, 1.0), (1, 2, 2.0), (1, 4, f64::NAN), (1, 5, 5.0)]);
        let model = daily(
            "EMEP",
            "ug m-3",
            Site::new("cell", "cell", 58.5, 8.0, 0.0),
            &[(1, 1, 1.5), (1, 3, 3.5), (1, 4, 4.5), (1, 5, 5.5)],
        );
        let constraints = ResampleConstraints::none();
        let harmonizer = UnitHarmonizer::new();
        let colocator = Colocator::new(
            ColocationSettings::new(Frequency::Daily).with_colocate_time(true),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );

        let pair = colocator.colocate_pair(&obs, &model, Frequency::Daily).unwrap();
        assert_eq!(pair.times(), vec![day(1, 1), day(1, 5)]);
        assert!(pair.mask().iter().all(|v| *v));
        assert_eq!(pair.model_site_id, "cell");
    }

    #[test]
    fn test_colocate_time_masks_before_aggregating() {
        // model has data every day, obs only on the 1st: with joint masking the
        // model monthly mean only sees the 1st
        let obs = daily("EBAS", "ug m-3", obs_site(), &[(1, 1, 1.0)]);
        let model = daily(
            "EMEP",
            "ug m-3",
            obs_site(),
            &[(1, 1, 2.0), (1, 2, 10.0), (1, 3, 10.0)],
        );
        let constraints = ResampleConstraints::none();
        let harmonizer = UnitHarmonizer::new();

        let strict = Colocator::new(
            ColocationSettings::new(Frequency::Monthly).with_colocate_time(true),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );
        let pair = strict.colocate_pair(&obs, &model, Frequency::Monthly).unwrap();
        assert_eq!(pair.rows()[0].model, Some(2.0));

        let loose = Colocator::new(
            ColocationSettings::new(Frequency::Monthly),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );
        let pair = loose.colocate_pair(&obs, &model, Frequency::Monthly).unwrap();
        assert_eq!(pair.rows()[0].model, Some(22.0 / 3.0));
    }

    #[test]
    fn test_without_time_colocation_index_is_union() {
        let obs = daily("EBAS", "ug m-3", obs_site(), &[(1, 1, 1.0), (1, 2, 2.0)]);
        let model = daily("EMEP", "ug m-3", obs_site(), &[(1, 2, 2.5), (1, 3, 3.5)]);
        let constraints = ResampleConstraints::none();
        let harmonizer = UnitHarmonizer::new();
        let colocator = Colocator::new(
            ColocationSettings::new(Frequency::Daily),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );
        let pair = colocator.colocate_pair(&obs, &model, Frequency::Daily).unwrap();
        assert_eq!(pair.times(), vec![day(1, 1), day(1, 2), day(1, 3)]);
        assert_eq!(pair.num_valid(), 1);
        assert_eq!(pair.rows()[0].model, None);
        assert_eq!(pair.rows()[2].obs, None);
    }

    #[test]
    fn test_unit_and_vertical_checks() {
        let obs = daily("EBAS", "ug m-3", obs_site(), &[(1, 1, 1.0)]);
        let model = daily("EMEP", "ng m-3", obs_site(), &[(1, 1, 1000.0)]);
        let constraints = ResampleConstraints::none();
        let harmonizer = UnitHarmonizer::new();

        let harmonising = Colocator::new(
            ColocationSettings::new(Frequency::Daily),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );
        let pair = harmonising.colocate_pair(&obs, &model, Frequency::Daily).unwrap();
        assert!((pair.rows()[0].model.unwrap() - 1.0).abs() < 1e-9);

        let strict = Colocator::new(
            ColocationSettings::new(Frequency::Daily).with_harmonise_units(false),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );
        assert!(matches!(
            strict.colocate_pair(&obs, &model, Frequency::Daily),
            Err(ProcessingError::ColocationMismatch(_))
        ));

        let column = TimeSeries::new(
            SeriesMeta::new("concpm10", "ug m-3", "EMEP", obs_site()).with_vertical_type(VerticalType::Column),
            Frequency::Daily,
            vec![Sample::new(day(1, 1), 1.0)],
        )
        .unwrap();
        assert!(matches!(
            harmonising.colocate_pair(&obs, &column, Frequency::Daily),
            Err(ProcessingError::ColocationMismatch(_))
        ));
    }

    #[test]
    fn test_nearest_cell_and_effective_frequency() {
        let constraints = ResampleConstraints::none();
        let harmonizer = UnitHarmonizer::new();
        let colocator = Colocator::new(
            ColocationSettings::new(Frequency::Daily).with_max_distance_km(Some(100.0)),
            TemporalResampler::new(&constraints),
            &harmonizer,
        );

        let near = Site::new("near", "near", 58.5, 8.5, 0.0);
        let far = Site::new("far", "far", 40.0, 8.5, 0.0);
        let mut monthly_samples = Vec::new();
        for m in 1..=2 {
            monthly_samples.push(Sample::new(day(m, 1), m as f64));
        }
        let model: Vec<TimeSeries> = [far, near]
            .into_iter()
            .map(|site| {
                TimeSeries::new(
                    SeriesMeta::new("concpm10", "ug m-3", "EMEP", site),
                    Frequency::Monthly,
                    monthly_samples.clone(),
                )
                .unwrap()
            })
            .collect();

        let (cell, distance) = colocator.nearest_model_series(&obs_site(), &model).unwrap();
        assert_eq!(cell.site().id, "near");
        assert!(distance < 100.0);

        let remote = Site::new("remote", "remote", -40.0, 100.0, 0.0);
        assert!(colocator.nearest_model_series(&remote, &model).is_none());

        let obs_samples: Vec<(u32, u32, f64)> = (0..40)
            .map(|i| {
                let d = day(1, 1) + Duration::days(i);
                (d.month(), d.day(), 3.0)
            })
            .collect();
        let obs = vec![
            daily("EBAS", "ug m-3", obs_site(), &obs_samples),
            daily("EBAS", "ug m-3", remote, &obs_samples),
        ];
        let dataset = colocator.colocate(&key(), &obs, &model).unwrap();
        assert_eq!(dataset.frequency(), Frequency::Monthly);
        assert_eq!(dataset.pairs.len(), 1);
        assert_eq!(dataset.pairs[0].rows().len(), 2);
        assert_eq!(dataset.pairs[0].rows()[0].weight, 31);
    }
}
