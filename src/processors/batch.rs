use chrono::{NaiveDateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::context::{ModelSetup, ObsSetup, RunContext};
use crate::error::{ProcessingError, Result};
use crate::models::{CombinationKey, Frequency, Period, TimeSeries, VerticalType};
use crate::processors::colocator::Colocator;
use crate::processors::derived::{DerivationRule, DerivedVariableEngine};
use crate::processors::outliers::zeros_to_missing;
use crate::processors::statistics::StatisticsAggregator;
use crate::processors::trends::TrendsEstimator;
use crate::readers::{SeriesProvider, SourceKind};
use crate::utils::progress::ProgressReporter;
use crate::writers::{ColocatedDataStore, ResultsWriter, StoreOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationStatus {
    Success,
    /// Not enough data to colocate or evaluate; not a failure.
    InsufficientData,
    Error,
    /// Not attempted because the batch was aborted.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationOutcome {
    pub key: CombinationKey,
    pub status: CombinationStatus,
    pub message: Option<String>,
    pub num_sites: usize,
    pub num_valid: usize,
    /// The colocated artifact was loaded from an earlier run.
    pub reused_artifact: bool,
    pub num_statistics: usize,
    pub num_trends: usize,
}

impl CombinationOutcome {
    fn with_status(key: CombinationKey, status: CombinationStatus, message: Option<String>) -> Self {
        Self {
            key,
            status,
            message,
            num_sites: 0,
            num_valid: 0,
            reused_artifact: false,
            num_statistics: 0,
            num_trends: 0,
        }
    }
}

/// Per-combination outcomes of one run, written whether or not it aborted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub aborted: bool,
    pub outcomes: Vec<CombinationOutcome>,
}

impl RunManifest {
    pub fn count(&self, status: CombinationStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(&self, key: &CombinationKey) -> Option<&CombinationOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    /// Turn an aborted run into the error that stopped it.
    pub fn into_result(self) -> Result<Self> {
        if !self.aborted {
            return Ok(self);
        }
        let (combination, message) = self
            .outcomes
            .iter()
            .find(|o| o.status == CombinationStatus::Error)
            .map(|o| (o.key.to_string(), o.message.clone().unwrap_or_default()))
            .unwrap_or_else(|| ("<unknown>".to_string(), "batch aborted".to_string()));
        Err(ProcessingError::BatchAborted {
            combination,
            message,
        })
    }
}

/// One scheduled combination with the configuration entries it needs.
#[derive(Debug, Clone)]
pub struct Combination<'c> {
    pub key: CombinationKey,
    pub obs: &'c ObsSetup,
    pub model: &'c ModelSetup,
}

/// Result of a combination that ran to completion.
enum Evaluated {
    Done {
        num_sites: usize,
        num_valid: usize,
        reused: bool,
        num_statistics: usize,
        num_trends: usize,
    },
    Insufficient(String),
}

/// Runs every (model, observation network, variable, period) combination of a
/// run context on a rayon pool.
pub struct EvaluationProcessor<'a> {
    context: &'a RunContext,
    provider: &'a dyn SeriesProvider,
    store: ColocatedDataStore,
    writer: ResultsWriter,
    max_workers: usize,
}

impl<'a> EvaluationProcessor<'a> {
    pub fn new(context: &'a RunContext, provider: &'a dyn SeriesProvider) -> Self {
        Self {
            context,
            provider,
            store: ColocatedDataStore::new(&context.config.coldata_basedir),
            writer: ResultsWriter::new(&context.config.json_basedir),
            max_workers: num_cpus::get(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn store(&self) -> &ColocatedDataStore {
        &self.store
    }

    pub fn writer(&self) -> &ResultsWriter {
        &self.writer
    }

    /// Cross product of observation networks, their models, variables and
    /// periods, in a stable order.
    pub fn combinations(&self) -> Vec<Combination<'a>> {
        let ctx = self.context;
        let mut combinations = Vec::new();
        for obs in ctx.obs.values() {
            for model in ctx.models_for(obs) {
                for variable in &obs.entry.obs_vars {
                    for period in &ctx.periods {
                        combinations.push(Combination {
                            key: CombinationKey::new(&model.key, &obs.key, variable, *period),
                            obs,
                            model,
                        });
                    }
                }
            }
        }
        combinations
    }

    /// Cleanup run before any combination starts.
    pub fn prepare(&self) -> Result<()> {
        if self.context.config.reanalyse_existing {
            let removed = self.store.delete_all()?;
            if removed > 0 {
                info!(removed, "deleted colocated data of previous runs");
            }
        }
        if self.context.config.clear_existing_json {
            self.writer.clear()?;
        }
        Ok(())
    }

    /// Run the whole batch. The manifest is always written; with
    /// `raise_exceptions` the first failing combination stops the scheduling of
    /// the rest, which are recorded as skipped.
    pub fn run(&self, progress: Option<&ProgressReporter>) -> Result<RunManifest> {
        let started_at = Utc::now().naive_utc();
        self.prepare()?;

        let combinations = self.combinations();
        let total = combinations.len();
        let processed = Arc::new(AtomicUsize::new(0));
        let abort = AtomicBool::new(false);
        let fail_fast = self.context.config.raise_exceptions;

        info!(combinations = total, workers = self.max_workers, "starting evaluation");
        if let Some(p) = progress {
            p.set_message(&format!("Evaluating {} combinations...", total));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .build()
            .map_err(|e| ProcessingError::Config(e.to_string()))?;

        let outcomes: Vec<CombinationOutcome> = pool.install(|| {
            combinations
                .par_iter()
                .map(|combination| {
                    let outcome = if abort.load(Ordering::SeqCst) {
                        CombinationOutcome::with_status(
                            combination.key.clone(),
                            CombinationStatus::Skipped,
                            Some("batch aborted".to_string()),
                        )
                    } else {
                        let outcome = self.run_combination(combination);
                        if fail_fast && outcome.status == CombinationStatus::Error {
                            abort.store(true, Ordering::SeqCst);
                        }
                        outcome
                    };

                    processed.fetch_add(1, Ordering::Relaxed);
                    if let Some(p) = progress {
                        p.increment(1);
                    }
                    outcome
                })
                .collect()
        });

        let manifest = RunManifest {
            started_at: Some(started_at),
            finished_at: Some(Utc::now().naive_utc()),
            aborted: abort.load(Ordering::SeqCst),
            outcomes,
        };
        self.writer.write_manifest(&manifest)?;

        let summary = format!(
            "Evaluated {} combinations: {} ok, {} insufficient data, {} failed, {} skipped",
            processed.load(Ordering::Relaxed),
            manifest.count(CombinationStatus::Success),
            manifest.count(CombinationStatus::InsufficientData),
            manifest.count(CombinationStatus::Error),
            manifest.count(CombinationStatus::Skipped)
        );
        info!("{}", summary);
        if let Some(p) = progress {
            p.finish_with_message(&summary);
        }
        Ok(manifest)
    }

    /// Evaluate one combination, turning failures into an error outcome.
    pub fn run_combination(&self, combination: &Combination<'_>) -> CombinationOutcome {
        let key = combination.key.clone();
        match self.evaluate(combination) {
            Ok(Evaluated::Done {
                num_sites,
                num_valid,
                reused,
                num_statistics,
                num_trends,
            }) => {
                info!(combination = %key, sites = num_sites, valid = num_valid, reused, "combination evaluated");
                CombinationOutcome {
                    key,
                    status: CombinationStatus::Success,
                    message: None,
                    num_sites,
                    num_valid,
                    reused_artifact: reused,
                    num_statistics,
                    num_trends,
                }
            }
            Ok(Evaluated::Insufficient(reason)) => {
                info!(combination = %key, %reason, "insufficient data");
                CombinationOutcome::with_status(key, CombinationStatus::InsufficientData, Some(reason))
            }
            Err(e) => {
                warn!(combination = %key, error = %e, "combination failed");
                CombinationOutcome::with_status(key, CombinationStatus::Error, Some(e.to_string()))
            }
        }
    }

    fn evaluate(&self, combination: &Combination<'_>) -> Result<Evaluated> {
        let ctx = self.context;
        let Combination { key, obs, model } = combination;
        let period = key.period;

        let obs_series = slice_all(self.observation_series(obs, &key.variable)?, &period);
        if obs_series.iter().all(|s| s.valid_count() == 0) {
            return Ok(Evaluated::Insufficient("no observation data in period".to_string()));
        }
        let model_series = slice_all(self.model_series(obs, model, &key.variable)?, &period);

        let colocator = Colocator::new(ctx.colocation_settings(obs), ctx.resampler(), &ctx.units);
        let obs_freq = obs_series.iter().map(|s| s.frequency()).max().unwrap_or(Frequency::Hourly);
        let model_freq = model_series.iter().map(|s| s.frequency()).max().unwrap_or(Frequency::Hourly);
        let artifact = key.artifact_key(colocator.effective_frequency(obs_freq, model_freq), &ctx.filter.name);

        let (dataset, reused) = if self.store.exists(&artifact) {
            debug!(key = %artifact, "reusing colocated data");
            (self.store.load(&artifact)?, true)
        } else {
            let dataset = colocator.colocate(&artifact, &obs_series, &model_series)?;
            let reused = self.store.store(&dataset)? == StoreOutcome::AlreadyPresent;
            (dataset, reused)
        };

        if dataset.num_valid() == 0 {
            return Ok(Evaluated::Insufficient("no valid colocated points".to_string()));
        }

        let sites = dataset.sites();
        let regions = ctx
            .regions
            .evaluation_regions(&ctx.filter, ctx.config.regions_how, &sites);

        let aggregator =
            StatisticsAggregator::new(&ctx.statistics, &ctx.constraints, &ctx.resample_how, ctx.config.avg_how);
        let statistics = aggregator.compute(&dataset, &regions)?;
        self.writer.write_statistics(key, &statistics)?;

        let num_trends = if ctx.config.add_trends {
            let estimator = TrendsEstimator::new(&ctx.trends)?;
            let trends = estimator.compute(&ctx.resampler(), &dataset, &regions)?;
            self.writer.write_trends(key, &trends)?;
            trends.len()
        } else {
            0
        };

        Ok(Evaluated::Done {
            num_sites: dataset.pairs.len(),
            num_valid: dataset.num_valid(),
            reused,
            num_statistics: statistics.len(),
            num_trends,
        })
    }

    /// Observation series of `variable` after site selection and masking;
    /// bulk variables are derived from their constituents.
    fn observation_series(&self, obs: &ObsSetup, variable: &str) -> Result<Vec<TimeSeries>> {
        match obs.bulk.get(variable) {
            Some(rule) => {
                let floor = self.context.ts_type_for(obs);
                let inputs = self.resampled_inputs(rule, |name| self.raw_observation(obs, name), floor)?;
                DerivedVariableEngine::new(&self.context.units).derive(rule, &obs.entry.obs_id, &inputs)
            }
            None => self.raw_observation(obs, variable),
        }
    }

    fn raw_observation(&self, obs: &ObsSetup, variable: &str) -> Result<Vec<TimeSeries>> {
        let ctx = self.context;
        let source_id = &obs.entry.obs_id;
        let series = self
            .provider
            .series(SourceKind::Observation, source_id, variable)
            .ok_or_else(|| ProcessingError::missing_input(variable, source_id))?;

        let outliers = ctx.obs_outlier_filter(obs, variable);
        let vertical_type = obs
            .entry
            .obs_vert_type
            .or_else(|| ctx.variables.get(variable).and_then(|v| v.vertical_type));
        let total = series.len();

        let mut selected = Vec::with_capacity(total);
        let mut masked = 0;
        for s in series {
            if !obs.site_filter.accepts(&s) || !ctx.filter.accepts(s.site()) {
                continue;
            }
            let mut filtered = outliers.apply(&s);
            masked += s.valid_count() - filtered.valid_count();
            if ctx.config.zeros_to_nan {
                filtered = zeros_to_missing(&filtered);
            }
            selected.push(with_vertical_type(filtered, vertical_type));
        }
        debug!(source_id = %source_id, variable, total, selected = selected.len(), masked, "observation sites selected");
        Ok(selected)
    }

    /// Model series compared against observation variable `variable`.
    fn model_series(&self, obs: &ObsSetup, model: &ModelSetup, variable: &str) -> Result<Vec<TimeSeries>> {
        let ctx = self.context;
        let model_var = model.variable_for(variable);

        let bulk_rule = obs.bulk.get(variable).filter(|r| r.applies_to_model());
        let rule = bulk_rule.or_else(|| model.derived.get(model_var));
        let series = match rule {
            Some(rule) => {
                let target = model.entry.model_ts_type_read.unwrap_or(Frequency::Hourly);
                let inputs = self.resampled_inputs(rule, |name| self.raw_model(model, name), target)?;
                DerivedVariableEngine::new(&ctx.units).derive(rule, &model.entry.model_id, &inputs)?
            }
            None => self.raw_model(model, model_var)?,
        };
        Ok(series
            .into_iter()
            .map(|s| s.with_variable(variable, s.unit()))
            .collect())
    }

    fn raw_model(&self, model: &ModelSetup, variable: &str) -> Result<Vec<TimeSeries>> {
        let ctx = self.context;
        let model_id = &model.entry.model_id;
        let wanted = model.source_name(variable);
        let available = self.provider.variables(SourceKind::Model, model_id);
        let name = available
            .iter()
            .find(|v| v.as_str() == wanted)
            .or_else(|| available.iter().find(|v| v.eq_ignore_ascii_case(wanted)))
            .ok_or_else(|| ProcessingError::missing_input(variable, model_id))?;
        let series = self
            .provider
            .series(SourceKind::Model, model_id, name)
            .ok_or_else(|| ProcessingError::missing_input(variable, model_id))?;

        let outliers = ctx.model_outlier_filter(model, variable);
        let vertical_type = ctx.variables.get(variable).and_then(|v| v.vertical_type);
        let resampler = ctx.resampler();
        let mut out = Vec::with_capacity(series.len());
        for s in series {
            // masking happens at native resolution, before any aggregation
            let mut s = outliers.apply(&s.with_variable(variable, s.unit()));
            if ctx.config.zeros_to_nan {
                s = zeros_to_missing(&s);
            }
            if let Some(freq) = model.entry.model_ts_type_read {
                if freq > s.frequency() {
                    s = resampler.resample(&s, freq)?;
                } else if freq < s.frequency() {
                    debug!(model_id = %model_id, variable, available = %s.frequency(), requested = %freq, "model data coarser than model_ts_type_read");
                }
            }
            out.push(with_vertical_type(s, vertical_type));
        }
        Ok(out)
    }

    /// Load every input of `rule` and resample all of them, under their own
    /// constraints, to one common frequency no finer than `floor`.
    fn resampled_inputs<F>(&self, rule: &DerivationRule, load: F, floor: Frequency) -> Result<BTreeMap<String, Vec<TimeSeries>>>
    where
        F: Fn(&str) -> Result<Vec<TimeSeries>>,
    {
        let mut raw = BTreeMap::new();
        for name in &rule.inputs {
            raw.insert(name.clone(), load(name)?);
        }
        let common = raw
            .values()
            .flatten()
            .map(|s| s.frequency())
            .fold(floor, Frequency::max);

        let resampler = self.context.resampler();
        let mut resampled = BTreeMap::new();
        for (name, series) in raw {
            let series = series
                .iter()
                .map(|s| resampler.resample(s, common))
                .collect::<Result<Vec<_>>>()?;
            resampled.insert(name, series);
        }
        Ok(resampled)
    }
}

fn slice_all(series: Vec<TimeSeries>, period: &Period) -> Vec<TimeSeries> {
    series.iter().map(|s| s.slice_period(period)).collect()
}

fn with_vertical_type(series: TimeSeries, vertical_type: Option<VerticalType>) -> TimeSeries {
    match vertical_type {
        Some(vt) if series.meta().vertical_type.is_none() => {
            let meta = series.meta().clone().with_vertical_type(vt);
            series.with_meta(meta)
        }
        _ => series,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalConfig;
    use crate::models::{Sample, SeriesMeta, Site};
    use crate::readers::InMemoryCatalog;
    use chrono::{Duration, NaiveDate};

    #[test]
    fn test_model_outliers_masked_before_resampling() {
        let json = r#"{
            "periods": ["2010"],
            "model_remove_outliers": true,
            "obs_cfg": { "EBAS": { "obs_id": "EBASMC", "obs_vars": ["concpm10"] } },
            "model_cfg": {
                "EMEP": {
                    "model_id": "EMEP.rv4",
                    "model_ts_type_read": "daily",
                    "var_outlier_ranges": { "concpm10": [0, 100] }
                }
            }
        }"#;
        let context = RunContext::from_config(EvalConfig::from_json_str(json).unwrap()).unwrap();

        let start = NaiveDate::from_ymd_opt(2010, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let samples = (0..24)
            .map(|h| Sample::new(start + Duration::hours(h), if h == 5 { 1000.0 } else { 1.0 }))
            .collect();
        let cell = Site::new("cell_1", "cell_1", 58.4, 8.3, 0.0);
        let hourly = TimeSeries::new(
            SeriesMeta::new("concpm10", "ug m-3", "EMEP.rv4", cell),
            Frequency::Hourly,
            samples,
        )
        .unwrap();
        let mut catalog = InMemoryCatalog::new();
        catalog.insert(SourceKind::Model, hourly);

        let processor = EvaluationProcessor::new(&context, &catalog);
        let series = processor.raw_model(&context.models["EMEP"], "concpm10").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].frequency(), Frequency::Daily);
        assert_eq!(series[0].values(), vec![Some(1.0)]);
    }

    #[test]
    fn test_manifest_into_result() {
        let key = CombinationKey::new("EMEP", "EBAS", "concpm10", Period::single(2010));
        let mut manifest = RunManifest {
            outcomes: vec![
                CombinationOutcome::with_status(key.clone(), CombinationStatus::Error, Some("boom".to_string())),
                CombinationOutcome::with_status(key.clone(), CombinationStatus::Skipped, None),
            ],
            ..RunManifest::default()
        };
        assert_eq!(manifest.count(CombinationStatus::Error), 1);
        assert!(manifest.clone().into_result().is_ok());

        manifest.aborted = true;
        match manifest.into_result() {
            Err(ProcessingError::BatchAborted { combination, message }) => {
                assert_eq!(combination, "EMEP/EBAS/concpm10/2010");
                assert_eq!(message, "boom");
            }
            other => panic!("expected BatchAborted, got {:?}", other),
        }
    }
}
