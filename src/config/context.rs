use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::eval_config::{EvalConfig, ModelEntry, ObsEntry};
use crate::error::Result;
use crate::models::{
    Frequency, Period, Region, RegionBounds, RegionFilter, RegionRegistry, Variable, VariableRegistry,
};
use crate::processors::colocator::ColocationSettings;
use crate::processors::constraints::ResampleConstraints;
use crate::processors::derived::{BulkDerivationSpec, DerivationRule, DerivedVariableRegistry};
use crate::processors::outliers::{OutlierFilter, SiteFilter};
use crate::processors::resampler::{ResampleHowTable, TemporalResampler};
use crate::processors::statistics::StatisticsSettings;
use crate::processors::trends::TrendSettings;
use crate::processors::units::UnitHarmonizer;

/// One observation network with its bulk variables and site selection.
#[derive(Debug, Clone)]
pub struct ObsSetup {
    pub key: String,
    pub entry: ObsEntry,
    pub bulk: DerivedVariableRegistry,
    pub site_filter: SiteFilter,
}

/// One model with its derived variables.
#[derive(Debug, Clone)]
pub struct ModelSetup {
    pub key: String,
    pub entry: ModelEntry,
    pub derived: DerivedVariableRegistry,
}

impl ModelSetup {
    /// Model variable compared against observation variable `obs_var`.
    pub fn variable_for<'a>(&'a self, obs_var: &'a str) -> &'a str {
        self.entry
            .model_use_vars
            .get(obs_var)
            .map(String::as_str)
            .unwrap_or(obs_var)
    }

    /// Name under which `variable` appears in the model data.
    pub fn source_name<'a>(&'a self, variable: &'a str) -> &'a str {
        self.entry
            .model_rename_vars
            .iter()
            .find(|(_, renamed)| renamed.as_str() == variable)
            .map(|(source, _)| source.as_str())
            .unwrap_or(variable)
    }
}

/// Read-only bundle of everything a run needs, built once from the
/// configuration and shared by reference with every worker.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: EvalConfig,
    pub variables: VariableRegistry,
    pub constraints: ResampleConstraints,
    pub resample_how: ResampleHowTable,
    pub units: UnitHarmonizer,
    pub regions: RegionRegistry,
    pub filter: RegionFilter,
    pub periods: Vec<Period>,
    pub statistics: StatisticsSettings,
    pub trends: TrendSettings,
    pub obs: BTreeMap<String, ObsSetup>,
    pub models: BTreeMap<String, ModelSetup>,
}

/// Restore the spelling of variable-name keys that a case-folding config
/// loader may have lowercased.
fn canonicalize<T>(map: BTreeMap<String, T>, known: &BTreeSet<String>) -> BTreeMap<String, T> {
    map.into_iter()
        .map(|(key, value)| {
            if known.contains(&key) {
                return (key, value);
            }
            let name = known
                .iter()
                .find(|k| k.eq_ignore_ascii_case(&key))
                .cloned()
                .unwrap_or(key);
            (name, value)
        })
        .collect()
}

fn known_variable_names(config: &EvalConfig, variables: &VariableRegistry) -> BTreeSet<String> {
    let mut known: BTreeSet<String> = variables.names().map(str::to_string).collect();
    for entry in config.obs_cfg.values() {
        known.extend(entry.obs_vars.iter().cloned());
        for options in entry.bulk_options.values() {
            known.extend(options.vars.iter().cloned());
        }
    }
    for entry in config.model_cfg.values() {
        known.extend(entry.model_use_vars.values().cloned());
        known.extend(entry.model_rename_vars.values().cloned());
        for aux in entry.model_read_aux.values() {
            known.extend(aux.vars_required.iter().cloned());
        }
    }
    known
}

impl RunContext {
    pub fn from_config(mut config: EvalConfig) -> Result<Self> {
        config.validate_all()?;

        let mut variables = VariableRegistry::with_defaults();
        for def in &config.variables {
            let mut variable = Variable::new(&def.name, &def.unit);
            if let (Some(lo), Some(hi)) = (def.minimum, def.maximum) {
                variable = variable.with_outlier_range(lo, hi);
            }
            if let Some(vt) = def.vertical_type {
                variable = variable.with_vertical_type(vt);
            }
            if let Some(description) = &def.description {
                variable = variable.with_description(description);
            }
            variables.register(variable)?;
        }

        let known = known_variable_names(&config, &variables);
        config.resample_how = canonicalize(std::mem::take(&mut config.resample_how), &known);
        for entry in config.obs_cfg.values_mut() {
            entry.var_outlier_ranges = canonicalize(std::mem::take(&mut entry.var_outlier_ranges), &known);
            entry.bulk_options = canonicalize(std::mem::take(&mut entry.bulk_options), &known);
        }
        for entry in config.model_cfg.values_mut() {
            entry.var_outlier_ranges = canonicalize(std::mem::take(&mut entry.var_outlier_ranges), &known);
            entry.model_use_vars = canonicalize(std::mem::take(&mut entry.model_use_vars), &known);
            entry.model_read_aux = canonicalize(std::mem::take(&mut entry.model_read_aux), &known);
        }

        let mut models = BTreeMap::new();
        for (key, entry) in &config.model_cfg {
            let mut derived = DerivedVariableRegistry::new();
            for (target, aux) in &entry.model_read_aux {
                let rule = DerivationRule::combine(
                    target,
                    &aux.vars_required,
                    aux.fun,
                    aux.units.as_deref(),
                    &variables,
                )?;
                if !variables.contains(target) {
                    variables.register(Variable::new(target, &rule.unit))?;
                }
                derived.register(rule)?;
            }
            models.insert(
                key.clone(),
                ModelSetup {
                    key: key.clone(),
                    entry: entry.clone(),
                    derived,
                },
            );
        }

        let mut obs = BTreeMap::new();
        for (key, entry) in &config.obs_cfg {
            let mut bulk = DerivedVariableRegistry::new();
            for (target, options) in &entry.bulk_options {
                let spec = BulkDerivationSpec {
                    target: target.clone(),
                    numerator: options.vars[0].clone(),
                    denominator: options.vars[1].clone(),
                    mode: options.mode,
                    model_exists: options.model_exists,
                    unit: options.units.clone(),
                };
                let rule = DerivationRule::bulk(&spec, &variables)?;
                variables.register(Variable::new(target, &rule.unit))?;
                bulk.register(rule)?;
            }
            let filters = &entry.obs_filters;
            let pair = |r: &Option<[f64; 2]>| r.map(|r| (r[0], r[1]));
            let site_filter = SiteFilter {
                latitude: pair(&filters.latitude),
                longitude: pair(&filters.longitude),
                altitude: pair(&filters.altitude),
                min_data_level: filters.data_level.and_then(|f| f.bounds().0),
                max_data_level: filters.data_level.and_then(|f| f.bounds().1),
            };
            obs.insert(
                key.clone(),
                ObsSetup {
                    key: key.clone(),
                    entry: entry.clone(),
                    bulk,
                    site_filter,
                },
            );
        }

        let mut regions = RegionRegistry::with_defaults();
        for def in &config.add_regions {
            let bounds = RegionBounds {
                lat_range: def.lat_range,
                lon_range: def.lon_range,
                alt_range: def.alt_range,
            };
            regions.add_custom(Region::from_bounds(&def.name, &bounds)?);
        }
        let filter = regions.parse_filter(&config.filter_name)?;

        let statistics = StatisticsSettings {
            freqs: config.freqs.clone(),
            main_freq: config.main_freq(),
            weighted_stats: config.weighted_stats,
            annual_stats_constrained: config.annual_stats_constrained,
            zeros_to_nan: config.zeros_to_nan,
        };
        let trends = TrendSettings {
            obs_min_yrs: config.obs_min_yrs,
            stats_min_yrs: config.stats_min_yrs,
            sequential_yrs: config.sequential_yrs,
            avg_over_trends: config.avg_over_trends,
            slope_alpha: config.slope_alpha,
        };

        let context = Self {
            variables,
            constraints: config.constraints()?,
            resample_how: config.resample_how.clone(),
            units: UnitHarmonizer::new(),
            regions,
            filter,
            periods: config.parsed_periods()?,
            statistics,
            trends,
            obs,
            models,
            config,
        };
        debug!(
            variables = context.variables.len(),
            obs_networks = context.obs.len(),
            models = context.models.len(),
            "run context ready"
        );
        Ok(context)
    }

    /// Resampler honouring the run's constraints and aggregation overrides.
    pub fn resampler(&self) -> TemporalResampler<'_> {
        TemporalResampler::new(&self.constraints)
            .with_how_table(&self.resample_how)
            .with_default_how(self.config.avg_how)
            .with_weighting(self.config.weighted_stats)
    }

    pub fn colocation_settings(&self, obs: &ObsSetup) -> ColocationSettings {
        ColocationSettings::new(self.ts_type_for(obs))
            .with_colocate_time(obs.entry.colocate_time.unwrap_or(self.config.colocate_time))
            .with_harmonise_units(obs.entry.harmonise_units.unwrap_or(self.config.harmonise_units))
            .with_max_distance_km(self.config.colocation_max_distance_km)
    }

    pub fn ts_type_for(&self, obs: &ObsSetup) -> Frequency {
        obs.entry.ts_type.unwrap_or(self.config.ts_type)
    }

    /// Models an observation network is compared against.
    pub fn models_for(&self, obs: &ObsSetup) -> Vec<&ModelSetup> {
        match &obs.entry.models {
            Some(names) => self
                .models
                .values()
                .filter(|m| names.iter().any(|n| n.eq_ignore_ascii_case(&m.key)))
                .collect(),
            None => self.models.values().collect(),
        }
    }

    pub fn obs_outlier_filter(&self, obs: &ObsSetup, variable: &str) -> OutlierFilter {
        let enabled = obs
            .entry
            .obs_filters
            .remove_outliers
            .unwrap_or(self.config.obs_remove_outliers);
        let filter = if enabled {
            let custom = obs.entry.var_outlier_ranges.get(variable).map(|r| (r[0], r[1]));
            OutlierFilter::for_variable(self.variables.get(variable), custom)
        } else {
            OutlierFilter::new()
        };
        filter.with_flag_masking(obs.entry.obs_filters.set_flags_nan)
    }

    pub fn model_outlier_filter(&self, model: &ModelSetup, variable: &str) -> OutlierFilter {
        if !self.config.model_remove_outliers {
            return OutlierFilter::new();
        }
        let custom = model.entry.var_outlier_ranges.get(variable).map(|r| (r[0], r[1]));
        OutlierFilter::for_variable(self.variables.get(variable), custom)
    }
}
