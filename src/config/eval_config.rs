use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::{ProcessingError, Result};
use crate::models::{Frequency, Period, RegionsHow, VerticalType};
use crate::processors::constraints::{ConstraintDefaults, ConstraintTable, ResampleConstraints};
use crate::processors::derived::{BulkMode, CombineFunction};
use crate::processors::resampler::{AggregationMethod, ResampleHowTable};
use crate::utils::constants::{
    DEFAULT_FILTER_NAME, DEFAULT_MIN_TREND_YEARS, DEFAULT_SLOPE_ALPHA, MAX_DATA_LEVEL,
};
use crate::utils::coordinates::validate_range;

fn default_ts_type() -> Frequency {
    Frequency::Monthly
}

fn default_freqs() -> Vec<Frequency> {
    vec![Frequency::Monthly, Frequency::Yearly]
}

fn default_true() -> bool {
    true
}

fn default_min_yrs() -> u32 {
    DEFAULT_MIN_TREND_YEARS
}

fn default_slope_alpha() -> f64 {
    DEFAULT_SLOPE_ALPHA
}

fn default_filter_name() -> String {
    DEFAULT_FILTER_NAME.to_string()
}

fn default_coldata_basedir() -> PathBuf {
    PathBuf::from("coldata")
}

fn default_json_basedir() -> PathBuf {
    PathBuf::from("json")
}

/// Validated evaluation setup. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    #[serde(default = "default_ts_type")]
    pub ts_type: Frequency,

    #[serde(default = "default_freqs")]
    #[validate(length(min = 1))]
    pub freqs: Vec<Frequency>,

    /// Defaults to the first entry of `freqs`.
    #[serde(default)]
    pub main_freq: Option<Frequency>,

    #[validate(length(min = 1))]
    pub periods: Vec<String>,

    /// `target -> source -> minimum count`; the built-in table when absent.
    #[serde(default)]
    pub min_num_obs: Option<ConstraintTable>,

    /// Minimum days per month, overriding `min_num_obs.monthly.daily`.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub min_dim: Option<u32>,

    #[serde(default)]
    pub obs_remove_outliers: bool,

    #[serde(default)]
    pub model_remove_outliers: bool,

    #[serde(default)]
    pub zeros_to_nan: bool,

    #[serde(default = "default_true")]
    pub weighted_stats: bool,

    #[serde(default)]
    pub annual_stats_constrained: bool,

    #[serde(default = "default_true")]
    pub harmonise_units: bool,

    #[serde(default)]
    pub colocate_time: bool,

    #[serde(default = "default_true")]
    pub reanalyse_existing: bool,

    #[serde(default = "default_true")]
    pub clear_existing_json: bool,

    #[serde(default)]
    pub raise_exceptions: bool,

    #[serde(default)]
    pub add_trends: bool,

    #[serde(default)]
    pub avg_over_trends: bool,

    #[serde(default = "default_min_yrs")]
    #[validate(range(min = 2))]
    pub obs_min_yrs: u32,

    #[serde(default = "default_min_yrs")]
    #[validate(range(min = 2))]
    pub stats_min_yrs: u32,

    #[serde(default)]
    pub sequential_yrs: bool,

    #[serde(default = "default_slope_alpha")]
    #[validate(range(min = 0.0, max = 0.999))]
    pub slope_alpha: f64,

    #[serde(default)]
    pub resample_how: ResampleHowTable,

    #[serde(default)]
    pub avg_how: AggregationMethod,

    #[serde(default = "default_filter_name")]
    pub filter_name: String,

    #[serde(default)]
    pub regions_how: RegionsHow,

    #[serde(default)]
    pub add_regions: Vec<RegionDef>,

    /// Custom variables registered on top of the built-in ones.
    #[serde(default)]
    pub variables: Vec<VariableDef>,

    #[validate(length(min = 1))]
    pub obs_cfg: BTreeMap<String, ObsEntry>,

    #[validate(length(min = 1))]
    pub model_cfg: BTreeMap<String, ModelEntry>,

    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub colocation_max_distance_km: Option<f64>,

    #[serde(default = "default_coldata_basedir")]
    pub coldata_basedir: PathBuf,

    #[serde(default = "default_json_basedir")]
    pub json_basedir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ObsFilters {
    #[serde(default)]
    pub latitude: Option<[f64; 2]>,
    #[serde(default)]
    pub longitude: Option<[f64; 2]>,
    #[serde(default)]
    pub altitude: Option<[f64; 2]>,
    /// Mask samples carrying an instrument QC flag.
    #[serde(default)]
    pub set_flags_nan: bool,
    /// Accepted data levels, as `2` (upper bound) or `[min, max]` with
    /// nullable bounds.
    #[serde(default)]
    pub data_level: Option<DataLevelFilter>,
    /// Per-network override of `obs_remove_outliers`.
    #[serde(default)]
    pub remove_outliers: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataLevelFilter {
    Max(u8),
    Range([Option<u8>; 2]),
}

impl DataLevelFilter {
    pub fn bounds(&self) -> (Option<u8>, Option<u8>) {
        match *self {
            DataLevelFilter::Max(max) => (None, Some(max)),
            DataLevelFilter::Range([min, max]) => (min, max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BulkOptions {
    /// Numerator and denominator, in that order.
    #[validate(length(equal = 2))]
    pub vars: Vec<String>,
    #[serde(default)]
    pub model_exists: bool,
    pub mode: BulkMode,
    #[serde(default)]
    pub units: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ObsEntry {
    #[validate(length(min = 1))]
    pub obs_id: String,

    #[validate(length(min = 1))]
    pub obs_vars: Vec<String>,

    #[serde(default)]
    pub obs_vert_type: Option<VerticalType>,

    /// Colocation frequency for this network, overriding the global `ts_type`.
    #[serde(default)]
    pub ts_type: Option<Frequency>,

    #[serde(default)]
    pub colocate_time: Option<bool>,

    #[serde(default)]
    pub harmonise_units: Option<bool>,

    #[serde(default)]
    #[validate(nested)]
    pub obs_filters: ObsFilters,

    #[serde(default)]
    pub var_outlier_ranges: BTreeMap<String, [f64; 2]>,

    #[serde(default)]
    pub is_bulk: bool,

    #[serde(default)]
    pub bulk_options: BTreeMap<String, BulkOptions>,

    /// Models this network is compared against; all models when absent.
    #[serde(default)]
    pub models: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReadAux {
    #[validate(length(min = 1))]
    pub vars_required: Vec<String>,
    pub fun: CombineFunction,
    #[serde(default)]
    pub units: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    #[validate(length(min = 1))]
    pub model_id: String,

    /// Resolution model data is brought to right after reading.
    #[serde(default)]
    pub model_ts_type_read: Option<Frequency>,

    /// Observation variable -> model variable compared against it.
    #[serde(default)]
    pub model_use_vars: BTreeMap<String, String>,

    /// Variable name in the model data -> name used in the evaluation.
    #[serde(default)]
    pub model_rename_vars: BTreeMap<String, String>,

    /// Model variables computed from other model variables.
    #[serde(default)]
    pub model_read_aux: BTreeMap<String, ReadAux>,

    #[serde(default)]
    pub var_outlier_ranges: BTreeMap<String, [f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct VariableDef {
    #[validate(length(min = 1))]
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub vertical_type: Option<VerticalType>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RegionDef {
    #[validate(length(min = 1))]
    pub name: String,
    pub lat_range: [f64; 2],
    pub lon_range: [f64; 2],
    #[serde(default)]
    pub alt_range: Option<[f64; 2]>,
}

fn check_range(context: &str, range: &[f64; 2]) -> Result<()> {
    validate_range(context, (range[0], range[1]))
}

impl EvalConfig {
    /// Load from a TOML, YAML or JSON file; the format follows the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: EvalConfig = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
            .map_err(|e| ProcessingError::config(format!("{}: {}", path.display(), e)))?;
        config.validate_all()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EvalConfig =
            serde_json::from_str(json).map_err(|e| ProcessingError::config(e.to_string()))?;
        config.validate_all()?;
        Ok(config)
    }

    pub fn main_freq(&self) -> Frequency {
        self.main_freq
            .or_else(|| self.freqs.first().copied())
            .unwrap_or(self.ts_type)
    }

    pub fn parsed_periods(&self) -> Result<Vec<Period>> {
        self.periods.iter().map(|p| p.parse()).collect()
    }

    /// Constraint table after applying defaults and `min_dim`.
    pub fn constraints(&self) -> Result<ResampleConstraints> {
        let base = match &self.min_num_obs {
            Some(table) => ResampleConstraints::from_table(table.clone())?,
            None => ConstraintDefaults::constraints(),
        };
        match self.min_dim {
            Some(min) => base.with_entry(Frequency::Monthly, Frequency::Daily, min),
            None => Ok(base),
        }
    }

    /// Field checks plus cross-field consistency.
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        for entry in self.obs_cfg.values() {
            entry.validate()?;
            for options in entry.bulk_options.values() {
                options.validate()?;
            }
        }
        for entry in self.model_cfg.values() {
            entry.validate()?;
            for aux in entry.model_read_aux.values() {
                aux.validate()?;
            }
        }
        for variable in &self.variables {
            variable.validate()?;
        }
        for region in &self.add_regions {
            region.validate()?;
        }

        self.parsed_periods()?;
        self.constraints()?;

        let main = self.main_freq();
        if !self.freqs.contains(&main) {
            return Err(ProcessingError::config(format!(
                "main_freq {} is not one of freqs",
                main
            )));
        }
        for (key, entry) in &self.obs_cfg {
            let ts_type = entry.ts_type.unwrap_or(self.ts_type);
            if let Some(freq) = self.freqs.iter().find(|f| **f < ts_type) {
                return Err(ProcessingError::config(format!(
                    "obs_cfg.{}: statistics frequency {} is finer than colocation frequency {}",
                    key, freq, ts_type
                )));
            }
            if let Some(models) = &entry.models {
                if let Some(unknown) = models
                    .iter()
                    .find(|m| !self.model_cfg.keys().any(|k| k.eq_ignore_ascii_case(m)))
                {
                    return Err(ProcessingError::config(format!(
                        "obs_cfg.{}: unknown model '{}'",
                        key, unknown
                    )));
                }
            }
            if !entry.bulk_options.is_empty() && !entry.is_bulk {
                return Err(ProcessingError::config(format!(
                    "obs_cfg.{}: bulk_options given but is_bulk is false",
                    key
                )));
            }
            if entry.is_bulk {
                for var in &entry.obs_vars {
                    if !entry
                        .bulk_options
                        .keys()
                        .any(|k| k.eq_ignore_ascii_case(var))
                    {
                        return Err(ProcessingError::config(format!(
                            "obs_cfg.{}: bulk variable {} has no bulk_options",
                            key, var
                        )));
                    }
                }
            }
            if let Some(range) = &entry.obs_filters.latitude {
                check_range("latitude", range)?;
            }
            if let Some(range) = &entry.obs_filters.altitude {
                check_range("altitude", range)?;
            }
            if let Some(filter) = &entry.obs_filters.data_level {
                let (min, max) = filter.bounds();
                if min.into_iter().chain(max).any(|level| level > MAX_DATA_LEVEL)
                    || matches!((min, max), (Some(lo), Some(hi)) if lo > hi)
                {
                    return Err(ProcessingError::config(format!(
                        "obs_cfg.{}: invalid data_level filter {:?}",
                        key, filter
                    )));
                }
            }
            for (var, range) in &entry.var_outlier_ranges {
                check_range(var, range)?;
            }
        }
        for entry in self.model_cfg.values() {
            for (var, range) in &entry.var_outlier_ranges {
                check_range(var, range)?;
            }
        }
        for variable in &self.variables {
            if let (Some(lo), Some(hi)) = (variable.minimum, variable.maximum) {
                validate_range(&variable.name, (lo, hi))?;
            }
        }
        Ok(())
    }
}
