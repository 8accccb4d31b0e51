pub mod context;
pub mod eval_config;

pub use context::{ModelSetup, ObsSetup, RunContext};
pub use eval_config::{BulkOptions, DataLevelFilter, EvalConfig, ModelEntry, ObsEntry, ObsFilters, ReadAux, RegionDef, VariableDef};
