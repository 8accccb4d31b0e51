pub mod batch;
pub mod colocator;
pub mod constraints;
pub mod derived;
pub mod outliers;
pub mod resampler;
pub mod statistics;
pub mod trends;
pub mod units;

pub use batch::{CombinationOutcome, CombinationStatus, EvaluationProcessor, RunManifest};
pub use colocator::{ColocationSettings, Colocator};
pub use constraints::{BucketSupport, ConstraintDefaults, ResampleConstraints};
pub use derived::{DerivationRule, DerivedVariableEngine, DerivedVariableRegistry};
pub use outliers::{OutlierFilter, SiteFilter};
pub use resampler::{AggregationMethod, TemporalResampler};
pub use statistics::{ComparisonStats, StatisticsAggregator, StatisticsRecord};
pub use trends::{TrendOutcome, TrendRecord, TrendsEstimator};
pub use units::UnitHarmonizer;
