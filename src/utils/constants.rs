/// Sites above this altitude (m) are dropped by `-noMOUNTAINS` filters
pub const MOUNTAIN_ALTITUDE_M: f64 = 1000.0;

/// Highest data level an observation network may declare
pub const MAX_DATA_LEVEL: u8 = 4;

/// Default filter applied to observation sites
pub const DEFAULT_FILTER_NAME: &str = "ALL-wMOUNTAINS";

/// Default minimum sample counts when no `min_num_obs` table is configured
pub const DEFAULT_MIN_MONTHS_PER_YEAR: u32 = 3;
pub const DEFAULT_MIN_DAYS_PER_MONTH: u32 = 7;
pub const DEFAULT_MIN_HOURS_PER_DAY: u32 = 6;

/// Trend defaults
pub const DEFAULT_SLOPE_ALPHA: f64 = 0.68;
pub const DEFAULT_MIN_TREND_YEARS: u32 = 7;

/// Output layout
pub const STATS_DIR: &str = "stats";
pub const TRENDS_DIR: &str = "trends";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const COLDATA_EXTENSION: &str = "parquet";

/// Parquet defaults
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10000;
