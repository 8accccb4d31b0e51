use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ProcessingError, Result};
use crate::models::Frequency;
use crate::utils::constants::{
    DEFAULT_MIN_DAYS_PER_MONTH, DEFAULT_MIN_HOURS_PER_DAY, DEFAULT_MIN_MONTHS_PER_YEAR,
};

/// `min_num_obs` as written in configuration: target -> source -> minimum count.
pub type ConstraintTable = BTreeMap<Frequency, BTreeMap<Frequency, u32>>;

/// Whether a coarse bucket has enough valid finer samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketSupport {
    Sufficient { found: u32 },
    InsufficientData { found: u32, required: u32 },
}

impl BucketSupport {
    pub fn is_sufficient(&self) -> bool {
        matches!(self, BucketSupport::Sufficient { .. })
    }
}

/// Minimum sample counts required when aggregating one frequency into a
/// coarser one. Sources are always strictly finer than their target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResampleConstraints {
    table: ConstraintTable,
}

impl ResampleConstraints {
    /// No floors at all: every non-empty bucket is aggregated.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_table(table: ConstraintTable) -> Result<Self> {
        for (target, sources) in &table {
            for source in sources.keys() {
                if source >= target {
                    return Err(ProcessingError::config(format!(
                        "min_num_obs.{}.{}: source frequency must be finer than target",
                        target, source
                    )));
                }
            }
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &ConstraintTable {
        &self.table
    }

    /// Set a single entry, e.g. the `min_dim` shorthand for monthly.daily.
    pub fn with_entry(mut self, target: Frequency, source: Frequency, min: u32) -> Result<Self> {
        if source >= target {
            return Err(ProcessingError::config(format!(
                "constraint {} from {} is not coarser-to-finer",
                target, source
            )));
        }
        self.table.entry(target).or_default().insert(source, min);
        Ok(self)
    }

    /// Copy without any floor for buckets of `target`.
    pub fn without_target(&self, target: Frequency) -> Self {
        let mut table = self.table.clone();
        table.remove(&target);
        Self { table }
    }

    pub fn min_required(&self, target: Frequency, source: Frequency) -> Option<u32> {
        self.table.get(&target).and_then(|s| s.get(&source)).copied()
    }

    /// Check one bucket of `target` built from `valid_count` valid samples of
    /// `source`. Buckets without a configured entry have no floor, but an
    /// empty bucket never counts as supported.
    pub fn check(&self, target: Frequency, source: Frequency, valid_count: u32) -> BucketSupport {
        let required = self.min_required(target, source).unwrap_or(1).max(1);
        if valid_count >= required {
            BucketSupport::Sufficient { found: valid_count }
        } else {
            BucketSupport::InsufficientData {
                found: valid_count,
                required,
            }
        }
    }
}

/// Default constraint table used when the configuration sets none.
pub struct ConstraintDefaults;

impl ConstraintDefaults {
    pub fn table() -> ConstraintTable {
        let mut table = ConstraintTable::new();
        table
            .entry(Frequency::Yearly)
            .or_default()
            .insert(Frequency::Monthly, DEFAULT_MIN_MONTHS_PER_YEAR);
        table
            .entry(Frequency::Monthly)
            .or_default()
            .insert(Frequency::Daily, DEFAULT_MIN_DAYS_PER_MONTH);
        table
            .entry(Frequency::Daily)
            .or_default()
            .insert(Frequency::Hourly, DEFAULT_MIN_HOURS_PER_DAY);
        table
    }

    pub fn constraints() -> ResampleConstraints {
        ResampleConstraints {
            table: Self::table(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = ConstraintDefaults::constraints();
        assert_eq!(c.min_required(Frequency::Yearly, Frequency::Monthly), Some(3));
        assert_eq!(c.min_required(Frequency::Monthly, Frequency::Daily), Some(7));
        assert_eq!(c.min_required(Frequency::Monthly, Frequency::Weekly), None);
    }

    #[test]
    fn test_rejects_inverted_hierarchy() {
        let mut table = ConstraintTable::new();
        table
            .entry(Frequency::Daily)
            .or_default()
            .insert(Frequency::Monthly, 1);
        assert!(ResampleConstraints::from_table(table).is_err());

        let mut table = ConstraintTable::new();
        table
            .entry(Frequency::Monthly)
            .or_default()
            .insert(Frequency::Monthly, 1);
        assert!(ResampleConstraints::from_table(table).is_err());
    }

    #[test]
    fn test_check() {
        let c = ResampleConstraints::none()
            .with_entry(Frequency::Yearly, Frequency::Monthly, 9)
            .unwrap();
        assert!(c.check(Frequency::Yearly, Frequency::Monthly, 11).is_sufficient());
        assert_eq!(
            c.check(Frequency::Yearly, Frequency::Monthly, 8),
            BucketSupport::InsufficientData { found: 8, required: 9 }
        );
        // no entry: any non-empty bucket passes
        assert!(c.check(Frequency::Monthly, Frequency::Daily, 1).is_sufficient());
        assert!(!c.check(Frequency::Monthly, Frequency::Daily, 0).is_sufficient());

        let relaxed = c.without_target(Frequency::Yearly);
        assert!(relaxed.check(Frequency::Yearly, Frequency::Monthly, 1).is_sufficient());
    }
}
