use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProcessingError, Result};
use crate::models::{Frequency, Period, Site, VerticalType};

/// Identity of a persisted colocated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub model: String,
    pub obs: String,
    pub variable: String,
    pub frequency: Frequency,
    pub period: Period,
    pub region: String,
}

impl ArtifactKey {
    pub fn file_stem(&self) -> String {
        let clean = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
                .collect::<String>()
        };
        format!(
            "{}_REF-{}_MOD-{}_{}_{}_{}",
            clean(&self.variable),
            clean(&self.obs),
            clean(&self.model),
            self.period,
            clean(&self.region),
            self.frequency
        )
    }

    pub fn with_frequency(&self, frequency: Frequency) -> Self {
        Self {
            frequency,
            ..self.clone()
        }
    }

    pub fn with_region(&self, region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.model, self.obs, self.variable, self.frequency, self.period, self.region
        )
    }
}

/// One unit of batch work: a model, an observation network, a variable and a
/// period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CombinationKey {
    pub model: String,
    pub obs: String,
    pub variable: String,
    pub period: Period,
}

impl CombinationKey {
    pub fn new(model: &str, obs: &str, variable: &str, period: Period) -> Self {
        Self {
            model: model.to_string(),
            obs: obs.to_string(),
            variable: variable.to_string(),
            period,
        }
    }

    pub fn artifact_key(&self, frequency: Frequency, region: &str) -> ArtifactKey {
        ArtifactKey {
            model: self.model.clone(),
            obs: self.obs.clone(),
            variable: self.variable.clone(),
            frequency,
            period: self.period,
            region: region.to_string(),
        }
    }

    pub fn file_stem(&self) -> String {
        let clean = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
                .collect::<String>()
        };
        format!(
            "{}_REF-{}_MOD-{}_{}",
            clean(&self.variable),
            clean(&self.obs),
            clean(&self.model),
            self.period
        )
    }
}

impl fmt::Display for CombinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.model, self.obs, self.variable, self.period)
    }
}

/// One row of a colocated pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairedValue {
    pub time: NaiveDateTime,
    pub obs: Option<f64>,
    pub model: Option<f64>,
    /// Raw observation samples behind `obs`.
    pub weight: u32,
}

impl PairedValue {
    pub fn is_valid(&self) -> bool {
        self.obs.is_some() && self.model.is_some()
    }
}

/// Model and observation values of one site on a shared timestamp index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColocatedPair {
    pub site: Site,
    /// Model grid cell or site the observation was matched to.
    pub model_site_id: String,
    pub frequency: Frequency,
    rows: Vec<PairedValue>,
}

impl ColocatedPair {
    pub fn new(site: Site, model_site_id: &str, frequency: Frequency, mut rows: Vec<PairedValue>) -> Result<Self> {
        rows.sort_by_key(|r| r.time);
        if rows.windows(2).any(|w| w[0].time == w[1].time) {
            return Err(ProcessingError::InvalidFormat(format!(
                "colocated pair for {} has duplicate timestamps",
                site.id
            )));
        }
        Ok(Self {
            site,
            model_site_id: model_site_id.to_string(),
            frequency,
            rows,
        })
    }

    pub fn rows(&self) -> &[PairedValue] {
        &self.rows
    }

    pub fn times(&self) -> Vec<NaiveDateTime> {
        self.rows.iter().map(|r| r.time).collect()
    }

    /// Validity mask: true where both sides hold a value.
    pub fn mask(&self) -> Vec<bool> {
        self.rows.iter().map(|r| r.is_valid()).collect()
    }

    pub fn num_valid(&self) -> usize {
        self.rows.iter().filter(|r| r.is_valid()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn restrict_to(&self, period: &Period) -> ColocatedPair {
        Self {
            site: self.site.clone(),
            model_site_id: self.model_site_id.clone(),
            frequency: self.frequency,
            rows: self
                .rows
                .iter()
                .filter(|r| period.contains(r.time))
                .copied()
                .collect(),
        }
    }

    pub(crate) fn with_rows(&self, frequency: Frequency, rows: Vec<PairedValue>) -> ColocatedPair {
        Self {
            site: self.site.clone(),
            model_site_id: self.model_site_id.clone(),
            frequency,
            rows,
        }
    }
}

/// All colocated pairs of one artifact key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColocatedDataset {
    pub key: ArtifactKey,
    pub unit: String,
    pub vertical_type: Option<VerticalType>,
    pub colocate_time: bool,
    pub pairs: Vec<ColocatedPair>,
}

impl ColocatedDataset {
    pub fn num_valid(&self) -> usize {
        self.pairs.iter().map(|p| p.num_valid()).sum()
    }

    pub fn sites(&self) -> Vec<&Site> {
        self.pairs.iter().map(|p| &p.site).collect()
    }

    pub fn frequency(&self) -> Frequency {
        self.key.frequency
    }
}
