use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ProcessingError, Result};
use crate::processors::units::UnitHarmonizer;

/// Where along the atmospheric column a quantity applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerticalType {
    Surface,
    Column,
    Profile,
}

impl VerticalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerticalType::Surface => "Surface",
            VerticalType::Column => "Column",
            VerticalType::Profile => "Profile",
        }
    }
}

impl fmt::Display for VerticalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VerticalType {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "surface" => Ok(VerticalType::Surface),
            "column" => Ok(VerticalType::Column),
            "profile" => Ok(VerticalType::Profile),
            other => Err(ProcessingError::InvalidFormat(format!(
                "unknown vertical type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub unit: String,
    /// Inclusive plausible range `[low, high]` used by the outlier filter.
    pub outlier_range: Option<(f64, f64)>,
    pub vertical_type: Option<VerticalType>,
    pub description: Option<String>,
}

impl Variable {
    pub fn new(name: &str, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            outlier_range: None,
            vertical_type: None,
            description: None,
        }
    }

    pub fn with_outlier_range(mut self, low: f64, high: f64) -> Self {
        self.outlier_range = Some((low, high));
        self
    }

    pub fn with_vertical_type(mut self, vertical_type: VerticalType) -> Self {
        self.vertical_type = Some(vertical_type);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Name -> variable lookup, built once per run and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: BTreeMap<String, Variable>,
}

impl VariableRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry pre-filled with the aerosol variables known out of the box.
    pub fn with_defaults() -> Self {
        use VerticalType::*;

        let defaults = [
            Variable::new("od550aer", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column)
                .with_description("Aerosol optical depth at 550 nm"),
            Variable::new("od550lt1aer", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column)
                .with_description("Fine mode AOD at 550 nm"),
            Variable::new("od550gt1aer", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column)
                .with_description("Coarse mode AOD at 550 nm"),
            Variable::new("od870aer", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column),
            Variable::new("od550dust", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column),
            Variable::new("od550ss", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column),
            Variable::new("od550bc", "1")
                .with_outlier_range(-1.0, 10.0)
                .with_vertical_type(Column),
            Variable::new("abs550aer", "1")
                .with_outlier_range(-1.0, 1.0)
                .with_vertical_type(Column)
                .with_description("Absorption AOD at 550 nm"),
            Variable::new("ang4487aer", "1")
                .with_outlier_range(-0.5, 5.0)
                .with_vertical_type(Column)
                .with_description("Angstrom exponent 440-870 nm"),
            Variable::new("absc550aer", "Mm-1")
                .with_outlier_range(-1.0, 100.0)
                .with_vertical_type(Surface),
            Variable::new("abs550dryaer", "Mm-1")
                .with_outlier_range(-1.0, 100.0)
                .with_vertical_type(Surface),
            Variable::new("ec550dryaer", "Mm-1")
                .with_outlier_range(-10.0, 1000.0)
                .with_vertical_type(Surface),
            Variable::new("scatc550aer", "Mm-1")
                .with_outlier_range(-10.0, 1000.0)
                .with_vertical_type(Surface),
            Variable::new("scatc550dryaer", "Mm-1")
                .with_outlier_range(-10.0, 1000.0)
                .with_vertical_type(Surface),
            Variable::new("bscatc532aer", "Mm-1 sr-1").with_vertical_type(Profile),
            Variable::new("ec532aer", "Mm-1").with_vertical_type(Profile),
            Variable::new("concpm10", "ug m-3")
                .with_outlier_range(0.0, 5000.0)
                .with_vertical_type(Surface)
                .with_description("PM10 mass concentration"),
            Variable::new("concpm25", "ug m-3")
                .with_outlier_range(0.0, 5000.0)
                .with_vertical_type(Surface)
                .with_description("PM2.5 mass concentration"),
            Variable::new("sconcso4", "ug S m-3")
                .with_outlier_range(0.0, 1000.0)
                .with_vertical_type(Surface),
            Variable::new("sconcso2", "ug S m-3")
                .with_outlier_range(0.0, 1000.0)
                .with_vertical_type(Surface),
            Variable::new("sconcso4pr", "mg S m-2 d-1").with_vertical_type(Surface),
            Variable::new("vmro3", "nmol mol-1")
                .with_outlier_range(0.0, 300.0)
                .with_vertical_type(Surface),
            Variable::new("vmro3max", "nmol mol-1")
                .with_outlier_range(0.0, 300.0)
                .with_vertical_type(Surface),
            Variable::new("concecCoarse", "ug C m-3").with_vertical_type(Surface),
            Variable::new("concecFine", "ug C m-3").with_vertical_type(Surface),
            Variable::new("elementalcarbon", "ug C m-3").with_vertical_type(Surface),
            Variable::new("organiccarbon", "ug C m-3").with_vertical_type(Surface),
        ];

        let variables = defaults
            .into_iter()
            .map(|v| (v.name.clone(), v))
            .collect();
        Self { variables }
    }

    /// Register a variable. Re-registering with an equivalent unit spelling
    /// is a no-op, a conflicting unit is a configuration error.
    pub fn register(&mut self, variable: Variable) -> Result<()> {
        if let Some(existing) = self.variables.get(&variable.name) {
            if !UnitHarmonizer::are_equivalent(&existing.unit, &variable.unit) {
                return Err(ProcessingError::config(format!(
                    "variable '{}' already registered with unit '{}', cannot re-register with '{}'",
                    variable.name, existing.unit, variable.unit
                )));
            }
            return Ok(());
        }
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn unit_of(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|v| v.unit.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
