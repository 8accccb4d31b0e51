use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{ProcessingError, Result};
use crate::models::{Sample, TimeSeries, VariableRegistry};
use crate::processors::units::UnitHarmonizer;

/// Elementwise combination of several variables of the same source
/// (`model_read_aux`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineFunction {
    #[serde(alias = "add_cubes")]
    Add,
    #[serde(alias = "subtract_cubes")]
    Subtract,
    #[serde(alias = "multiply_cubes")]
    Multiply,
    #[serde(alias = "divide_cubes")]
    Divide,
    #[serde(alias = "calc_ae")]
    AngstromExponent,
}

impl CombineFunction {
    fn accepts_arity(&self, n: usize) -> bool {
        match self {
            CombineFunction::Add | CombineFunction::Multiply => n >= 2,
            CombineFunction::Subtract | CombineFunction::Divide | CombineFunction::AngstromExponent => n == 2,
        }
    }

    fn apply(&self, values: &[f64], wavelengths: Option<(f64, f64)>) -> Option<f64> {
        let result = match self {
            CombineFunction::Add => values.iter().sum(),
            CombineFunction::Subtract => values[0] - values[1],
            CombineFunction::Multiply => values.iter().product(),
            CombineFunction::Divide => {
                if values[1] == 0.0 {
                    return None;
                }
                values[0] / values[1]
            }
            CombineFunction::AngstromExponent => {
                let (l1, l2) = wavelengths?;
                if values[0] <= 0.0 || values[1] <= 0.0 {
                    return None;
                }
                -(values[0] / values[1]).ln() / (l1 / l2).ln()
            }
        };
        result.is_finite().then_some(result)
    }
}

impl fmt::Display for CombineFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CombineFunction::Add => "add",
            CombineFunction::Subtract => "subtract",
            CombineFunction::Multiply => "multiply",
            CombineFunction::Divide => "divide",
            CombineFunction::AngstromExponent => "angstrom_exponent",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkMode {
    Ratio,
    /// Ratio restricted to [0, 1]; values outside are masked.
    Fraction,
    Difference,
}

impl BulkMode {
    fn apply(&self, a: f64, b: f64) -> Option<f64> {
        let value = match self {
            BulkMode::Ratio => (b != 0.0).then(|| a / b),
            BulkMode::Fraction => {
                if b == 0.0 {
                    return None;
                }
                let f = a / b;
                (0.0..=1.0).contains(&f).then_some(f)
            }
            BulkMode::Difference => Some(a - b),
        };
        value.filter(|v| v.is_finite())
    }
}

/// Observation-side bulk variable, e.g. `fraction = concpm25 / concpm10`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDerivationSpec {
    pub target: String,
    pub numerator: String,
    pub denominator: String,
    pub mode: BulkMode,
    /// When false the model variable of the same name is read directly.
    pub model_exists: bool,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivationStrategy {
    Combine {
        function: CombineFunction,
        wavelengths: Option<(f64, f64)>,
    },
    Bulk {
        mode: BulkMode,
        model_exists: bool,
    },
}

/// Validated recipe for one derived variable.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationRule {
    pub target: String,
    pub inputs: Vec<String>,
    pub unit: String,
    pub strategy: DerivationStrategy,
}

/// Wavelength in nm parsed from names like `od440aer`.
fn wavelength_of(variable: &str) -> Option<f64> {
    let rest = variable.strip_prefix("od")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

impl DerivationRule {
    pub fn combine(
        target: &str,
        inputs: &[String],
        function: CombineFunction,
        unit: Option<&str>,
        variables: &VariableRegistry,
    ) -> Result<Self> {
        if !function.accepts_arity(inputs.len()) {
            return Err(ProcessingError::config(format!(
                "{}: function {} cannot combine {} input variable(s)",
                target,
                function,
                inputs.len()
            )));
        }

        let wavelengths = if function == CombineFunction::AngstromExponent {
            match (wavelength_of(&inputs[0]), wavelength_of(&inputs[1])) {
                (Some(l1), Some(l2)) if l1 != l2 => Some((l1, l2)),
                _ => {
                    return Err(ProcessingError::config(format!(
                        "{}: cannot read two distinct wavelengths from {:?}",
                        target, inputs
                    )))
                }
            }
        } else {
            None
        };

        let unit = match (unit, function) {
            (Some(u), _) => u.to_string(),
            (None, CombineFunction::AngstromExponent) => "1".to_string(),
            (None, CombineFunction::Add | CombineFunction::Subtract) => variables
                .unit_of(target)
                .or_else(|| variables.unit_of(&inputs[0]))
                .map(str::to_string)
                .ok_or_else(|| {
                    ProcessingError::config(format!("{}: output unit cannot be inferred", target))
                })?,
            (None, _) => variables.unit_of(target).map(str::to_string).ok_or_else(|| {
                ProcessingError::config(format!(
                    "{}: {} requires an explicit output unit",
                    target, function
                ))
            })?,
        };

        Ok(Self {
            target: target.to_string(),
            inputs: inputs.to_vec(),
            unit,
            strategy: DerivationStrategy::Combine {
                function,
                wavelengths,
            },
        })
    }

    pub fn bulk(spec: &BulkDerivationSpec, variables: &VariableRegistry) -> Result<Self> {
        if spec.numerator == spec.denominator {
            return Err(ProcessingError::config(format!(
                "{}: bulk inputs must be two different variables",
                spec.target
            )));
        }
        let unit = match (&spec.unit, spec.mode) {
            (Some(u), _) => u.clone(),
            (None, BulkMode::Difference) => variables
                .unit_of(&spec.numerator)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProcessingError::config(format!("{}: output unit cannot be inferred", spec.target))
                })?,
            (None, _) => variables.unit_of(&spec.target).unwrap_or("1").to_string(),
        };
        Ok(Self {
            target: spec.target.clone(),
            inputs: vec![spec.numerator.clone(), spec.denominator.clone()],
            unit,
            strategy: DerivationStrategy::Bulk {
                mode: spec.mode,
                model_exists: spec.model_exists,
            },
        })
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self.strategy, DerivationStrategy::Bulk { .. })
    }

    /// Whether the model side derives this variable too. Elementwise rules are
    /// registered per model, so they always apply there.
    pub fn applies_to_model(&self) -> bool {
        match self.strategy {
            DerivationStrategy::Combine { .. } => true,
            DerivationStrategy::Bulk { model_exists, .. } => model_exists,
        }
    }

    /// Unit each input is converted to before combining.
    fn input_unit<'a>(&'a self, first_input_unit: &'a str) -> Option<&'a str> {
        match &self.strategy {
            DerivationStrategy::Combine { function, .. } => match function {
                CombineFunction::Add | CombineFunction::Subtract => Some(&self.unit),
                CombineFunction::AngstromExponent => Some(first_input_unit),
                CombineFunction::Multiply | CombineFunction::Divide => None,
            },
            DerivationStrategy::Bulk { mode, .. } => match mode {
                BulkMode::Difference => Some(&self.unit),
                BulkMode::Ratio | BulkMode::Fraction => Some(first_input_unit),
            },
        }
    }

    fn combine_values(&self, values: &[f64]) -> Option<f64> {
        match &self.strategy {
            DerivationStrategy::Combine {
                function,
                wavelengths,
            } => function.apply(values, *wavelengths),
            DerivationStrategy::Bulk { mode, .. } => mode.apply(values[0], values[1]),
        }
    }

    /// Derive the target series of one site. Inputs are given in rule order
    /// and must share one frequency.
    pub fn apply(&self, inputs: &[&TimeSeries], harmonizer: &UnitHarmonizer) -> Result<TimeSeries> {
        let Some(first) = inputs.first() else {
            return Err(ProcessingError::config(format!("{}: no input series", self.target)));
        };
        if inputs.len() != self.inputs.len() {
            return Err(ProcessingError::config(format!(
                "{}: expected {} inputs, got {}",
                self.target,
                self.inputs.len(),
                inputs.len()
            )));
        }
        if let Some(other) = inputs.iter().find(|s| s.frequency() != first.frequency()) {
            return Err(ProcessingError::InvalidFormat(format!(
                "{}: inputs at {} and {} must be aligned before derivation",
                self.target,
                first.frequency(),
                other.frequency()
            )));
        }

        let converted = match self.input_unit(first.unit()) {
            Some(unit) => inputs
                .iter()
                .map(|s| harmonizer.convert(s, unit))
                .collect::<Result<Vec<_>>>()?,
            None => inputs.iter().map(|s| (*s).clone()).collect(),
        };

        let mut rows: BTreeMap<NaiveDateTime, Vec<Option<(f64, u32)>>> = BTreeMap::new();
        for (idx, series) in converted.iter().enumerate() {
            for sample in series.samples() {
                let slot = rows
                    .entry(sample.time)
                    .or_insert_with(|| vec![None; converted.len()]);
                slot[idx] = sample.value.map(|v| (v, sample.weight.max(1)));
            }
        }

        let samples = rows
            .into_iter()
            .map(|(time, slots)| {
                let complete: Option<Vec<(f64, u32)>> = slots.into_iter().collect();
                match complete {
                    Some(parts) => {
                        let values: Vec<f64> = parts.iter().map(|(v, _)| *v).collect();
                        match self.combine_values(&values) {
                            Some(value) => Sample {
                                time,
                                value: Some(value),
                                flagged: false,
                                weight: parts.iter().map(|(_, w)| *w).min().unwrap_or(1),
                            },
                            None => Sample::missing(time),
                        }
                    }
                    None => Sample::missing(time),
                }
            })
            .collect();

        let mut meta = first.meta().clone();
        meta.variable = self.target.clone();
        meta.unit = self.unit.clone();
        Ok(TimeSeries::from_sorted(meta, first.frequency(), samples))
    }
}

/// Typed lookup of derived variables, validated when the run starts.
#[derive(Debug, Clone, Default)]
pub struct DerivedVariableRegistry {
    rules: BTreeMap<String, DerivationRule>,
}

impl DerivedVariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: DerivationRule) -> Result<()> {
        if rule.inputs.iter().any(|i| i == &rule.target) {
            return Err(ProcessingError::config(format!(
                "{} cannot be derived from itself",
                rule.target
            )));
        }
        if let Some(existing) = self.rules.get(&rule.target) {
            if existing != &rule {
                return Err(ProcessingError::config(format!(
                    "conflicting derivations registered for {}",
                    rule.target
                )));
            }
            return Ok(());
        }
        self.rules.insert(rule.target.clone(), rule);
        Ok(())
    }

    pub fn get(&self, target: &str) -> Option<&DerivationRule> {
        self.rules.get(target)
    }

    pub fn contains(&self, target: &str) -> bool {
        self.rules.contains_key(target)
    }

    pub fn rules(&self) -> impl Iterator<Item = &DerivationRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Applies a rule to every site for which all inputs are present.
pub struct DerivedVariableEngine<'a> {
    harmonizer: &'a UnitHarmonizer,
}

impl<'a> DerivedVariableEngine<'a> {
    pub fn new(harmonizer: &'a UnitHarmonizer) -> Self {
        Self { harmonizer }
    }

    /// `inputs` maps input variable name to the per-site series of `source_id`.
    /// A variable absent from `inputs`, or no site carrying all of them, fails
    /// with `MissingInputVariable`. Sites missing only some inputs are skipped.
    pub fn derive(
        &self,
        rule: &DerivationRule,
        source_id: &str,
        inputs: &BTreeMap<String, Vec<TimeSeries>>,
    ) -> Result<Vec<TimeSeries>> {
        let mut per_variable: Vec<BTreeMap<&str, &TimeSeries>> = Vec::with_capacity(rule.inputs.len());
        for name in &rule.inputs {
            let series = inputs
                .get(name)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProcessingError::missing_input(name, source_id))?;
            per_variable.push(series.iter().map(|s| (s.site().id.as_str(), s)).collect());
        }

        let mut derived = Vec::new();
        let mut skipped = 0usize;
        for (site_id, first) in &per_variable[0] {
            let mut site_inputs = vec![*first];
            for other in &per_variable[1..] {
                match other.get(site_id) {
                    Some(series) => site_inputs.push(*series),
                    None => break,
                }
            }
            if site_inputs.len() < rule.inputs.len() {
                skipped += 1;
                continue;
            }
            derived.push(rule.apply(&site_inputs, self.harmonizer)?);
        }

        if skipped > 0 {
            warn!(
                target_variable = %rule.target,
                source_id,
                skipped,
                "sites lacking a derivation input were skipped"
            );
        }
        if derived.is_empty() {
            let absent = rule
                .inputs
                .iter()
                .zip(&per_variable)
                .skip(1)
                .find(|(_, sites)| !per_variable[0].keys().any(|id| sites.contains_key(id)))
                .map(|(name, _)| name.as_str())
                .unwrap_or(rule.inputs[0].as_str());
            return Err(ProcessingError::missing_input(absent, source_id));
        }
        debug!(target_variable = %rule.target, source_id, sites = derived.len(), "derived variable computed");
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frequency, SeriesMeta, Site};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn t(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, m, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn series(variable: &str, unit: &str, site: &str, values: &[f64]) -> TimeSeries {
        let meta = SeriesMeta::new(variable, unit, "EBAS", Site::new(site, site, 50.0, 10.0, 100.0));
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(t(i as u32 + 1), *v))
            .collect();
        TimeSeries::new(meta, Frequency::Monthly, samples).unwrap()
    }

    fn pm_fraction() -> DerivationRule {
        let spec = BulkDerivationSpec {
            target: "fraction".to_string(),
            numerator: "concpm25".to_string(),
            denominator: "concpm10".to_string(),
            mode: BulkMode::Fraction,
            model_exists: false,
            unit: Some("1".to_string()),
        };
        DerivationRule::bulk(&spec, &VariableRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn test_bulk_fraction_masks_values_above_one() {
        let rule = pm_fraction();
        assert!(!rule.applies_to_model());

        let pm25 = series("concpm25", "ug m-3", "s1", &[5.0, 12.0, 3.0]);
        let pm10 = series("concpm10", "ug m-3", "s1", &[10.0, 8.0, 0.0]);
        let out = rule.apply(&[&pm25, &pm10], &UnitHarmonizer::new()).unwrap();
        assert_eq!(out.variable(), "fraction");
        assert_eq!(out.unit(), "1");
        assert_eq!(out.values(), vec![Some(0.5), None, None]);
    }

    #[test]
    fn test_bulk_converts_denominator_unit() {
        let rule = pm_fraction();
        let pm25 = series("concpm25", "ug m-3", "s1", &[5.0]);
        let pm10 = series("concpm10", "mg m-3", "s1", &[0.02]);
        let out = rule.apply(&[&pm25, &pm10], &UnitHarmonizer::new()).unwrap();
        assert!((out.values()[0].unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_add_converts_to_output_unit() {
        let variables = VariableRegistry::with_defaults();
        let inputs = vec!["concecCoarse".to_string(), "concecFine".to_string()];
        let rule =
            DerivationRule::combine("elementalcarbon", &inputs, CombineFunction::Add, None, &variables).unwrap();
        assert_eq!(rule.unit, "ug C m-3");

        let coarse = series("concecCoarse", "ug C m-3", "cell", &[1.0, 2.0]);
        let fine = series("concecFine", "ng C m-3", "cell", &[500.0, f64::NAN]);
        let out = rule.apply(&[&coarse, &fine], &UnitHarmonizer::new()).unwrap();
        assert!((out.values()[0].unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(out.values()[1], None);
    }

    #[test]
    fn test_angstrom_exponent() {
        let variables = VariableRegistry::with_defaults();
        let inputs = vec!["od440aer".to_string(), "od870aer".to_string()];
        let rule =
            DerivationRule::combine("ang4487aer", &inputs, CombineFunction::AngstromExponent, None, &variables)
                .unwrap();
        let od440 = series("od440aer", "1", "cell", &[0.4]);
        let od870 = series("od870aer", "1", "cell", &[0.2]);
        let out = rule.apply(&[&od440, &od870], &UnitHarmonizer::new()).unwrap();
        let expected = -(2.0f64).ln() / (440.0f64 / 870.0).ln();
        assert!((out.values()[0].unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_load_time_validation() {
        let variables = VariableRegistry::with_defaults();
        let one = vec!["concpm10".to_string()];
        assert!(DerivationRule::combine("x", &one, CombineFunction::Add, None, &variables).is_err());

        let no_wavelength = vec!["abs550aer".to_string(), "od870aer".to_string()];
        assert!(DerivationRule::combine(
            "ae",
            &no_wavelength,
            CombineFunction::AngstromExponent,
            None,
            &variables
        )
        .is_err());

        let two = vec!["concpm25".to_string(), "concpm10".to_string()];
        assert!(DerivationRule::combine("ratio", &two, CombineFunction::Divide, None, &variables).is_err());
        assert!(DerivationRule::combine("ratio", &two, CombineFunction::Divide, Some("1"), &variables).is_ok());

        let alias: CombineFunction = serde_json::from_str("\"add_cubes\"").unwrap();
        assert_eq!(alias, CombineFunction::Add);
    }

    #[test]
    fn test_engine_reports_missing_inputs() {
        let rule = pm_fraction();
        let harmonizer = UnitHarmonizer::new();
        let engine = DerivedVariableEngine::new(&harmonizer);

        let mut inputs = BTreeMap::new();
        inputs.insert("concpm25".to_string(), vec![series("concpm25", "ug m-3", "s1", &[1.0])]);
        let err = engine.derive(&rule, "EBAS", &inputs).unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::MissingInputVariable { ref variable, .. } if variable == "concpm10"
        ));

        inputs.insert("concpm10".to_string(), vec![series("concpm10", "ug m-3", "s2", &[2.0])]);
        let err = engine.derive(&rule, "EBAS", &inputs).unwrap_err();
        assert!(matches!(err, ProcessingError::MissingInputVariable { .. }));

        inputs.get_mut("concpm10").unwrap().push(series("concpm10", "ug m-3", "s1", &[2.0]));
        let derived = engine.derive(&rule, "EBAS", &inputs).unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].values(), vec![Some(0.5)]);
    }

    #[test]
    fn test_conflicting_registration() {
        let mut registry = DerivedVariableRegistry::new();
        registry.register(pm_fraction()).unwrap();
        registry.register(pm_fraction()).unwrap();
        let mut other = pm_fraction();
        other.inputs.reverse();
        assert!(registry.register(other).is_err());
        assert_eq!(registry.len(), 1);
    }
}
