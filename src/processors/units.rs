use std::collections::BTreeMap;

use crate::error::{ProcessingError, Result};
use crate::models::TimeSeries;

/// Interchangeable leading unit tokens and their scale relative to the
/// first entry's base. A conversion is possible when both units start with a
/// token of the same group and share the rest of the unit string.
const SCALE_GROUPS: &[&[(&str, f64)]] = &[
    &[("ng", 1e-9), ("ug", 1e-6), ("mg", 1e-3), ("g", 1.0), ("kg", 1e3)],
    &[("m-1", 1.0), ("km-1", 1e-3), ("Mm-1", 1e-6)],
    &[("ppt", 1e-12), ("ppb", 1e-9), ("ppm", 1e-6)],
    &[("1", 1.0), ("%", 1e-2)],
];

const ALIASES: &[(&str, &str)] = &[
    ("", "1"),
    ("percent", "%"),
    ("pptv", "ppt"),
    ("ppbv", "ppb"),
    ("ppmv", "ppm"),
    ("pmol mol-1", "ppt"),
    ("nmol mol-1", "ppb"),
    ("umol mol-1", "ppm"),
];

/// Converts series between physical units.
#[derive(Debug, Clone, Default)]
pub struct UnitHarmonizer {
    custom: BTreeMap<(String, String), f64>,
}

impl UnitHarmonizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an explicit factor such that `value_in_to = value_in_from * factor`.
    pub fn register_factor(&mut self, from: &str, to: &str, factor: f64) -> Result<()> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(ProcessingError::config(format!(
                "invalid conversion factor {} from '{}' to '{}'",
                factor, from, to
            )));
        }
        self.custom
            .insert((Self::normalize(from), Self::normalize(to)), factor);
        Ok(())
    }

    /// Canonical spelling of a unit string: `µg/m3` and `ug m**-3` both
    /// become `ug m-3`.
    pub fn normalize(unit: &str) -> String {
        let cleaned = unit
            .trim()
            .replace(['µ', 'μ'], "u")
            .replace("**", "")
            .replace('^', "");

        let mut tokens: Vec<String> = Vec::new();
        let mut parts = cleaned.split('/');
        if let Some(numerator) = parts.next() {
            tokens.extend(numerator.split_whitespace().map(str::to_string));
        }
        for denominator in parts {
            for token in denominator.split_whitespace() {
                let split = token
                    .find(|c: char| c.is_ascii_digit() || c == '-')
                    .unwrap_or(token.len());
                let (symbol, power) = token.split_at(split);
                let power = power.trim_start_matches('-');
                let power = if power.is_empty() { "1" } else { power };
                tokens.push(format!("{}-{}", symbol, power));
            }
        }
        if tokens.len() > 1 && tokens[0] == "1" {
            tokens.remove(0);
        }

        let joined = tokens.join(" ");
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == joined)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or(joined)
    }

    pub fn are_equivalent(a: &str, b: &str) -> bool {
        Self::normalize(a) == Self::normalize(b)
    }

    fn scale_of(unit: &str) -> Option<(usize, f64, &str)> {
        let (head, tail) = match unit.split_once(' ') {
            Some((head, tail)) => (head, tail),
            None => (unit, ""),
        };
        SCALE_GROUPS.iter().enumerate().find_map(|(group, members)| {
            members
                .iter()
                .find(|(symbol, _)| *symbol == head)
                .map(|(_, scale)| (group, *scale, tail))
        })
    }

    /// Factor `f` such that `value_in_to = value_in_from * f`.
    pub fn conversion_factor(&self, from: &str, to: &str) -> Result<f64> {
        let from_norm = Self::normalize(from);
        let to_norm = Self::normalize(to);
        if from_norm == to_norm {
            return Ok(1.0);
        }
        if let Some(factor) = self.custom.get(&(from_norm.clone(), to_norm.clone())) {
            return Ok(*factor);
        }
        if let Some(factor) = self.custom.get(&(to_norm.clone(), from_norm.clone())) {
            return Ok(1.0 / factor);
        }
        match (Self::scale_of(&from_norm), Self::scale_of(&to_norm)) {
            (Some((g1, s1, tail1)), Some((g2, s2, tail2))) if g1 == g2 && tail1 == tail2 => {
                Ok(s1 / s2)
            }
            _ => Err(ProcessingError::UnitConversion {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// New series expressed in `target_unit`.
    pub fn convert(&self, series: &TimeSeries, target_unit: &str) -> Result<TimeSeries> {
        let factor = self.conversion_factor(series.unit(), target_unit)?;
        let converted = if factor == 1.0 {
            series.clone()
        } else {
            series.map_values(|_, v| Some(v * factor))
        };
        Ok(converted.with_variable(series.variable(), target_unit))
    }
}
