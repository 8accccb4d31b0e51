use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ProcessingError, Result};
use crate::models::Site;
use crate::utils::constants::MOUNTAIN_ALTITUDE_M;
use crate::utils::coordinates::{longitude_in_range, validate_range};

/// Bounding box as it appears in configuration (`add_regions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionBounds {
    pub lat_range: [f64; 2],
    pub lon_range: [f64; 2],
    #[serde(default)]
    pub alt_range: Option<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionShape {
    Box {
        lat_range: (f64, f64),
        lon_range: (f64, f64),
        alt_range: Option<(f64, f64)>,
    },
    Country(String),
}

/// Named area used to select sites for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub shape: RegionShape,
}

impl Region {
    pub fn bounding_box(name: &str, lat_range: (f64, f64), lon_range: (f64, f64)) -> Self {
        Self {
            name: name.to_string(),
            shape: RegionShape::Box {
                lat_range,
                lon_range,
                alt_range: None,
            },
        }
    }

    pub fn country(code: &str) -> Self {
        let code = code.to_uppercase();
        Self {
            name: code.clone(),
            shape: RegionShape::Country(code),
        }
    }

    pub fn from_bounds(name: &str, bounds: &RegionBounds) -> Result<Self> {
        let lat_range = (bounds.lat_range[0], bounds.lat_range[1]);
        let lon_range = (bounds.lon_range[0], bounds.lon_range[1]);
        validate_range("latitude", lat_range)?;
        let alt_range = bounds.alt_range.map(|a| (a[0], a[1]));
        if let Some(alt) = alt_range {
            validate_range("altitude", alt)?;
        }
        Ok(Self {
            name: name.to_string(),
            shape: RegionShape::Box {
                lat_range,
                lon_range,
                alt_range,
            },
        })
    }

    pub fn contains(&self, site: &Site) -> bool {
        match &self.shape {
            RegionShape::Box {
                lat_range,
                lon_range,
                alt_range,
            } => {
                (lat_range.0..=lat_range.1).contains(&site.latitude)
                    && longitude_in_range(site.normalized_longitude(), *lon_range)
                    && alt_range.map_or(true, |(lo, hi)| (lo..=hi).contains(&site.altitude))
            }
            RegionShape::Country(code) => site.is_in_country(code),
        }
    }
}

/// Site filter parsed from `filter_name`, e.g. `WORLD-noMOUNTAINS`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFilter {
    pub name: String,
    pub region: Region,
    pub exclude_mountains: bool,
}

impl RegionFilter {
    pub fn accepts(&self, site: &Site) -> bool {
        self.region.contains(site) && !(self.exclude_mountains && site.altitude > MOUNTAIN_ALTITUDE_M)
    }
}

/// How sub-regions for statistics are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionsHow {
    #[default]
    Default,
    Country,
}

#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: BTreeMap<String, Region>,
    custom: BTreeSet<String>,
}

impl RegionRegistry {
    pub fn with_defaults() -> Self {
        let defaults = [
            Region::bounding_box("ALL", (-90.0, 90.0), (-180.0, 180.0)),
            Region::bounding_box("WORLD", (-90.0, 90.0), (-180.0, 180.0)),
            Region::bounding_box("EUROPE", (40.0, 72.0), (-10.0, 40.0)),
            Region::bounding_box("NAMERICA", (15.0, 72.0), (-170.0, -50.0)),
            Region::bounding_box("SAMERICA", (-60.0, 15.0), (-105.0, -30.0)),
            Region::bounding_box("ASIA", (0.0, 55.0), (65.0, 155.0)),
            Region::bounding_box("AFRICA", (-35.0, 37.0), (-20.0, 52.0)),
            Region::bounding_box("AUSTRALIA", (-50.0, -10.0), (110.0, 160.0)),
        ];
        Self {
            regions: defaults
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
            custom: BTreeSet::new(),
        }
    }

    pub fn add_custom(&mut self, region: Region) {
        self.custom.insert(region.name.clone());
        self.regions.insert(region.name.clone(), region);
    }

    pub fn get(&self, name: &str) -> Option<&Region> {
        self.regions.get(name)
    }

    pub fn custom_regions(&self) -> impl Iterator<Item = &Region> {
        self.custom.iter().filter_map(|name| self.regions.get(name))
    }

    /// Parse `filter_name` of the form `<REGION>[-wMOUNTAINS|-noMOUNTAINS]`.
    pub fn parse_filter(&self, filter_name: &str) -> Result<RegionFilter> {
        let (region_name, exclude_mountains) = match filter_name.rsplit_once('-') {
            Some((name, "noMOUNTAINS")) => (name, true),
            Some((name, "wMOUNTAINS")) => (name, false),
            _ => (filter_name, false),
        };
        let region = self.get(region_name).cloned().ok_or_else(|| {
            ProcessingError::config(format!(
                "unknown region '{}' in filter '{}'",
                region_name, filter_name
            ))
        })?;
        Ok(RegionFilter {
            name: filter_name.to_string(),
            region,
            exclude_mountains,
        })
    }

    /// Regions to aggregate statistics for, given the filter region and the
    /// sites that passed the filter.
    pub fn evaluation_regions(
        &self,
        filter: &RegionFilter,
        how: RegionsHow,
        sites: &[&Site],
    ) -> Vec<Region> {
        let mut regions = vec![filter.region.clone()];
        match how {
            RegionsHow::Default => {
                for region in self.regions.values() {
                    let is_global = matches!(region.name.as_str(), "ALL" | "WORLD");
                    if region.name != filter.region.name && !is_global {
                        regions.push(region.clone());
                    }
                }
            }
            RegionsHow::Country => {
                let countries: BTreeSet<&str> =
                    sites.iter().filter_map(|s| s.country.as_deref()).collect();
                regions.extend(countries.into_iter().map(Region::country));
                regions.extend(self.custom_regions().cloned());
            }
        }
        regions
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parsing() {
        let registry = RegionRegistry::with_defaults();
        let filter = registry.parse_filter("WORLD-noMOUNTAINS").unwrap();
        assert!(filter.exclude_mountains);
        assert_eq!(filter.region.name, "WORLD");

        let high = Site::new("jfj", "Jungfraujoch", 46.55, 7.98, 3580.0);
        let low = Site::new("bir", "Birkenes", 58.39, 8.25, 219.0);
        assert!(!filter.accepts(&high));
        assert!(filter.accepts(&low));

        let filter = registry.parse_filter("ALL-wMOUNTAINS").unwrap();
        assert!(filter.accepts(&high));

        assert!(registry.parse_filter("MARS-wMOUNTAINS").is_err());
    }

    #[test]
    fn test_custom_region() {
        let mut registry = RegionRegistry::with_defaults();
        let bounds = RegionBounds {
            lat_range: [70.0, 90.0],
            lon_range: [-180.0, 180.0],
            alt_range: None,
        };
        registry.add_custom(Region::from_bounds("Arctic", &bounds).unwrap());
        let arctic = registry.get("Arctic").unwrap();
        assert!(arctic.contains(&Site::new("zep", "Zeppelin", 78.9, 11.9, 475.0)));
        assert!(!arctic.contains(&Site::new("bir", "Birkenes", 58.39, 8.25, 219.0)));
    }

    #[test]
    fn test_country_regions() {
        let registry = RegionRegistry::with_defaults();
        let filter = registry.parse_filter("EUROPE").unwrap();
        let a = Site::new("a", "a", 50.0, 10.0, 0.0).with_country("DE");
        let b = Site::new("b", "b", 60.0, 10.0, 0.0).with_country("NO");
        let c = Site::new("c", "c", 61.0, 10.0, 0.0).with_country("NO");
        let regions = registry.evaluation_regions(&filter, RegionsHow::Country, &[&a, &b, &c]);
        let names: Vec<&str> = regions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["EUROPE", "DE", "NO"]);
        assert!(regions[2].contains(&b));
        assert!(!regions[2].contains(&a));
    }
}
