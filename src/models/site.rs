use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::coordinates::haversine_distance;

/// Location a series belongs to: an observation station or a model grid cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Site {
    #[validate(length(min = 1))]
    pub id: String,

    pub name: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 360.0))]
    pub longitude: f64,

    #[validate(range(min = -500.0, max = 9000.0))]
    pub altitude: f64,

    pub country: Option<String>,
}

impl Site {
    pub fn new(id: &str, name: &str, latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            latitude,
            longitude,
            altitude,
            country: None,
        }
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = Some(country.to_uppercase());
        self
    }

    /// Longitude folded into [-180, 180).
    pub fn normalized_longitude(&self) -> f64 {
        let lon = (self.longitude + 180.0).rem_euclid(360.0) - 180.0;
        if lon == -180.0 && self.longitude > 0.0 {
            180.0
        } else {
            lon
        }
    }

    pub fn distance_km(&self, other: &Site) -> f64 {
        haversine_distance(
            self.latitude,
            self.normalized_longitude(),
            other.latitude,
            other.normalized_longitude(),
        )
    }

    pub fn is_in_country(&self, code: &str) -> bool {
        self.country
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(code))
    }
}
