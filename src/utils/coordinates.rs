use crate::error::{ProcessingError, Result};

/// Calculate the distance between two points using the Haversine formula
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Check that a `[low, high]` pair is ordered and finite.
pub fn validate_range(name: &str, range: (f64, f64)) -> Result<()> {
    let (low, high) = range;
    if !low.is_finite() || !high.is_finite() || low > high {
        return Err(ProcessingError::InvalidCoordinate(format!(
            "{} range [{}, {}] is not an ordered finite interval",
            name, low, high
        )));
    }
    Ok(())
}

/// Longitude containment that also handles boxes crossing the dateline,
/// e.g. `[170, -170]`.
pub fn longitude_in_range(longitude: f64, range: (f64, f64)) -> bool {
    let (west, east) = range;
    if west <= east {
        (west..=east).contains(&longitude)
    } else {
        longitude >= west || longitude <= east
    }
}
