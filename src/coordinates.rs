use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Persisted in place of a coordinate when none could be extracted.
pub const ERROR_SENTINEL: &str = "error";

static VIEWPORT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/@(-?\d{1,3}(?:\.\d+)?),(-?\d{1,3}(?:\.\d+)?),(\d{1,2}(?:\.\d+)?)z")
        .expect("viewport marker pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let in_range = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        in_range.then_some(Self { lat, lng })
    }

    /// Renders the viewport segment a maps URL carries for this point.
    pub fn marker(&self, zoom: u8) -> String {
        format!("/@{},{},{}z", self.lat, self.lng, zoom)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Pulls the `/@lat,lng,zoomz` viewport out of a resolved maps location.
///
/// Returns `None` for anything that does not carry a well-formed, in-range
/// pair. Never panics on arbitrary input.
pub fn extract_coordinates(resolved: &str) -> Option<Coordinates> {
    let captures = VIEWPORT_MARKER.captures(resolved)?;
    let lat = captures.get(1)?.as_str().parse::<f64>().ok()?;
    let lng = captures.get(2)?.as_str().parse::<f64>().ok()?;
    Coordinates::new(lat, lng)
}

/// Formats an optional coordinate pair as the persisted `(lat, long)` fields.
pub fn persisted_fields(coordinates: Option<Coordinates>) -> (String, String) {
    match coordinates {
        Some(point) => (point.lat.to_string(), point.lng.to_string()),
        None => (ERROR_SENTINEL.to_string(), ERROR_SENTINEL.to_string()),
    }
}
