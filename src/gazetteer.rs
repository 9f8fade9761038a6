use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::coordinates::Coordinates;
use crate::errors::{AppError, AppResult};

const REQUIRED_COLUMNS: [&[&str]; 4] = [
    &["locality", "city", "Locality", "City"],
    &["region", "state", "Region", "State"],
    &["latitude", "lat", "Latitude"],
    &["longitude", "lng", "long", "Longitude"],
];

/// Coarse locality lookup consulted when precise resolution fails.
#[derive(Debug, Clone, Default)]
pub struct Gazetteer {
    entries: HashMap<GazetteerKey, Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GazetteerKey {
    locality: String,
    region: String,
}

impl GazetteerKey {
    pub fn new(locality: &str, region: &str) -> Self {
        Self {
            locality: normalize_key_part(locality),
            region: normalize_key_part(region),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    #[serde(alias = "city", alias = "Locality", alias = "City")]
    locality: String,
    #[serde(alias = "state", alias = "Region", alias = "State")]
    region: String,
    #[serde(alias = "lat", alias = "Latitude")]
    latitude: f64,
    #[serde(alias = "lng", alias = "long", alias = "Longitude")]
    longitude: f64,
}

impl Gazetteer {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the gazetteer from an optional reference table.
    ///
    /// A missing path is silent. A table that cannot be read degrades to an
    /// empty gazetteer with a warning rather than failing the run.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::empty();
        };
        match Self::read(path) {
            Ok(gazetteer) => {
                info!(
                    target: "gazetteer",
                    path = %path.display(),
                    entries = gazetteer.len(),
                    "reference gazetteer loaded"
                );
                gazetteer
            }
            Err(err) => {
                warn!(
                    target: "gazetteer",
                    path = %path.display(),
                    error = %err,
                    "reference gazetteer unavailable; continuing with primary resolution only"
                );
                Self::empty()
            }
        }
    }

    fn read(path: &Path) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        for aliases in REQUIRED_COLUMNS {
            if !headers.iter().any(|header| aliases.contains(&header)) {
                return Err(AppError::MissingColumn {
                    column: aliases[0].to_string(),
                    source_name: "gazetteer table".into(),
                    available: headers.iter().collect::<Vec<_>>().join(", "),
                });
            }
        }

        let mut gazetteer = Self::empty();
        for (index, row) in reader.deserialize::<ReferenceRow>().enumerate() {
            match row {
                Ok(row) => match Coordinates::new(row.latitude, row.longitude) {
                    Some(point) => gazetteer.insert(&row.locality, &row.region, point),
                    None => {
                        debug!(target: "gazetteer", row = index + 1, "skipping out-of-range entry")
                    }
                },
                Err(err) => {
                    debug!(
                        target: "gazetteer",
                        row = index + 1,
                        error = %err,
                        "skipping malformed entry"
                    );
                }
            }
        }
        Ok(gazetteer)
    }

    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, Coordinates)>,
    {
        let mut gazetteer = Self::empty();
        for (locality, region, point) in entries {
            gazetteer.insert(locality, region, point);
        }
        gazetteer
    }

    pub fn insert(&mut self, locality: &str, region: &str, point: Coordinates) {
        let key = GazetteerKey::new(locality, region);
        if key.locality.is_empty() {
            return;
        }
        self.entries.insert(key, point);
    }

    pub fn lookup(&self, locality: &str, region: &str) -> Option<Coordinates> {
        self.entries.get(&GazetteerKey::new(locality, region)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn normalize_key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
