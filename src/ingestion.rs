use std::collections::HashSet;
use std::path::Path;

use csv::StringRecord;
use serde::Serialize;
use tracing::info;

use crate::config::ColumnMap;
use crate::errors::{AppError, AppResult};

/// One row of the input universe. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressRecord {
    pub id: String,
    pub address: String,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub target: String,
    pub fallback_target: Option<String>,
}

impl AddressRecord {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            locality: None,
            region: None,
            postal_code: None,
            target: target.into(),
            fallback_target: None,
        }
    }

    pub fn with_locality(mut self, locality: &str, region: &str) -> Self {
        self.locality = non_empty(locality);
        self.region = non_empty(region);
        self
    }

    pub fn with_fallback(mut self, target: &str) -> Self {
        self.fallback_target = non_empty(target);
        self
    }

    /// The fallback target, when present and different from the primary.
    pub fn distinct_fallback(&self) -> Option<&str> {
        self.fallback_target
            .as_deref()
            .filter(|fallback| fallback.trim() != self.target.trim())
    }
}

/// Resolved header positions for one input table.
struct ColumnIndex {
    unique_id: usize,
    target: usize,
    fallback_target: Option<usize>,
    address: Option<usize>,
    locality: Option<usize>,
    region: Option<usize>,
    postal_code: Option<usize>,
}

impl ColumnIndex {
    fn resolve(headers: &StringRecord, columns: &ColumnMap) -> AppResult<Self> {
        let position = |name: &str| headers.iter().position(|header| header == name);
        let required = |name: &str| {
            position(name).ok_or_else(|| AppError::MissingColumn {
                column: name.to_string(),
                source_name: "input table".into(),
                available: headers.iter().collect::<Vec<_>>().join(", "),
            })
        };

        Ok(Self {
            unique_id: required(&columns.unique_id)?,
            target: required(&columns.target)?,
            fallback_target: position(&columns.fallback_target),
            address: position(&columns.address).or_else(|| position("full_address")),
            locality: position(&columns.locality),
            region: position(&columns.region),
            postal_code: position(&columns.postal_code),
        })
    }

    fn field(record: &StringRecord, index: Option<usize>) -> Option<String> {
        index
            .and_then(|i| record.get(i))
            .and_then(non_empty)
    }

    fn build(&self, record: &StringRecord) -> Option<AddressRecord> {
        let id = record.get(self.unique_id).and_then(non_empty)?;
        let target = record.get(self.target).map(str::trim).unwrap_or_default();
        Some(AddressRecord {
            id,
            address: Self::field(record, self.address).unwrap_or_default(),
            locality: Self::field(record, self.locality),
            region: Self::field(record, self.region),
            postal_code: Self::field(record, self.postal_code),
            target: target.to_string(),
            fallback_target: Self::field(record, self.fallback_target),
        })
    }
}

/// Loads the full input universe.
///
/// Fails fast when the unique-identifier or primary-target column is missing,
/// or when an identifier repeats. Rows with a blank identifier are rejected
/// as well since they could never be matched on resume.
pub fn load_universe(path: &Path, columns: &ColumnMap) -> AppResult<Vec<AddressRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let index = ColumnIndex::resolve(&headers, columns)?;

    let mut seen = HashSet::new();
    let mut universe = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let address = index.build(&record).ok_or_else(|| {
            AppError::Config(format!(
                "input row {line} has an empty '{}' value",
                columns.unique_id
            ))
        })?;
        if !seen.insert(address.id.clone()) {
            return Err(AppError::Config(format!(
                "input row {line} repeats {} '{}'; identifiers must be unique",
                columns.unique_id, address.id
            )));
        }
        universe.push(address);
    }

    let with_fallback = universe
        .iter()
        .filter(|record| record.fallback_target.is_some())
        .count();
    info!(
        target: "ingestion",
        path = %path.display(),
        records = universe.len(),
        with_fallback,
        "input universe loaded"
    );
    Ok(universe)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    const SAMPLE: &str = "\
id,Address,city,state,zip,url,url_fallback
0,123 Main St,Springfield,IL,62701,https://www.google.com/maps/search/123%20Main%20St,Springfield IL
1,9 Elm Rd,Anytown,CA,,https://www.google.com/maps/search/9%20Elm%20Rd,
";

    #[test]
    fn loads_records_with_optional_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ready.csv");
        fs::write(&path, SAMPLE).unwrap();

        let universe = load_universe(&path, &ColumnMap::default()).unwrap();
        assert_eq!(universe.len(), 2);
        let first = &universe[0];
        assert_eq!(first.id, "0");
        assert_eq!(first.locality.as_deref(), Some("Springfield"));
        assert_eq!(first.postal_code.as_deref(), Some("62701"));
        assert_eq!(first.distinct_fallback(), Some("Springfield IL"));
        let second = &universe[1];
        assert_eq!(second.postal_code, None);
        assert_eq!(second.fallback_target, None);
    }

    #[test]
    fn missing_identifier_column_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ready.csv");
        fs::write(&path, SAMPLE).unwrap();
        let columns = ColumnMap {
            unique_id: "parcel".into(),
            ..ColumnMap::default()
        };

        let err = load_universe(&path, &columns).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("parcel"));
        assert!(err.to_string().contains("url_fallback"));
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dupes.csv");
        fs::write(&path, "id,url\n7,https://a\n7,https://b\n").unwrap();

        let err = load_universe(&path, &ColumnMap::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn identical_fallback_is_not_distinct() {
        let record = AddressRecord::new("1", "x", "https://maps/search/x")
            .with_fallback(" https://maps/search/x ");
        assert_eq!(record.distinct_fallback(), None);
    }
}
