use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::coordinates::{persisted_fields, ERROR_SENTINEL};
use crate::errors::{AppError, AppResult};
use crate::outcome::ResolutionOutcome;

/// Persisted columns after the identifier column, in order.
pub const PERSISTED_COLUMNS: [&str; 6] = ["Address", "url", "returned_url", "lat", "long", "tier"];

/// Durable sink for resolution outcomes, one row per call.
pub trait OutcomeStore {
    fn append(&mut self, outcome: &ResolutionOutcome) -> AppResult<()>;

    fn path(&self) -> &Path;
}

/// Append-only CSV store. Every append is flushed and synced before return.
pub struct CsvOutcomeStore {
    path: PathBuf,
    id_column: String,
}

impl CsvOutcomeStore {
    pub fn new(path: impl Into<PathBuf>, id_column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id_column: id_column.into(),
        }
    }

    pub fn header(&self) -> Vec<&str> {
        let mut header = Vec::with_capacity(PERSISTED_COLUMNS.len() + 1);
        header.push(self.id_column.as_str());
        header.extend(PERSISTED_COLUMNS);
        header
    }
}

impl OutcomeStore for CsvOutcomeStore {
    fn append(&mut self, outcome: &ResolutionOutcome) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let write_header = file.metadata()?.len() == 0;

        let mut buffer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if write_header {
            buffer.write_record(self.header())?;
        }
        let (lat, lng) = persisted_fields(outcome.coordinates);
        buffer.write_record([
            outcome.id.as_str(),
            outcome.address.as_str(),
            outcome.target_used.as_str(),
            outcome.resolved.as_str(),
            lat.as_str(),
            lng.as_str(),
            outcome.tier.as_str(),
        ])?;
        let bytes = buffer
            .into_inner()
            .map_err(|err| AppError::Io(err.into_error()))?;

        // One write per row so a crash leaves either the full row or nothing.
        file.write_all(&bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Diagnostic counts over a store after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreTally {
    pub rows: usize,
    pub with_coordinates: usize,
    pub with_error: usize,
    pub distinct_ids: usize,
    #[serde(skip)]
    pub ids: HashSet<String>,
}

pub fn tally_store(path: &Path, id_column: &str) -> AppResult<StoreTally> {
    if !path.exists() || fs::metadata(path)?.len() == 0 {
        return Ok(StoreTally::default());
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|header| header.trim() == name);
    let id_position = column(id_column);
    let lat_position = column("lat");

    let mut tally = StoreTally::default();
    for record in reader.records() {
        let record = record?;
        tally.rows += 1;
        if let Some(id) = id_position.and_then(|i| record.get(i)) {
            tally.ids.insert(id.trim().to_string());
        }
        match lat_position.and_then(|i| record.get(i)) {
            Some(lat) if lat.trim() != ERROR_SENTINEL && !lat.trim().is_empty() => {
                tally.with_coordinates += 1
            }
            _ => tally.with_error += 1,
        }
    }
    tally.distinct_ids = tally.ids.len();
    Ok(tally)
}
