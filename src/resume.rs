use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::ingestion::AddressRecord;

/// What an existing output store tells us about completed work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedIds {
    Absent,
    Present(HashSet<String>),
    /// The store exists but cannot be matched against the universe.
    Unusable(String),
}

impl PersistedIds {
    pub fn contains(&self, id: &str) -> bool {
        match self {
            PersistedIds::Present(ids) => ids.contains(id),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PersistedIds::Present(ids) => ids.len(),
            _ => 0,
        }
    }
}

/// Where this run appends, plus the ids already there.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub store_path: PathBuf,
    pub persisted: PersistedIds,
    /// Set when the configured store was unusable and left untouched.
    pub redirected_from: Option<PathBuf>,
}

pub fn read_persisted_ids(path: &Path, id_column: &str) -> PersistedIds {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => return PersistedIds::Absent,
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return PersistedIds::Absent,
        Err(err) => return PersistedIds::Unusable(format!("cannot stat store: {err}")),
    }

    let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(err) => return PersistedIds::Unusable(format!("cannot open store: {err}")),
    };
    let position = match reader.headers() {
        Ok(headers) => match headers.iter().position(|header| header.trim() == id_column) {
            Some(position) => position,
            None => {
                return PersistedIds::Unusable(format!(
                    "store header lacks the '{id_column}' column"
                ))
            }
        },
        Err(err) => return PersistedIds::Unusable(format!("cannot read store header: {err}")),
    };

    let mut ids = HashSet::new();
    for record in reader.records() {
        match record {
            Ok(record) => {
                if let Some(id) = record.get(position).map(str::trim).filter(|id| !id.is_empty()) {
                    ids.insert(id.to_string());
                }
            }
            Err(err) => return PersistedIds::Unusable(format!("cannot parse store: {err}")),
        }
    }
    PersistedIds::Present(ids)
}

/// Universe records not yet represented in the store, in input order.
pub fn pending<'a>(
    universe: &'a [AddressRecord],
    persisted: &PersistedIds,
) -> Vec<&'a AddressRecord> {
    universe
        .iter()
        .filter(|record| !persisted.contains(&record.id))
        .collect()
}

/// `<stem>.resume.<ext>` next to the configured store.
pub fn sibling_store(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "geocoded".into());
    let name = match path.extension() {
        Some(ext) => format!("{stem}.resume.{}", ext.to_string_lossy()),
        None => format!("{stem}.resume"),
    };
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(name)
}

/// Picks the store to append to.
///
/// An unusable store is never appended to. Output moves to a sibling store,
/// and resume continues from that sibling on later runs. If the sibling is
/// unusable too, the user has to merge or move files before re-running.
pub fn plan_store(output: &Path, id_column: &str) -> AppResult<ResumePlan> {
    let reason = match read_persisted_ids(output, id_column) {
        PersistedIds::Unusable(reason) => reason,
        persisted => {
            info!(
                target: "resume",
                path = %output.display(),
                already_persisted = persisted.len(),
                "resume state loaded"
            );
            return Ok(ResumePlan {
                store_path: output.to_path_buf(),
                persisted,
                redirected_from: None,
            });
        }
    };

    let sibling = sibling_store(output);
    warn!(
        target: "resume",
        path = %output.display(),
        sibling = %sibling.display(),
        %reason,
        "existing store cannot be used for resume; writing to a separate store"
    );
    match read_persisted_ids(&sibling, id_column) {
        PersistedIds::Unusable(sibling_reason) => Err(AppError::Config(format!(
            "neither '{}' ({reason}) nor '{}' ({sibling_reason}) can be resumed; merge or move them first",
            output.display(),
            sibling.display()
        ))),
        persisted => Ok(ResumePlan {
            store_path: sibling,
            persisted,
            redirected_from: Some(output.to_path_buf()),
        }),
    }
}
