use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("column '{column}' not found in {source_name}; available columns: {available}")]
    MissingColumn {
        column: String,
        source_name: String,
        available: String,
    },
    #[error("{0}")]
    Config(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Errors that must stop the process before any record is attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(self, AppError::MissingColumn { .. } | AppError::Config(_))
    }
}
