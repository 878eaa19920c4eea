use thiserror::Error;

use crate::syntax::SyntaxError;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("No such file or resource: {0}")]
    NotFound(String),

    #[error("Not in the coverage path set: {0}")]
    NotTracked(String),

    #[error("Invalid cache blob: {0}")]
    InvalidBlob(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoverageError>;
