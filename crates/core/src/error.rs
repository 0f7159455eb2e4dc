use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("moment not found: {0}")]
    NotFound(String),

    #[error("moment id already exists: {0}")]
    DuplicateId(String),

    #[error("moment store not initialized")]
    NotInitialized,

    #[error("cancelled")]
    Cancelled,

    #[error("media error: {0}")]
    Media(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Metadata(#[from] MetadataErrors),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("could not save moment: {0}")]
    Persistence(String),

    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
}

/// Reasons an imported or captured asset is refused before cropping starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("file is too large ({size_bytes} bytes, limit is {max_bytes} bytes)")]
    FileTooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("video is too short ({duration_secs:.1}s, at least {required_secs:.1}s required)")]
    TooShort {
        duration_secs: f64,
        required_secs: f64,
    },

    #[error("unsupported format: {mime_type}")]
    UnsupportedFormat { mime_type: String },
}

/// Failure outcome of one processing run. Carried as a value, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("source video unavailable: {0}")]
    SourceUnavailable(String),

    #[error("trimmed output missing: {0}")]
    OutputMissing(String),

    #[error("processing failed: {0}")]
    UnderlyingFailure(String),

    #[error("processing cancelled")]
    Cancelled,
}

/// Field-level metadata problems; every violated field is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataErrors {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl MetadataErrors {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

impl fmt::Display for MetadataErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = [self.name.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if messages.is_empty() {
            write!(f, "invalid metadata")
        } else {
            write!(f, "{}", messages.join("; "))
        }
    }
}

impl std::error::Error for MetadataErrors {}
