//! Error types for property-reconciliation.

use thiserror::Error;

/// Infrastructure-level errors. Batch-scoped faults (bad CSV rows, confirm
/// collisions) are reported through the batch entity instead and use the
/// dedicated kinds below.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

/// Statement ingestion errors. Any one of these aborts ingestion for the
/// whole file; no partially ingested batch may exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("row {row}: missing required column '{column}'")]
    MissingColumn { row: usize, column: String },

    #[error("row {row}: unparsable date '{value}'")]
    UnparsableDate { row: usize, value: String },

    #[error("row {row}: unparsable amount '{value}'")]
    UnparsableAmount { row: usize, value: String },

    #[error("row {row}: malformed record: {message}")]
    MalformedRecord { row: usize, message: String },

    #[error("unsupported statement encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("statement has no header row")]
    MissingHeader,
}

impl IngestError {
    /// Source row the error refers to, when one exists.
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::MissingColumn { row, .. }
            | Self::UnparsableDate { row, .. }
            | Self::UnparsableAmount { row, .. }
            | Self::MalformedRecord { row, .. } => Some(*row),
            Self::UnsupportedEncoding(_) | Self::MissingHeader => None,
        }
    }
}

/// Errors from the external payment store while confirming a match.
#[derive(Debug, Error)]
pub enum ConfirmError {
    /// The payment was already confirmed, e.g. by a racing batch for an
    /// overlapping snapshot. The transaction is reclassified unmatched.
    #[error("payment already claimed: {0}")]
    AlreadyClaimed(String),

    /// The payment no longer exists or moved to a non-confirmable state.
    #[error("payment not confirmable: {0}")]
    NotConfirmable(String),

    #[error(transparent)]
    Infra(#[from] AppError),
}
