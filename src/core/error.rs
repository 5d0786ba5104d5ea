use std::path::PathBuf;

use thiserror::Error;

use super::types::{IndexRole, Quarter};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RevisionError {
    #[error("malformed quarter {0:?}: expected YYYY-T1..YYYY-T4")]
    MalformedQuarter(String),

    #[error("{quarter} minus {years} year(s) falls before year 0")]
    OffsetOutOfRange { quarter: Quarter, years: u16 },

    #[error("invalid current rent {0}: must be a positive amount")]
    InvalidRent(f64),

    #[error("index table is empty or failed to load")]
    EmptyIndexSource,

    #[error("reference index unavailable for {quarter}")]
    MissingReferenceIndex { quarter: Quarter },

    #[error("revision index unavailable for {quarter}")]
    MissingRevisionIndex { quarter: Quarter },

    #[error("{} index unavailable for {quarter}", .role.label())]
    MissingIntermediateIndex { role: IndexRole, quarter: Quarter },
}

impl RevisionError {
    pub fn code(&self) -> &'static str {
        match self {
            RevisionError::MalformedQuarter(_) => "malformed-quarter",
            RevisionError::OffsetOutOfRange { .. } => "offset-out-of-range",
            RevisionError::InvalidRent(_) => "invalid-rent",
            RevisionError::EmptyIndexSource => "empty-index-source",
            RevisionError::MissingReferenceIndex { .. } => "missing-reference-index",
            RevisionError::MissingRevisionIndex { .. } => "missing-revision-index",
            RevisionError::MissingIntermediateIndex { .. } => "missing-intermediate-index",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RevisionError::MalformedQuarter(_)
            | RevisionError::OffsetOutOfRange { .. }
            | RevisionError::InvalidRent(_) => 2,
            RevisionError::MissingReferenceIndex { .. } => 3,
            RevisionError::MissingRevisionIndex { .. }
            | RevisionError::MissingIntermediateIndex { .. } => 4,
            RevisionError::EmptyIndexSource => 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexSourceError {
    #[error("failed to read index source {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON index source: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid spreadsheet index source: {0}")]
    Workbook(#[from] calamine::Error),
}
