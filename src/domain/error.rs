//! Error taxonomy
//!
//! Every variant here has a local recovery path; none of them is allowed to
//! unwind the poll loop.

use std::time::Duration;
use thiserror::Error;

/// Malformed coordinate input. The offending side or point is dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unsupported coordinate shape: {raw}")]
    UnsupportedShape { raw: String },

    #[error("non-numeric coordinate: {raw}")]
    NotNumeric { raw: String },

    #[error("coordinate out of range ({latitude}, {longitude}): {raw}")]
    OutOfRange { raw: String, latitude: f64, longitude: f64 },
}

impl ParseError {
    /// The original raw value, rendered as text
    pub fn raw(&self) -> &str {
        match self {
            ParseError::UnsupportedShape { raw }
            | ParseError::NotNumeric { raw }
            | ParseError::OutOfRange { raw, .. } => raw,
        }
    }
}

/// Failure talking to the data provider. Recovered via backoff.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode provider payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Degenerate or unrecognised zone geometry. Recovered by omission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("zone {zone:?} has unknown type {kind:?}")]
    UnknownZoneType { zone: String, kind: String },

    #[error("zone {zone:?} has {resolved} resolvable points, needs {required}")]
    Degenerate { zone: String, resolved: usize, required: usize },
}
