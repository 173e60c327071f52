//! The typed error taxonomy shared by every component.
//!
//! Callers that need to distinguish "not found" from "the network is down"
//! match on [`Error`] rather than parsing message strings. The CLI binary
//! wraps these in `anyhow::Error` with additional context as they propagate
//! up to `main`.

use thiserror::Error;

/// A component-tagged, typed error.
///
/// Variants map 1:1 onto the taxonomy table in the design notes: each is
/// either terminal for the current call (`Decode`, `Schema`, `ModeConflict`,
/// `Timeout`), surfaced for the caller to retry (`Transport`), returned as a
/// normal result rather than an exception (`NotFound`), or a degraded-but-
/// continuing condition (`AuthToken`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("transport error during {operation}: {message}")]
    TransportOther { operation: String, message: String },

    #[error("device token unavailable: {reason}")]
    AuthToken { reason: String },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("MSI table '{table}' has no _Columns metadata")]
    Schema { table: String },

    #[error("MSI mode transition requires a prior Commit (was {from}, requested {to})")]
    ModeConflict { from: String, to: String },

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn decode(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(operation: impl Into<String>, source: ureq::Error) -> Self {
        match &source {
            ureq::Error::Status(404, _) => Self::NotFound {
                what: operation.into(),
            },
            _ => Self::Transport {
                operation: operation.into(),
                source: Box::new(source),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
