use std::time::Duration;

use thiserror::Error;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Timeouts, resets, 408/429 and 5xx answers.
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("permanent transport failure{}: {message}", status_suffix(.status))]
    Permanent { status: Option<u16>, message: String },

    /// The origin rejected the requested range; its size no longer matches the probe.
    #[error("range bytes={start}-{end} not satisfiable; resource must be re-probed")]
    RangeNotSatisfiable { start: u64, end: u64 },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Transient(_) => ErrorKind::Transient,
            TransportError::Permanent { .. } | TransportError::RangeNotSatisfiable { .. } => {
                ErrorKind::Permanent
            }
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TransportError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, context: &str) -> Self {
        let message = format!("{} returned HTTP {}", context, status);
        match status {
            408 | 425 | 429 | 500..=599 => TransportError::Transient(message),
            _ => TransportError::Permanent {
                status: Some(status),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return TransportError::from_status(status.as_u16(), "request");
        }
        if err.is_builder() || err.is_redirect() {
            TransportError::permanent(err.to_string())
        } else {
            // connect, timeout, body and decode errors are all network weather
            TransportError::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("integrity mismatch: expected MD5 {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("session deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("invalid download options: {0}")]
    InvalidOptions(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl DownloadError {
    /// Cancellation and deadlines are caller-driven, not faults.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DownloadError::Cancelled | DownloadError::DeadlineExceeded(_))
    }
}
