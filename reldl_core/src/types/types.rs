use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::downloader::sink::Sink;

/// What to fetch and where to put it. Lives for exactly one session.
#[derive(Clone)]
pub struct DownloadTarget {
    pub url: String,
    pub sink: Arc<dyn Sink>,
}

impl DownloadTarget {
    pub fn new(url: impl Into<String>, sink: Arc<dyn Sink>) -> Self {
        Self {
            url: url.into(),
            sink,
        }
    }
}

impl fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTarget")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Server-supplied token used to detect that content changed between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
    ETag(String),
    LastModified(String),
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::ETag(tag) => write!(f, "etag {}", tag),
            Validator::LastModified(date) => write!(f, "last-modified {}", date),
        }
    }
}

/// Everything the capability probe learned about the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub validator: Option<Validator>,
    /// Raw MD5 digest decoded from `Content-MD5`.
    pub integrity_hash: Option<Vec<u8>>,
}

/// Inclusive byte range `[start, end_inclusive]` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end_inclusive: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Completed,
    Failed { attempts: u32, last_error: String },
}

/// Lifecycle of a single download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Probing,
    Planning,
    Transferring,
    Verifying,
    Succeeded,
    Failed,
}

/// Identity of a resume record. A stored record is only trusted when every
/// field matches the freshly probed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerKey {
    pub url: String,
    pub total_size: Option<u64>,
    pub validator: Option<Validator>,
    /// `None` for whole-file transfers.
    pub chunk_size: Option<u64>,
}

impl LedgerKey {
    pub fn new(url: &str, descriptor: &ContentDescriptor, chunk_size: Option<u64>) -> Self {
        Self {
            url: normalize_url(url),
            total_size: descriptor.total_size,
            validator: descriptor.validator.clone(),
            chunk_size,
        }
    }
}

/// Parses the URL and drops the fragment, which never reaches the server.
/// Unparseable input is kept verbatim.
pub fn normalize_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Last non-empty path segment of `url`, e.g. `big.iso` for
/// `https://host/dir/big.iso?x=1`.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Non-fatal conditions the caller must be told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadWarning {
    /// Resume state could not be read or written; the transfer went on without it.
    LedgerUnavailable(String),
    /// No digest was advertised, or verification was switched off.
    IntegrityUnverified,
}

impl fmt::Display for DownloadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadWarning::LedgerUnavailable(reason) => {
                write!(f, "resume ledger unavailable: {}", reason)
            }
            DownloadWarning::IntegrityUnverified => {
                write!(f, "integrity not verified (no Content-MD5, or verification disabled)")
            }
        }
    }
}

/// Result of a successful session.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub integrity_verified: bool,
    pub bytes: u64,
    pub chunks_total: usize,
    /// Chunks taken from the ledger instead of being fetched.
    pub chunks_resumed: usize,
    /// The origin ignored a range request and the session fell back to one stream.
    pub range_fallback: bool,
    pub warnings: Vec<DownloadWarning>,
}

/// Raw progress event emitted by chunk workers.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub chunk_index: u32,
    pub bytes_delta: u64,
    pub total_bytes: Option<u64>,
}
