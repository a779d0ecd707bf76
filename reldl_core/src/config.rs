use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::error::DownloadError;

/// Default chunk size (8 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default maximum number of concurrent chunk fetches.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tunables for one download session.
///
/// Durations are stored in milliseconds so the struct maps directly onto a
/// JSON settings file; use the accessor methods to get `Duration`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub chunk_size_bytes: u64,
    pub max_concurrency: usize,
    /// Total attempts per chunk (and for the probe), first try included.
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Fraction of each backoff delay that may be randomly shaved off, 0.0..=1.0.
    pub retry_jitter: f64,
    pub chunk_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub session_timeout_ms: Option<u64>,
    pub verify_integrity: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            retry_jitter: 0.5,
            chunk_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
            session_timeout_ms: None,
            verify_integrity: true,
        }
    }
}

impl DownloadOptions {
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_delay_ms = base.as_millis() as u64;
        self.max_retry_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        let fail = |msg: &str| Err(DownloadError::InvalidOptions(msg.to_string()));
        if self.chunk_size_bytes == 0 {
            return fail("chunk_size_bytes must be positive");
        }
        if self.max_concurrency == 0 {
            return fail("max_concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return fail("base_retry_delay_ms must not exceed max_retry_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return fail("retry_jitter must be within 0.0..=1.0");
        }
        if self.chunk_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return fail("timeouts must be positive");
        }
        if self.session_timeout_ms == Some(0) {
            return fail("session_timeout_ms must be positive when set");
        }
        Ok(())
    }
}

/// Settings file for a single download job.
///
/// ```json
/// {
///   "source_url": "https://example.com/big.iso",
///   "destination": "big.iso",
///   "options": { "chunk_size_bytes": 16777216, "max_concurrency": 8 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDownloadSettings {
    pub source_url: Option<String>,
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub options: DownloadOptions,
}

impl FileDownloadSettings {
    pub fn from_json(text: &str) -> Result<Self, DownloadError> {
        serde_json::from_str(text)
            .map_err(|e| DownloadError::InvalidOptions(format!("settings file: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self, DownloadError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }
}
