//! Resilient chunked HTTP downloads with durable resume.

pub mod config;
pub mod downloader;
pub mod progress;
pub mod transport;
pub mod types;

pub use config::{DownloadOptions, FileDownloadSettings};
pub use downloader::reliable_downloader::{download_to_file, ReliableDownloader};
pub use types::error::{DownloadError, ErrorKind, LedgerError, TransportError};
pub use types::types::{file_name_from_url, DownloadOutcome, DownloadWarning};
