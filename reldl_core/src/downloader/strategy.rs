use crate::downloader::chunk_planner;
use crate::types::error::DownloadError;
use crate::types::types::{ChunkRange, ContentDescriptor};

/// How a session moves bytes. Chosen once during planning; the only later
/// change is the fallback from `Chunked` to `WholeFile` when the origin
/// ignores range requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStrategy {
    /// One plain GET streamed from offset 0.
    WholeFile { expected_len: Option<u64> },
    /// Parallel range requests, one per chunk.
    Chunked { chunk_size: u64, chunks: Vec<ChunkRange> },
}

impl TransferStrategy {
    pub fn select(descriptor: &ContentDescriptor, chunk_size: u64) -> Result<Self, DownloadError> {
        match descriptor.total_size {
            Some(total) if descriptor.supports_ranges && total > 0 => Ok(TransferStrategy::Chunked {
                chunk_size,
                chunks: chunk_planner::plan(total, chunk_size)?,
            }),
            expected_len => Ok(TransferStrategy::WholeFile { expected_len }),
        }
    }

    /// Number of independently tracked units; whole-file counts as one.
    pub fn unit_count(&self) -> usize {
        match self {
            TransferStrategy::WholeFile { .. } => 1,
            TransferStrategy::Chunked { chunks, .. } => chunks.len(),
        }
    }

    /// Chunk size recorded in the ledger key.
    pub fn ledger_chunk_size(&self) -> Option<u64> {
        match self {
            TransferStrategy::WholeFile { .. } => None,
            TransferStrategy::Chunked { chunk_size, .. } => Some(*chunk_size),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, TransferStrategy::Chunked { .. })
    }
}
