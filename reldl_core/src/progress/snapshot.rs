use serde::Serialize;

/// Progress of one chunk in the current session.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSnapshot {
    pub chunk_index: u32,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed: f64,
}

/// Aggregate progress for an entire download.
///
/// `total_bytes_downloaded` includes bytes restored from the resume ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub chunks: Vec<ChunkSnapshot>,
    pub total_bytes_downloaded: u64,
    /// Zero while the size is unknown.
    pub total_bytes: u64,
    pub resumed_bytes: u64,
    pub speed: f64,
    pub eta_secs: f64,
    pub done: bool,
}

impl ProgressSnapshot {
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes_downloaded: 0,
            total_bytes: 0,
            resumed_bytes: 0,
            speed: 0.0,
            eta_secs: 0.0,
            done: false,
        }
    }

    /// Completion in percent, if the size is known.
    pub fn percent(&self) -> Option<f64> {
        (self.total_bytes > 0)
            .then(|| self.total_bytes_downloaded as f64 * 100.0 / self.total_bytes as f64)
    }
}

/// Human-readable byte formatting.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
